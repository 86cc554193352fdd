//! Runtime values.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

pub mod exception;
pub mod object;

pub use exception::{Exception, VmError, VmResult};
pub use object::{Callee, ClosureCell, Finalizable, Instance, Object};

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Undefined,
    Int(i64),
    Float(f64),
    Bool(bool),
    Rune(char),
    String(Arc<str>),
    Bytes(Rc<RefCell<Vec<u8>>>),
    Array(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<BTreeMap<String, Value>>>),
    Func(usize),
    NativeFunc(usize),
    Object(Rc<dyn Object>),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Arc::from(s.as_ref()))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn map(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    pub fn bytes(b: Vec<u8>) -> Self {
        Value::Bytes(Rc::new(RefCell::new(b)))
    }

    pub fn object(o: impl Object + 'static) -> Self {
        Value::Object(Rc::new(o))
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Undefined => "undefined",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Rune(_) => "rune",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Func(_) => "function",
            Value::NativeFunc(_) => "native function",
            Value::Object(o) => o.type_name(),
        }
    }

    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null | Value::Undefined => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Weight charged against the allocation limit. Containers count as one
    /// so that self-referencing values stay cheap to measure.
    pub fn size(&self) -> usize {
        match self {
            Value::String(s) => s.len(),
            _ => 1,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Rune(c) => Some(*c as u32 as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The string conversion used by concatenation and thrown values.
    pub fn to_text(&self) -> String {
        match self {
            Value::String(s) => s.to_string(),
            Value::Float(f) => format_float_short(*f),
            Value::Bytes(b) => String::from_utf8_lossy(&b.borrow()).into_owned(),
            Value::Object(o) => o.to_text(),
            other => other.to_string(),
        }
    }

    /// Same type and same value. Reference types compare by identity.
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) | (Value::Undefined, Value::Undefined) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Rune(a), Value::Rune(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => a == b,
            (Value::NativeFunc(a), Value::NativeFunc(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Loose equality with the numeric, boolean and rune coercions.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null | Value::Undefined, Value::Null | Value::Undefined) => true,
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_))
            | (Value::Int(_), Value::Rune(_))
            | (Value::Rune(_), Value::Int(_)) => self.as_float() == other.as_float(),
            (Value::Int(i), Value::Bool(b)) | (Value::Bool(b), Value::Int(i)) => {
                (*b && *i == 1) || (!*b && *i == 0)
            }
            (Value::String(s), Value::Rune(c)) | (Value::Rune(c), Value::String(s)) => {
                let mut chars = s.chars();
                chars.next() == Some(*c) && chars.next().is_none()
            }
            _ => self.strict_equals(other),
        }
    }

    /// Converts to plain data for embedding in JSON.
    pub fn export(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Null | Value::Undefined => J::Null,
            Value::Int(i) => J::from(*i),
            Value::Float(f) => J::from(*f),
            Value::Bool(b) => J::Bool(*b),
            Value::Rune(c) => J::String(c.to_string()),
            Value::String(s) => J::String(s.to_string()),
            Value::Bytes(b) => J::Array(b.borrow().iter().map(|x| J::from(*x)).collect()),
            Value::Array(a) => J::Array(a.borrow().iter().map(Value::export).collect()),
            Value::Map(m) => J::Object(m.borrow().iter().map(|(k, v)| (k.clone(), v.export())).collect()),
            Value::Func(_) => J::String("[function]".into()),
            Value::NativeFunc(_) => J::String("[native function]".into()),
            Value::Object(o) => o.export(),
        }
    }
}

fn format_float_short(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e21 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Undefined => f.write_str("undefined"),
            Value::Int(i) => write!(f, "{}", i),
            // zero is printed without sign
            Value::Float(x) if *x == 0.0 => f.write_str("0"),
            Value::Float(x) => write!(f, "{:.6}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Rune(c) => write!(f, "{}", c),
            Value::String(s) => {
                let s: String = s.chars().take(200).collect();
                f.write_str(&s)
            }
            Value::Bytes(b) => {
                let b = b.borrow();
                let text = String::from_utf8_lossy(&b[..b.len().min(30)]).into_owned();
                f.write_str(&text)
            }
            Value::Array(_) => f.write_str("[array]"),
            Value::Map(_) => f.write_str("[map]"),
            Value::Func(_) => f.write_str("[function]"),
            Value::NativeFunc(_) => f.write_str("[native function]"),
            Value::Object(o) => f.write_str(&o.to_text()),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(Value::string("a").is_truthy());
        assert!(Value::array(vec![]).is_truthy());
    }

    #[test]
    fn strict_equality_requires_same_type() {
        assert!(Value::Int(1).strict_equals(&Value::Int(1)));
        assert!(!Value::Int(1).strict_equals(&Value::Float(1.0)));
        assert!(Value::Null.strict_equals(&Value::Null));
        assert!(!Value::Null.strict_equals(&Value::Undefined));
        assert!(Value::string("a").strict_equals(&Value::string("a")));
    }

    #[test]
    fn loose_equality_coercions() {
        assert!(Value::Int(1).equals(&Value::Float(1.0)));
        assert!(!Value::Float(1.000000000000001).equals(&Value::Int(1)));
        assert!(Value::Bool(true).equals(&Value::Int(1)));
        assert!(!Value::Bool(true).equals(&Value::Int(2)));
        assert!(Value::Bool(false).equals(&Value::Int(0)));
        assert!(Value::string("a").equals(&Value::Rune('a')));
        assert!(!Value::string("ab").equals(&Value::Rune('a')));
        assert!(Value::Null.equals(&Value::Undefined));
        assert!(!Value::Int(0).equals(&Value::Null));
        assert!(!Value::string("1").equals(&Value::Int(1)));
    }

    #[test]
    fn arrays_compare_by_identity() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = Value::array(vec![Value::Int(1)]);
        assert!(a.equals(&a.clone()));
        assert!(!a.equals(&b));
    }

    #[test]
    fn size_counts_string_bytes() {
        assert_eq!(Value::string("hello").size(), 5);
        assert_eq!(Value::array(vec![Value::string("hello")]).size(), 1);
        assert_eq!(Value::Int(9).size(), 1);
    }

    #[test]
    fn display_and_text() {
        assert_eq!(Value::Float(1.5).to_string(), "1.500000");
        assert_eq!(Value::Float(-0.0).to_string(), "0");
        assert_eq!(Value::Float(1.5).to_text(), "1.5");
        assert_eq!(Value::Float(3.0).to_text(), "3");
        assert_eq!(Value::Func(2).to_string(), "[function]");
        assert_eq!(Value::Rune('x').to_text(), "x");
    }

    #[test]
    fn export_to_json() {
        let mut m = BTreeMap::new();
        m.insert("a".to_string(), Value::array(vec![Value::Int(1), Value::Null]));
        assert_eq!(Value::map(m).export(), serde_json::json!({"a": [1, null]}));
    }
}
