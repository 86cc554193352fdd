//! Object protocol: the capabilities an opaque runtime object may expose.
//!
//! The VM consults them in a fixed order: method lookup, property access,
//! then enumeration (which unlocks the array prototype).

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use super::{Value, VmResult};
use crate::vm::Vm;

/// A host method bound to an object, callable from scripts.
pub type HostMethod = Rc<dyn Fn(&mut Vm<'_>, &[Value]) -> VmResult<Value>>;

pub trait Object: fmt::Debug {
    fn type_name(&self) -> &str;

    fn as_any(&self) -> &dyn Any;

    fn to_text(&self) -> String {
        self.type_name().to_string()
    }

    fn get_method(&self, _name: &str) -> Option<HostMethod> {
        None
    }

    /// `Ok(None)` means the object has no property getter.
    fn get_property(self: Rc<Self>, _name: &str, _vm: &mut Vm<'_>) -> VmResult<Option<Value>> {
        Ok(None)
    }

    /// `Ok(false)` means the object has no property setter.
    fn set_property(&self, _name: &str, _value: Value, _vm: &mut Vm<'_>) -> VmResult<bool> {
        Ok(false)
    }

    fn get_index(&self, _index: i64) -> VmResult<Option<Value>> {
        Ok(None)
    }

    fn set_index(&self, _index: i64, _value: Value) -> VmResult<bool> {
        Ok(false)
    }

    /// Enumerable objects expose their values to `for of` and the array prototype.
    fn values(&self) -> Option<Vec<Value>> {
        None
    }

    fn export(&self) -> serde_json::Value {
        serde_json::Value::String(self.to_text())
    }

    /// How the VM calls this object, if it is callable.
    fn callee(&self) -> Option<Callee> {
        None
    }
}

/// Resources released when the frame that registered them goes away.
pub trait Finalizable: fmt::Debug {
    fn close(&self) -> VmResult<()>;
}

// ── Callables ───────────────────────────────────────────────────────

/// A captured register: a handle to the owning frame's storage plus a slot.
#[derive(Debug, Clone)]
pub struct ClosureCell {
    pub values: Rc<RefCell<Vec<Value>>>,
    pub index: usize,
}

impl ClosureCell {
    pub fn get(&self) -> Value {
        self.values.borrow().get(self.index).cloned().unwrap_or_default()
    }

    pub fn set(&self, v: Value) {
        if let Some(slot) = self.values.borrow_mut().get_mut(self.index) {
            *slot = v;
        }
    }
}

#[derive(Clone)]
pub enum Callee {
    Closure { func: usize, cells: Rc<[ClosureCell]> },
    Method { func: usize, this: Value },
    Native { index: usize, this: Value },
    Host(HostMethod),
}

impl fmt::Debug for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callee::Closure { func, cells } => write!(f, "Closure({}, {} cells)", func, cells.len()),
            Callee::Method { func, .. } => write!(f, "Method({})", func),
            Callee::Native { index, .. } => write!(f, "Native({})", index),
            Callee::Host(_) => f.write_str("Host"),
        }
    }
}

#[derive(Debug)]
pub struct Closure {
    pub func: usize,
    pub cells: Rc<[ClosureCell]>,
}

impl Object for Closure {
    fn type_name(&self) -> &str {
        "function"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_text(&self) -> String {
        "[closure]".to_string()
    }

    fn callee(&self) -> Option<Callee> {
        Some(Callee::Closure { func: self.func, cells: self.cells.clone() })
    }
}

/// A program function bound to a receiver.
#[derive(Debug)]
pub struct Method {
    pub func: usize,
    pub this: Value,
}

impl Object for Method {
    fn type_name(&self) -> &str {
        "function"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_text(&self) -> String {
        "[method]".to_string()
    }

    fn callee(&self) -> Option<Callee> {
        Some(Callee::Method { func: self.func, this: self.this.clone() })
    }
}

/// A native prototype function (`Array.prototype.push`, ...) bound to a receiver.
#[derive(Debug)]
pub struct NativePrototype {
    pub index: usize,
    pub this: Value,
}

impl Object for NativePrototype {
    fn type_name(&self) -> &str {
        "native function"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_text(&self) -> String {
        "[native function]".to_string()
    }

    fn callee(&self) -> Option<Callee> {
        Some(Callee::Native { index: self.index, this: self.this.clone() })
    }
}

/// A host method returned by an object's method lookup.
pub struct BoundHostMethod(pub HostMethod);

impl fmt::Debug for BoundHostMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoundHostMethod")
    }
}

impl Object for BoundHostMethod {
    fn type_name(&self) -> &str {
        "native function"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn callee(&self) -> Option<Callee> {
        Some(Callee::Host(self.0.clone()))
    }
}

// ── Class instances ─────────────────────────────────────────────────

/// An object created by `new`. Methods resolve to `<Class>.prototype.<name>`
/// functions of the program that created it.
#[derive(Debug)]
pub struct Instance {
    pub class: String,
    pub fields: RefCell<BTreeMap<String, Value>>,
}

impl Instance {
    pub fn new(class: impl Into<String>) -> Self {
        Instance { class: class.into(), fields: RefCell::new(BTreeMap::new()) }
    }

    fn method_name(&self, name: &str) -> String {
        format!("{}.prototype.{}", self.class, name)
    }
}

impl Object for Instance {
    fn type_name(&self) -> &str {
        "object"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_text(&self) -> String {
        format!("[{}]", self.class)
    }

    fn get_property(self: Rc<Self>, name: &str, vm: &mut Vm<'_>) -> VmResult<Option<Value>> {
        // methods shadow fields
        if let Some(func) = vm.program().function_index(&self.method_name(name)) {
            let this = Value::Object(self.clone());
            return Ok(Some(Value::object(Method { func, this })));
        }
        Ok(Some(self.fields.borrow().get(name).cloned().unwrap_or(Value::Undefined)))
    }

    fn set_property(&self, name: &str, value: Value, _vm: &mut Vm<'_>) -> VmResult<bool> {
        self.fields.borrow_mut().insert(name.to_string(), value);
        Ok(true)
    }

    fn export(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields.borrow().iter().map(|(k, v)| (k.clone(), v.export())).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_cells_share_storage() {
        let values = Rc::new(RefCell::new(vec![Value::Int(1), Value::Int(2)]));
        let a = ClosureCell { values: values.clone(), index: 1 };
        let b = ClosureCell { values, index: 1 };
        a.set(Value::Int(7));
        assert!(matches!(b.get(), Value::Int(7)));
    }

    #[test]
    fn instance_exports_fields() {
        let i = Instance::new("Foo");
        i.fields.borrow_mut().insert("x".into(), Value::Int(3));
        assert_eq!(i.export(), serde_json::json!({"x": 3}));
        assert_eq!(i.to_text(), "[Foo]");
    }

    #[test]
    fn closure_is_callable() {
        let c = Closure { func: 4, cells: Rc::from(Vec::new()) };
        assert!(matches!(c.callee(), Some(Callee::Closure { func: 4, .. })));
    }
}
