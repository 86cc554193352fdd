//! Value arithmetic, comparison and enumeration used by the dispatch loop.

use std::cmp::Ordering;

use crate::program::Opcode;
use crate::value::{Value, VmError, VmResult};

fn invalid(op: &'static str, l: &Value, r: &Value) -> VmError {
    VmError::InvalidOperands { op, left: l.type_name().to_string(), right: r.type_name().to_string() }
}

fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(*i),
        Value::Rune(c) => Some(*c as i64),
        _ => None,
    }
}

/// Both operands numeric with at least one float.
fn floats(l: &Value, r: &Value) -> Option<(f64, f64)> {
    if matches!(l, Value::Float(_)) || matches!(r, Value::Float(_)) {
        return Some((l.as_float()?, r.as_float()?));
    }
    None
}

pub fn binary(op: Opcode, l: &Value, r: &Value) -> VmResult<Value> {
    let v = match op {
        Opcode::Add => add(l, r)?,
        Opcode::Sub => arith(l, r, "subtract", i64::wrapping_sub, |a, b| a - b)?,
        Opcode::Mul => arith(l, r, "multiply", i64::wrapping_mul, |a, b| a * b)?,
        Opcode::Div => {
            let (a, b) = match (l.as_float(), r.as_float()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(invalid("divide", l, r).into()),
            };
            if b == 0.0 {
                return Err(VmError::DivideByZero.into());
            }
            Value::Float(a / b)
        }
        Opcode::Mod => modulo(l, r)?,
        Opcode::Bor => bitwise(l, r, "|", |a, b| a | b)?,
        Opcode::And => bitwise(l, r, "&", |a, b| a & b)?,
        Opcode::Xor => bitwise(l, r, "^", |a, b| a ^ b)?,
        Opcode::Lsh => bitwise(l, r, "<<", |a, b| u32::try_from(b).ok().and_then(|b| a.checked_shl(b)).unwrap_or(0))?,
        Opcode::Rsh => bitwise(l, r, ">>", |a, b| u32::try_from(b).ok().and_then(|b| a.checked_shr(b)).unwrap_or(0))?,
        other => return Err(VmError::Message(format!("{} is not a binary operator", other.mnemonic())).into()),
    };
    Ok(v)
}

/// Numbers add, anything added to a string concatenates.
fn add(l: &Value, r: &Value) -> VmResult<Value> {
    if matches!(l, Value::String(_)) || matches!(r, Value::String(_)) {
        let mut s = l.to_text();
        s.push_str(&r.to_text());
        return Ok(Value::string(s));
    }
    arith(l, r, "add", i64::wrapping_add, |a, b| a + b)
}

fn arith(
    l: &Value,
    r: &Value,
    op: &'static str,
    int: fn(i64, i64) -> i64,
    float: fn(f64, f64) -> f64,
) -> VmResult<Value> {
    if let Some((a, b)) = floats(l, r) {
        return Ok(Value::Float(float(a, b)));
    }
    match (as_int(l), as_int(r)) {
        (Some(a), Some(b)) => Ok(Value::Int(int(a, b))),
        _ => Err(invalid(op, l, r).into()),
    }
}

fn modulo(l: &Value, r: &Value) -> VmResult<Value> {
    if let Some((a, b)) = floats(l, r) {
        if b == 0.0 {
            return Err(VmError::DivideByZero.into());
        }
        return Ok(Value::Float(a % b));
    }
    match (as_int(l), as_int(r)) {
        (Some(_), Some(0)) => Err(VmError::DivideByZero.into()),
        (Some(a), Some(b)) => Ok(Value::Int(a.wrapping_rem(b))),
        _ => Err(invalid("modulo", l, r).into()),
    }
}

fn bitwise(l: &Value, r: &Value, op: &'static str, f: fn(i64, i64) -> i64) -> VmResult<Value> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(f(*a, *b))),
        _ => Err(invalid(op, l, r).into()),
    }
}

pub fn unary(op: Opcode, v: &Value) -> VmResult<Value> {
    match (op, v) {
        (Opcode::Unm, Value::Int(i)) => Ok(Value::Int(i.wrapping_neg())),
        (Opcode::Unm, Value::Float(f)) => Ok(Value::Float(-f)),
        (Opcode::Not, v) => Ok(Value::Bool(!v.is_truthy())),
        (Opcode::Bnt, Value::Int(i)) => Ok(Value::Int(!i)),
        (Opcode::Inc, Value::Int(i)) => Ok(Value::Int(i.wrapping_add(1))),
        (Opcode::Inc, Value::Float(f)) => Ok(Value::Float(f + 1.0)),
        (Opcode::Dec, Value::Int(i)) => Ok(Value::Int(i.wrapping_sub(1))),
        (Opcode::Dec, Value::Float(f)) => Ok(Value::Float(f - 1.0)),
        (op, v) => Err(VmError::InvalidOperand { op: op.mnemonic(), operand: v.type_name().to_string() }.into()),
    }
}

/// `lst`/`lse`: numbers compare numerically, strings lexically.
pub fn less(op: Opcode, l: &Value, r: &Value) -> VmResult<bool> {
    let ord = match (l, r) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => match (l.as_float(), r.as_float()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Greater),
            _ => return Err(invalid("comparison", l, r).into()),
        },
    };
    Ok(match op {
        Opcode::Lse => ord != Ordering::Greater,
        _ => ord == Ordering::Less,
    })
}

/// The keys a `for in` loop walks.
pub fn keys(v: &Value) -> VmResult<Vec<Value>> {
    let indexes = |n: usize| (0..n as i64).map(Value::Int).collect();
    match v {
        Value::Map(m) => Ok(m.borrow().keys().map(Value::string).collect()),
        Value::Array(a) => Ok(indexes(a.borrow().len())),
        Value::String(s) => Ok(indexes(s.chars().count())),
        Value::Bytes(b) => Ok(indexes(b.borrow().len())),
        Value::Object(o) => match o.values() {
            Some(values) => Ok(indexes(values.len())),
            None => Err(not_enumerable(v)),
        },
        _ => Err(not_enumerable(v)),
    }
}

/// The values a `for of` loop walks.
pub fn values(v: &Value) -> VmResult<Vec<Value>> {
    match v {
        Value::Map(m) => Ok(m.borrow().values().cloned().collect()),
        Value::Array(a) => Ok(a.borrow().clone()),
        Value::String(s) => Ok(s.chars().map(Value::Rune).collect()),
        Value::Bytes(b) => Ok(b.borrow().iter().map(|x| Value::Int(*x as i64)).collect()),
        Value::Object(o) => o.values().ok_or_else(|| not_enumerable(v)),
        _ => Err(not_enumerable(v)),
    }
}

pub fn len(v: &Value) -> VmResult<usize> {
    match v {
        Value::Array(a) => Ok(a.borrow().len()),
        Value::Map(m) => Ok(m.borrow().len()),
        Value::String(s) => Ok(s.len()),
        Value::Bytes(b) => Ok(b.borrow().len()),
        Value::Object(o) => o.values().map(|v| v.len()).ok_or_else(|| not_enumerable(v)),
        other => Err(VmError::InvalidOperand { op: "len", operand: other.type_name().to_string() }.into()),
    }
}

fn not_enumerable(v: &Value) -> crate::value::Exception {
    VmError::InvalidOperand { op: "enumeration", operand: v.type_name().to_string() }.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(op: Opcode, l: impl Into<Value>, r: impl Into<Value>) -> Value {
        match binary(op, &l.into(), &r.into()) {
            Ok(v) => v,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn int_arithmetic_wraps() {
        assert!(matches!(bin(Opcode::Add, i64::MAX, 1i64), Value::Int(i64::MIN)));
        assert!(matches!(bin(Opcode::Mul, 6i64, 7i64), Value::Int(42)));
    }

    #[test]
    fn float_operand_makes_float() {
        assert!(matches!(bin(Opcode::Add, 1i64, 0.5), Value::Float(f) if f == 1.5));
        assert!(matches!(bin(Opcode::Div, 6i64, 2i64), Value::Float(f) if f == 3.0));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(bin(Opcode::Add, "a", 1i64).to_text(), "a1");
        assert_eq!(bin(Opcode::Add, 1.5, "b").to_text(), "1.5b");
    }

    #[test]
    fn divide_by_zero() {
        let err = binary(Opcode::Div, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert!(err.is(&VmError::DivideByZero));
        assert!(binary(Opcode::Mod, &Value::Int(1), &Value::Int(0)).is_err());
    }

    #[test]
    fn shifts_and_bits() {
        assert!(matches!(bin(Opcode::Rsh, 50i64, 2i64), Value::Int(12)));
        assert!(matches!(bin(Opcode::Lsh, 2i64, 5i64), Value::Int(64)));
        assert!(matches!(bin(Opcode::Lsh, 1i64, 99i64), Value::Int(0)));
        assert!(matches!(bin(Opcode::Xor, 0xAAi64, 0xBBi64), Value::Int(17)));
    }

    #[test]
    fn invalid_operands() {
        let err = binary(Opcode::Sub, &Value::string("a"), &Value::Int(1)).unwrap_err();
        assert_eq!(err.message, "Invalid subtract operation: string and int");
    }

    #[test]
    fn comparisons() {
        assert!(less(Opcode::Lst, &Value::Int(3), &Value::Int(4)).unwrap());
        assert!(!less(Opcode::Lst, &Value::Float(1.2), &Value::Int(1)).unwrap());
        assert!(less(Opcode::Lse, &Value::string("a"), &Value::string("a")).unwrap());
        assert!(less(Opcode::Lst, &Value::Null, &Value::Int(1)).is_err());
    }

    #[test]
    fn enumeration() {
        let arr = Value::array(vec![Value::Int(7), Value::Int(8)]);
        assert_eq!(keys(&arr).unwrap().len(), 2);
        assert!(matches!(values(&arr).unwrap()[1], Value::Int(8)));
        assert!(matches!(values(&Value::string("hé")).unwrap()[1], Value::Rune('é')));
        assert_eq!(len(&Value::string("hé")).unwrap(), 3);
        assert!(keys(&Value::Null).is_err());
    }
}
