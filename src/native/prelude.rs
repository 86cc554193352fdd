//! The handful of natives available to every script run from the CLI.

use super::NativeRegistry;
use crate::value::exception::as_exception;
use crate::value::{Exception, Value, VmError};

pub fn register(r: &mut NativeRegistry) {
    r.add("console.log", -1, |_vm, _this, args| {
        let line: Vec<String> = args.iter().map(Value::to_text).collect();
        println!("{}", line.join(" "));
        Ok(Value::Null)
    });

    r.add("panic", 1, |_vm, _this, args| {
        let msg = args.first().map(Value::to_text).unwrap_or_default();
        panic!("{}", msg);
    });

    r.add("errors.public", -1, |_vm, _this, args| {
        let mut e = Exception::public(arg_text(args, 0));
        if let Some(inner) = args.get(1) {
            e.wrap(inner_exception(inner));
        }
        Ok(e.into())
    });

    r.add("errors.wrap", 2, |_vm, _this, args| {
        let mut e = Exception::new(arg_text(args, 0));
        e.wrap(inner_exception(&args[1]));
        Ok(e.into())
    });

    r.add("->math.pi", 0, |_vm, _this, _args| Ok(Value::Float(std::f64::consts::PI)));

    r.add("Array.prototype.push", -1, |_vm, this, args| match this {
        Value::Array(items) => {
            let mut items = items.borrow_mut();
            items.extend_from_slice(args);
            Ok(Value::Int(items.len() as i64))
        }
        other => Err(expected_receiver("array", &other)),
    });

    r.add("Array.prototype.join", -1, |_vm, this, args| match this {
        Value::Array(items) => {
            let sep = args.first().map(Value::to_text).unwrap_or_default();
            let parts: Vec<String> = items.borrow().iter().map(Value::to_text).collect();
            Ok(Value::string(parts.join(&sep)))
        }
        other => Err(expected_receiver("array", &other)),
    });

    r.add("String.prototype.toUpperCase", 0, |_vm, this, _args| match this {
        Value::String(s) => Ok(Value::string(s.to_uppercase())),
        other => Err(expected_receiver("string", &other)),
    });
}

fn arg_text(args: &[Value], i: usize) -> String {
    args.get(i).map(Value::to_text).unwrap_or_default()
}

fn inner_exception(v: &Value) -> Exception {
    match as_exception(v) {
        Some(e) => e.clone(),
        None => Exception::public(v.to_text()),
    }
}

fn expected_receiver(expected: &'static str, got: &Value) -> Exception {
    VmError::InvalidOperand { op: expected, operand: got.type_name().to_string() }.into()
}
