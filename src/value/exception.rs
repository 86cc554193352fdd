use std::any::Any;
use std::fmt;
use std::rc::Rc;

use super::object::{HostMethod, Object};
use super::Value;
use crate::program::{Instruction, TraceLine};
use crate::vm::Vm;

/// What went wrong while executing an instruction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("Attempt to divide by zero")]
    DivideByZero,
    #[error("Step limit reached: {0}")]
    StepLimit(usize),
    #[error("Max allocations reached: {0}")]
    AllocationLimit(usize),
    #[error("Max stack frames reached: {0}")]
    FrameLimit(usize),
    #[error("function {0} not found")]
    FunctionNotFound(String),
    #[error("function '{name}' expects {expected} parameters, got {got}")]
    Arity { name: String, expected: usize, got: usize },
    #[error("Invalid value. Expected a function, got {0}")]
    NotCallable(String),
    #[error("Attempted to use {0} in a case where an object is required")]
    NullReference(&'static str),
    #[error("Index out of range")]
    IndexOutOfRange,
    #[error("Can't set {0} by index")]
    NotIndexable(String),
    #[error("Readonly or nonexistent property: {0}")]
    ReadonlyProperty(String),
    #[error("Invalid index {0}")]
    InvalidIndex(String),
    #[error("Invalid {op} operation: {left} and {right}")]
    InvalidOperands { op: &'static str, left: String, right: String },
    #[error("Invalid {op} operation: {operand}")]
    InvalidOperand { op: &'static str, operand: String },
    #[error("Class not found: {0}")]
    ClassNotFound(String),
    #[error("try without catch or finally")]
    TryWithoutHandler,
    #[error("Invalid address {0}")]
    InvalidAddress(String),
    #[error("PANIC: {0}")]
    Panic(String),
    #[error("{0}")]
    Message(String),
}

pub type VmResult<T> = Result<T, Exception>;

/// A runtime error as seen by scripts and hosts. It doubles as the object
/// bound to a `catch` variable.
#[derive(Debug, Clone)]
pub struct Exception {
    pub kind: VmError,
    pub message: String,
    pub public: bool,
    pub pc: usize,
    pub instruction: Option<Instruction>,
    pub stacktrace: Vec<TraceLine>,
    pub wrapped: Vec<Exception>,
}

impl Exception {
    pub fn new(message: impl Into<String>) -> Self {
        VmError::Message(message.into()).into()
    }

    /// An error whose message is meant for end users.
    pub fn public(message: impl Into<String>) -> Self {
        let mut e = Exception::new(message);
        e.public = true;
        e
    }

    /// Nests `inner`; the messages are joined only if both are public.
    pub fn wrap(&mut self, inner: Exception) {
        if self.public && inner.public {
            self.message.push_str(": ");
            self.message.push_str(&inner.message);
        }
        self.wrapped.push(inner);
    }

    pub fn is(&self, kind: &VmError) -> bool {
        &self.kind == kind
    }

    /// The trace lines without the message.
    pub fn stack(&self) -> String {
        let mut out = String::new();
        for line in self.stacktrace.iter().filter(|l| !l.is_empty()) {
            out.push_str(&format!(" -> {}\n", line));
        }
        out
    }

    fn to_value(&self) -> Value {
        Value::object(self.clone())
    }
}

impl From<VmError> for Exception {
    fn from(kind: VmError) -> Self {
        Exception {
            message: kind.to_string(),
            kind,
            public: false,
            pc: 0,
            instruction: None,
            stacktrace: Vec::new(),
            wrapped: Vec::new(),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for line in &self.stacktrace {
            if line.function.is_empty() || line.line == 0 {
                continue;
            }
            writeln!(f, " -> {}", line)?;
        }
        for inner in &self.wrapped {
            write!(f, "\n{}\n", inner)?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

impl Object for Exception {
    fn type_name(&self) -> &str {
        "Exception"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_text(&self) -> String {
        self.message.clone()
    }

    fn get_method(&self, name: &str) -> Option<HostMethod> {
        match name {
            "toString" => {
                let text = self.to_string();
                Some(Rc::new(move |_vm: &mut Vm<'_>, _args: &[Value]| Ok(Value::string(&text))))
            }
            _ => None,
        }
    }

    fn get_property(self: Rc<Self>, name: &str, _vm: &mut Vm<'_>) -> VmResult<Option<Value>> {
        let v = match name {
            "public" => Value::Bool(self.public),
            "message" => Value::string(&self.message),
            "pc" => Value::Int(self.pc as i64),
            "stackTrace" => Value::string(self.stack()),
            _ => Value::Undefined,
        };
        Ok(Some(v))
    }

    fn export(&self) -> serde_json::Value {
        let lines: Vec<String> = self
            .stacktrace
            .iter()
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect();
        serde_json::json!({ "Message": self.message, "StackTrace": lines })
    }
}

impl From<Exception> for Value {
    fn from(e: Exception) -> Self {
        e.to_value()
    }
}

/// Extracts the exception carried by a thrown or caught value.
pub fn as_exception(v: &Value) -> Option<&Exception> {
    match v {
        Value::Object(o) => o.as_any().downcast_ref::<Exception>(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(function: &str, line: usize) -> TraceLine {
        TraceLine { function: function.into(), file: String::new(), line }
    }

    #[test]
    fn display_includes_trace() {
        let mut e: Exception = VmError::DivideByZero.into();
        e.stacktrace = vec![trace("bar", 7), trace("", 0), trace("main", 11)];
        assert_eq!(e.to_string(), "Attempt to divide by zero\n -> line 7\n -> line 11\n");
    }

    #[test]
    fn wrap_joins_public_messages() {
        let mut outer = Exception::public("loading config");
        outer.wrap(Exception::public("file not found"));
        assert_eq!(outer.message, "loading config: file not found");

        let mut hidden = Exception::public("loading config");
        hidden.wrap(Exception::new("EACCES"));
        assert_eq!(hidden.message, "loading config");
        assert_eq!(hidden.wrapped.len(), 1);
    }

    #[test]
    fn exception_round_trips_through_value() {
        let v: Value = Exception::new("boom").into();
        assert_eq!(v.type_name(), "Exception");
        assert_eq!(as_exception(&v).map(|e| e.message.as_str()), Some("boom"));
        assert!(as_exception(&Value::Int(1)).is_none());
    }
}
