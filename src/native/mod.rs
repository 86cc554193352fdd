//! Registry of host functions callable from scripts.
//!
//! Call sites are bound to a native by name at compile time and dispatched by
//! index at run time, so replacing a native keeps its index.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::value::{Value, VmResult};
use crate::vm::Vm;

pub mod prelude;

/// `this` is `Value::Null` unless the native is called through a prototype.
pub type NativeFn = Arc<dyn Fn(&mut Vm<'_>, Value, &[Value]) -> VmResult<Value> + Send + Sync>;

#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    /// Expected argument count, `-1` for variadic.
    pub arguments: i32,
    pub index: usize,
    pub function: NativeFn,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .field("index", &self.index)
            .finish()
    }
}

const DEFAULT_BUILTINS: &[&str] = &["go", "defer", "panic", "T"];

/// Native functions known to one compiler/VM pair.
#[derive(Debug, Clone)]
pub struct NativeRegistry {
    functions: Vec<NativeFunction>,
    by_name: HashMap<String, usize>,
    builtins: Vec<String>,
}

impl Default for NativeRegistry {
    fn default() -> Self {
        NativeRegistry {
            functions: Vec::new(),
            by_name: HashMap::new(),
            builtins: DEFAULT_BUILTINS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl NativeRegistry {
    pub fn new() -> Self {
        NativeRegistry::default()
    }

    /// A registry holding the small standard prelude.
    pub fn with_prelude() -> Self {
        let mut r = NativeRegistry::new();
        prelude::register(&mut r);
        r
    }

    /// Registers `function` under `name`. Re-registering a name replaces the
    /// implementation and keeps the index.
    pub fn add<F>(&mut self, name: &str, arguments: i32, function: F) -> usize
    where
        F: Fn(&mut Vm<'_>, Value, &[Value]) -> VmResult<Value> + Send + Sync + 'static,
    {
        let function: NativeFn = Arc::new(function);
        if let Some(&index) = self.by_name.get(name) {
            tracing::debug!(name, index, "replacing native function");
            self.functions[index] = NativeFunction { name: name.to_string(), arguments, index, function };
            return index;
        }
        let index = self.functions.len();
        self.functions.push(NativeFunction { name: name.to_string(), arguments, index, function });
        self.by_name.insert(name.to_string(), index);
        index
    }

    pub fn get(&self, index: usize) -> Option<&NativeFunction> {
        self.functions.get(index)
    }

    pub fn lookup(&self, name: &str) -> Option<&NativeFunction> {
        self.by_name.get(name).map(|&i| &self.functions[i])
    }

    /// Bare names that resolve to natives without a package prefix.
    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.iter().any(|b| b == name)
    }

    pub fn add_builtin(&mut self, name: &str) {
        if !self.is_builtin(name) {
            self.builtins.push(name.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NativeFunction> {
        self.functions.iter()
    }
}
