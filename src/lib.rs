//! gale compiles a small TypeScript-like scripting language to register
//! bytecode and runs it on an embeddable VM.
//!
//! ```no_run
//! use gale::{NativeRegistry, Vm, compile};
//!
//! let graph = gale::parser::loader::load("main.ts".as_ref()).unwrap();
//! let natives = NativeRegistry::with_prelude();
//! let program = compile(&graph, &natives).unwrap();
//! let result = Vm::new(&program, &natives).run(&[]).unwrap();
//! println!("{result}");
//! ```

pub mod ast;
pub mod compiler;
pub mod config;
pub mod diagnostic;
pub mod lexer;
pub mod native;
pub mod parser;
pub mod program;
pub mod value;
pub mod vm;

pub use compiler::{CompileError, compile};
pub use config::VmConfig;
pub use native::NativeRegistry;
pub use program::Program;
pub use value::{Exception, Value};
pub use vm::Vm;
