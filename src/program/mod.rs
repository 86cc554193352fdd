//! The compiled artifact shared by the compiler and the VM.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::Serialize;

use crate::value::Value;

pub mod disasm;

// ── Addresses ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AddressKind {
    Void,
    Local,
    Global,
    Constant,
    Closure,
    Func,
    NativeFunc,
    Data,
    Unresolved,
}

/// A tagged operand. `Unresolved` values index the compiler's side table
/// and never survive compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Address {
    pub kind: AddressKind,
    pub value: u32,
}

impl Address {
    pub const VOID: Address = Address { kind: AddressKind::Void, value: 0 };

    pub fn new(kind: AddressKind, value: usize) -> Self {
        Address { kind, value: value as u32 }
    }

    pub fn local(i: usize) -> Self {
        Address::new(AddressKind::Local, i)
    }

    pub fn global(i: usize) -> Self {
        Address::new(AddressKind::Global, i)
    }

    pub fn constant(i: usize) -> Self {
        Address::new(AddressKind::Constant, i)
    }

    pub fn data(i: usize) -> Self {
        Address::new(AddressKind::Data, i)
    }

    pub fn func(i: usize) -> Self {
        Address::new(AddressKind::Func, i)
    }

    pub fn is_void(&self) -> bool {
        self.kind == AddressKind::Void
    }

    pub fn index(&self) -> usize {
        self.value as usize
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self.kind {
            AddressKind::Void => return f.pad("--"),
            AddressKind::Local => "L",
            AddressKind::Global => "G",
            AddressKind::Constant => "K",
            AddressKind::Closure => "C",
            AddressKind::Func => "F",
            AddressKind::NativeFunc => "N",
            AddressKind::Data => "D",
            AddressKind::Unresolved => "U",
        };
        f.pad(&format!("{}{}", self.value, suffix))
    }
}

// ── Opcodes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Opcode {
    Ldk, // A := K[B]
    Mov, // A := B
    Mob, // A := B, C := truthy(B)
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Bor,
    And,
    Xor,
    Lsh,
    Rsh,
    Inc,
    Dec,
    Unm,
    Not,
    Bnt,
    New, // B := new class A with the argument array C
    Nes, // B := new class A with the single argument C
    Arr, // A := array of B items
    Map, // A := map with B capacity
    Key, // A := keys of B
    Val, // A := values of B
    Len, // A := length of B
    Get, // A := B[C]
    Set, // A[B] := C
    Spa, // A := A spread into last position
    Jmp, // pc += A + 1
    Jpb, // pc -= A
    Ejp, // if A == B: pc += C
    Djp, // if A != B: pc += C
    Tjp, // if truthy(A) xor C: pc += B
    Eql,
    Neq,
    Seq,
    Sne,
    Lst,
    Lse,
    Cal, // A(C) -> B
    Cas, // A(C) -> B, single argument
    Rnp, // A := native property B
    Ret,
    Clo, // A := closure over function B
    Trw,
    Try, // catch pc A, error register B, finally pc C
    Tre,
    Cen,
    Fen,
    Trx,
}

impl Opcode {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Ldk => "LDK",
            Opcode::Mov => "MOV",
            Opcode::Mob => "MOB",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Mod => "MOD",
            Opcode::Bor => "BOR",
            Opcode::And => "AND",
            Opcode::Xor => "XOR",
            Opcode::Lsh => "LSH",
            Opcode::Rsh => "RSH",
            Opcode::Inc => "INC",
            Opcode::Dec => "DEC",
            Opcode::Unm => "UNM",
            Opcode::Not => "NOT",
            Opcode::Bnt => "BNT",
            Opcode::New => "NEW",
            Opcode::Nes => "NES",
            Opcode::Arr => "ARR",
            Opcode::Map => "MAP",
            Opcode::Key => "KEY",
            Opcode::Val => "VAL",
            Opcode::Len => "LEN",
            Opcode::Get => "GET",
            Opcode::Set => "SET",
            Opcode::Spa => "SPA",
            Opcode::Jmp => "JMP",
            Opcode::Jpb => "JPB",
            Opcode::Ejp => "EJP",
            Opcode::Djp => "DJP",
            Opcode::Tjp => "TJP",
            Opcode::Eql => "EQL",
            Opcode::Neq => "NEQ",
            Opcode::Seq => "SEQ",
            Opcode::Sne => "SNE",
            Opcode::Lst => "LST",
            Opcode::Lse => "LSE",
            Opcode::Cal => "CAL",
            Opcode::Cas => "CAS",
            Opcode::Rnp => "RNP",
            Opcode::Ret => "RET",
            Opcode::Clo => "CLO",
            Opcode::Trw => "TRW",
            Opcode::Try => "TRY",
            Opcode::Tre => "TRE",
            Opcode::Cen => "CEN",
            Opcode::Fen => "FEN",
            Opcode::Trx => "TRX",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.mnemonic())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Instruction {
    pub op: Opcode,
    pub a: Address,
    pub b: Address,
    pub c: Address,
}

impl Instruction {
    pub fn new(op: Opcode, a: Address, b: Address, c: Address) -> Self {
        Instruction { op, a, b, c }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:>6} {:>6} {:>6}", self.op, self.a, self.b, self.c)
    }
}

// ── Functions, registers and classes ────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Register {
    pub name: String,
    pub index: usize,
    pub start_pc: usize,
    /// Last pc of the enclosing block, `None` while the block is open.
    pub end_pc: Option<usize>,
    pub exported: bool,
    pub module: String,
}

impl Register {
    /// True unless the register's block was closed before `pc`.
    pub fn is_live(&self, pc: usize) -> bool {
        self.end_pc.is_none_or(|end| pc <= end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FunctionKind {
    #[default]
    User,
    Init,
    Main,
    Global,
}

/// Source location of an instruction. `file` indexes `Program::files`;
/// a zero line marks generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Location {
    pub file: usize,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Function {
    pub name: String,
    pub kind: FunctionKind,
    pub variadic: bool,
    pub exported: bool,
    pub is_class: bool,
    pub is_global: bool,
    pub index: usize,
    pub arguments: usize,
    pub max_reg_index: usize,
    pub registers: Vec<Register>,
    /// Registers of this function captured by nested functions, in capture order.
    pub closures: Vec<Register>,
    pub instructions: Vec<Instruction>,
    pub positions: Vec<Location>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: String,
    pub exported: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Class {
    pub name: String,
    pub fields: Vec<Field>,
    pub functions: Vec<usize>,
    pub exported: bool,
}

// ── Constants ───────────────────────────────────────────────────────

/// A constant pool entry. Kept separate from `Value` so a `Program` can be
/// shared between threads.
#[derive(Debug, Clone, Serialize)]
pub enum Constant {
    Null,
    Undefined,
    Int(i64),
    Float(f64),
    Bool(bool),
    Rune(char),
    String(Arc<str>),
}

impl Constant {
    pub fn to_value(&self) -> Value {
        match self {
            Constant::Null => Value::Null,
            Constant::Undefined => Value::Undefined,
            Constant::Int(i) => Value::Int(*i),
            Constant::Float(f) => Value::Float(*f),
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Rune(c) => Value::Rune(*c),
            Constant::String(s) => Value::String(s.clone()),
        }
    }

    pub fn string(s: &str) -> Self {
        Constant::String(Arc::from(s))
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Null, Constant::Null) | (Constant::Undefined, Constant::Undefined) => true,
            (Constant::Int(a), Constant::Int(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            (Constant::Rune(a), Constant::Rune(b)) => a == b,
            (Constant::String(a), Constant::String(b)) => a == b,
            _ => false,
        }
    }
}

// ── Program ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct Program {
    pub functions: Vec<Function>,
    pub classes: Vec<Class>,
    pub constants: Vec<Constant>,
    pub files: Vec<String>,
    pub directives: BTreeMap<String, String>,
    pub resources: BTreeMap<String, Vec<u8>>,
    #[serde(skip)]
    func_map: OnceLock<HashMap<String, usize>>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    /// Adds a constant to the pool, reusing an equal entry if present.
    pub fn add_constant(&mut self, k: Constant) -> Address {
        if let Some(i) = self.constants.iter().position(|c| *c == k) {
            return Address::constant(i);
        }
        self.constants.push(k);
        Address::constant(self.constants.len() - 1)
    }

    /// Looks up a function by name. The index is built once, on first use.
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.function_index(name).map(|i| &self.functions[i])
    }

    pub fn function_index(&self, name: &str) -> Option<usize> {
        let map = self.func_map.get_or_init(|| {
            let mut map = HashMap::with_capacity(self.functions.len());
            for f in &self.functions {
                map.entry(f.name.clone()).or_insert(f.index);
            }
            map
        });
        map.get(name).copied()
    }

    pub fn class(&self, name: &str) -> Option<&Class> {
        self.classes.iter().find(|c| c.name == name)
    }

    pub fn add_directive(&mut self, name: &str, value: &str) {
        self.directives
            .entry(name.to_string())
            .and_modify(|v| {
                v.push(' ');
                v.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    /// Checks the space separated `permissions` directive. `trusted` grants everything.
    pub fn has_permission(&self, name: &str) -> bool {
        let Some(perms) = self.directives.get("permissions") else {
            return false;
        };
        perms
            .split(' ')
            .filter(|p| !p.is_empty())
            .any(|p| p == name || p == "trusted")
    }

    pub fn file_index(&self, file: &str) -> Option<usize> {
        self.files.iter().position(|f| f == file)
    }

    /// Erases the names of everything that is not exported.
    pub fn strip(&mut self) {
        for f in &mut self.functions {
            if f.name.contains(".prototype.") {
                continue;
            }
            if !f.exported && f.name != "main" {
                f.name.clear();
            }
            for r in &mut f.registers {
                if !r.exported {
                    r.name.clear();
                }
            }
        }
        self.func_map = OnceLock::new();
    }

    /// Maps a pc to its source line. Generated instructions inherit the
    /// line of the closest preceding instruction.
    pub fn to_trace_line(&self, f: &Function, pc: usize) -> TraceLine {
        if f.positions.is_empty() || f.positions.len() <= pc {
            return TraceLine { function: f.name.clone(), file: String::new(), line: 0 };
        }
        let mut pc = pc;
        let mut pos = f.positions[pc];
        while pc > 0 && pos.line == 0 {
            pc -= 1;
            pos = f.positions[pc];
        }
        let file = self.files.get(pos.file).cloned().unwrap_or_default();
        TraceLine { function: f.name.clone(), file, line: pos.line }
    }
}

/// One entry of a runtime stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceLine {
    pub function: String,
    pub file: String,
    pub line: usize,
}

impl TraceLine {
    pub fn is_empty(&self) -> bool {
        self.function.is_empty() && self.file.is_empty() && self.line == 0
    }
}

impl fmt::Display for TraceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.file.as_str() {
            "" | "." if self.line > 0 => write!(f, "line {}", self.line),
            "" | "." => f.write_str(&self.function),
            file => write!(f, "{}:{}", file, self.line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display() {
        assert_eq!(Address::VOID.to_string(), "--");
        assert_eq!(Address::local(3).to_string(), "3L");
        assert_eq!(Address::new(AddressKind::Closure, 1).to_string(), "1C");
        assert_eq!(format!("{:>6}", Address::global(12)), "   12G");
    }

    #[test]
    fn instruction_display() {
        let i = Instruction::new(Opcode::Add, Address::local(0), Address::constant(1), Address::VOID);
        assert_eq!(i.to_string(), "ADD     0L     1K     --");
    }

    #[test]
    fn constants_are_deduplicated() {
        let mut p = Program::new();
        let a = p.add_constant(Constant::Int(1));
        let b = p.add_constant(Constant::string("x"));
        let c = p.add_constant(Constant::Int(1));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(p.add_constant(Constant::Float(1.0)), Address::constant(2));
        assert_eq!(p.constants.len(), 3);
    }

    #[test]
    fn directives_accumulate() {
        let mut p = Program::new();
        p.add_directive("permissions", "fs");
        p.add_directive("permissions", "net");
        assert_eq!(p.directives["permissions"], "fs net");
        assert!(p.has_permission("net"));
        assert!(!p.has_permission("exec"));
    }

    #[test]
    fn trusted_grants_everything() {
        let mut p = Program::new();
        p.add_directive("permissions", "trusted");
        assert!(p.has_permission("exec"));
        assert!(p.has_permission("trusted"));
    }

    #[test]
    fn function_lookup_by_name() {
        let mut p = Program::new();
        p.functions.push(Function { name: "@global".into(), index: 0, ..Default::default() });
        p.functions.push(Function { name: "main".into(), index: 1, ..Default::default() });
        assert_eq!(p.function("main").map(|f| f.index), Some(1));
        assert!(p.function("nope").is_none());
    }

    #[test]
    fn trace_line_walks_back_over_generated_code() {
        let mut p = Program::new();
        p.files.push(String::new());
        let f = Function {
            name: "foo".into(),
            positions: vec![
                Location { file: 0, line: 3, column: 1 },
                Location::default(),
            ],
            ..Default::default()
        };
        assert_eq!(p.to_trace_line(&f, 1).to_string(), "line 3");
        assert_eq!(p.to_trace_line(&f, 9).to_string(), "foo");
    }

    #[test]
    fn trace_line_with_file() {
        let t = TraceLine { function: "f".into(), file: "/lib/bar.ts".into(), line: 4 };
        assert_eq!(t.to_string(), "/lib/bar.ts:4");
    }

    #[test]
    fn strip_keeps_exported_names() {
        let mut p = Program::new();
        p.functions.push(Function { name: "hidden".into(), ..Default::default() });
        p.functions.push(Function { name: "shown".into(), exported: true, index: 1, ..Default::default() });
        p.functions.push(Function { name: "main".into(), index: 2, ..Default::default() });
        p.strip();
        assert_eq!(p.functions[0].name, "");
        assert_eq!(p.functions[1].name, "shown");
        assert_eq!(p.functions[2].name, "main");
    }
}
