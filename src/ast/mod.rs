use std::collections::BTreeMap;

use serde::Serialize;

pub mod source_map;
pub use source_map::SourceMap;

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// 1-based line and column. `Position::NONE` marks generated nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const NONE: Position = Position { line: 0, column: 0 };
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Wraps a node with its source location. Transparent to serde (serializes as inner node only).
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
    pub pos: Position,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span, pos: Position) -> Self {
        Spanned { node, span, pos }
    }

    pub fn unknown(node: T) -> Self {
        Spanned { node, span: Span::UNKNOWN, pos: Position::NONE }
    }
}

impl<T> std::ops::Deref for Spanned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.node
    }
}

impl<T: Serialize> Serialize for Spanned<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.node.serialize(serializer)
    }
}

// ---- Modules ----

/// Every source file reachable from the entry point, keyed by module path.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleGraph {
    pub main: SourceFile,
    pub modules: BTreeMap<String, SourceFile>,
}

impl ModuleGraph {
    pub fn single(main: SourceFile) -> Self {
        ModuleGraph { main, modules: BTreeMap::new() }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceFile {
    pub path: String,
    pub imports: Vec<Import>,
    /// Raw `/// name value` lines.
    pub directives: Vec<String>,
    pub stmts: Vec<Spanned<Stmt>>,
}

/// `import * as alias from "path"` or the side-effect form `import "path"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Import {
    pub alias: Option<String>,
    /// Resolved module key.
    pub path: String,
    pub pos: Position,
}

// ---- Statements ----

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Stmt {
    Var {
        name: String,
        value: Option<Spanned<Expr>>,
        exported: bool,
        is_enum: bool,
    },
    Function(FuncDecl),
    Class(ClassDecl),
    Assign {
        target: Spanned<Expr>,
        value: Spanned<Expr>,
    },
    Update {
        target: Spanned<Expr>,
        op: UpdateOp,
    },
    Expr(Spanned<Expr>),
    Return(Option<Spanned<Expr>>),
    Block(Vec<Spanned<Stmt>>),
    If {
        branches: Vec<IfBranch>,
        otherwise: Option<Vec<Spanned<Stmt>>>,
    },
    Switch {
        subject: Spanned<Expr>,
        cases: Vec<SwitchCase>,
        default: Option<Vec<Spanned<Stmt>>>,
    },
    /// `for (init; cond; step)`. All parts empty is the infinite loop.
    For {
        init: Vec<Spanned<Stmt>>,
        cond: Option<Spanned<Expr>>,
        step: Option<Box<Spanned<Stmt>>>,
        body: Vec<Spanned<Stmt>>,
    },
    /// `for (let x in e)` iterates keys, `for (let x of e)` values.
    ForEach {
        kind: ForEachKind,
        name: String,
        iterable: Spanned<Expr>,
        body: Vec<Spanned<Stmt>>,
    },
    While {
        cond: Spanned<Expr>,
        body: Vec<Spanned<Stmt>>,
    },
    Throw(Spanned<Expr>),
    Try {
        body: Vec<Spanned<Stmt>>,
        catch: Option<CatchClause>,
        finally: Option<Vec<Spanned<Stmt>>>,
    },
    Break(Option<String>),
    Continue(Option<String>),
    Labeled {
        label: String,
        body: Box<Spanned<Stmt>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateOp {
    Inc,
    Dec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ForEachKind {
    In,
    Of,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IfBranch {
    pub cond: Spanned<Expr>,
    pub body: Vec<Spanned<Stmt>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchCase {
    pub value: Spanned<Expr>,
    pub body: Vec<Spanned<Stmt>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatchClause {
    pub binding: Option<String>,
    pub body: Vec<Spanned<Stmt>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct FuncDecl {
    pub name: String,
    pub params: Vec<String>,
    /// The last parameter collects the remaining arguments.
    pub variadic: bool,
    pub exported: bool,
    pub body: Vec<Spanned<Stmt>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassDecl {
    pub name: String,
    pub exported: bool,
    pub fields: Vec<ClassField>,
    pub constructor: Option<FuncDecl>,
    pub methods: Vec<FuncDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassField {
    pub name: String,
    pub value: Option<Spanned<Expr>>,
    pub exported: bool,
}

// ---- Expressions ----

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    Literal(Literal),
    Unary {
        op: UnaryOp,
        operand: Box<Spanned<Expr>>,
    },
    Binary {
        op: BinOp,
        left: Box<Spanned<Expr>>,
        right: Box<Spanned<Expr>>,
    },
    Ternary {
        cond: Box<Spanned<Expr>>,
        then: Box<Spanned<Expr>>,
        otherwise: Box<Spanned<Expr>>,
    },
    Ident(String),
    Map(Vec<(String, Spanned<Expr>)>),
    Array(Vec<Spanned<Expr>>),
    Index {
        object: Box<Spanned<Expr>>,
        index: Box<Spanned<Expr>>,
    },
    Selector {
        object: Box<Spanned<Expr>>,
        name: String,
    },
    Function(Box<FuncDecl>),
    Call {
        callee: Box<Spanned<Expr>>,
        args: Vec<Spanned<Expr>>,
        /// The last argument is spread into the call.
        spread: bool,
    },
    New {
        class: Box<Spanned<Expr>>,
        args: Vec<Spanned<Expr>>,
        spread: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
    String(String),
    Rune(char),
    Bool(bool),
    Null,
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitOr,
    BitAnd,
    BitXor,
    Shl,
    Shr,
    Equals,
    NotEquals,
    StrictEquals,
    StrictNotEquals,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::BitOr => "|",
            BinOp::BitAnd => "&",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Equals => "==",
            BinOp::NotEquals => "!=",
            BinOp::StrictEquals => "===",
            BinOp::StrictNotEquals => "!==",
            BinOp::Less => "<",
            BinOp::LessEq => "<=",
            BinOp::Greater => ">",
            BinOp::GreaterEq => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

impl Stmt {
    /// True for statements after which control never reaches the next one.
    pub fn is_exit(&self) -> bool {
        matches!(self, Stmt::Break(_) | Stmt::Continue(_) | Stmt::Return(_) | Stmt::Throw(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_merge() {
        let a = Span { start: 4, end: 9 };
        let b = Span { start: 1, end: 6 };
        assert_eq!(a.merge(b), Span { start: 1, end: 9 });
    }

    #[test]
    fn spanned_serializes_transparently() {
        let e = Spanned::unknown(Expr::Literal(Literal::Int(3)));
        let json = serde_json::to_string(&e).unwrap();
        assert_eq!(json, r#"{"Literal":{"Int":3}}"#);
    }

    #[test]
    fn exit_statements() {
        assert!(Stmt::Break(None).is_exit());
        assert!(Stmt::Return(None).is_exit());
        assert!(!Stmt::Block(vec![]).is_exit());
    }
}
