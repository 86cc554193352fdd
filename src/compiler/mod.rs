//! Lowers a module graph into a register bytecode `Program`.

use std::collections::HashMap;

use crate::ast::{ClassField, FuncDecl, Import, ModuleGraph, Position, SourceFile, Span, Spanned, Stmt};
use crate::native::NativeRegistry;
use crate::program::{
    Address, AddressKind, Class, Constant, Field, Function, FunctionKind, Instruction, Location, Opcode, Program,
    Register,
};

mod expr;
mod stmt;

const GLOBAL: usize = 0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Compiler error: {message}\n -> {file}:{position}")]
pub struct CompileError {
    pub message: String,
    pub position: Position,
    pub file: String,
    pub span: Span,
}

type Result<T> = std::result::Result<T, CompileError>;

/// Compiles every module of `graph`, then the entry file.
pub fn compile(graph: &ModuleGraph, natives: &NativeRegistry) -> Result<Program> {
    let mut c = Compiler::new(natives);
    c.compile_graph(graph)?;
    Ok(c.program)
}

// ── Compiler state ──────────────────────────────────────────────────

/// Compile-time companion of a `Function`, same index.
#[derive(Debug, Default)]
struct FuncInfo {
    parent: Option<usize>,
    module: String,
    register_top: usize,
    scopes: Vec<usize>,
    /// Positions in `registers` captured by nested functions.
    closure_regs: Vec<usize>,
    /// Created with `clo`, so its frames inherit the creator's cells.
    forwards: bool,
}

#[derive(Debug)]
struct Unresolved {
    name: String,
    id: u32,
    pos: Position,
    span: Span,
    file: String,
    pc: usize,
    module: String,
    function: usize,
}

/// A captured register. Its position in `Compiler::closures` is the
/// temporary operand value until the owning top level function is done.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ClosureRef {
    func: usize,
    reg: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BranchKind {
    Loop,
    Switch,
    Try,
}

#[derive(Debug)]
struct Branch {
    kind: BranchKind,
    label: Option<String>,
    continue_pc: usize,
    breaks: Vec<usize>,
    continues: Vec<usize>,
    in_finally: bool,
}

pub struct Compiler<'n> {
    program: Program,
    natives: &'n NativeRegistry,
    funcs: Vec<FuncInfo>,
    by_name: HashMap<String, usize>,
    class_modules: HashMap<String, String>,
    current: usize,
    module: String,
    file: usize,
    file_name: String,
    imports: Vec<Import>,
    unresolved: Vec<Unresolved>,
    next_unresolved: u32,
    closures: Vec<ClosureRef>,
    branches: Vec<Branch>,
    pending_label: Option<String>,
    init_funcs: Vec<String>,
}

impl<'n> Compiler<'n> {
    pub fn new(natives: &'n NativeRegistry) -> Self {
        let global = Function {
            name: "@global".to_string(),
            kind: FunctionKind::Global,
            is_global: true,
            ..Default::default()
        };
        let mut by_name = HashMap::new();
        by_name.insert(global.name.clone(), GLOBAL);
        let mut program = Program::new();
        program.functions.push(global);
        Compiler {
            program,
            natives,
            funcs: vec![FuncInfo::default()],
            by_name,
            class_modules: HashMap::new(),
            current: GLOBAL,
            module: String::new(),
            file: 0,
            file_name: String::new(),
            imports: Vec::new(),
            unresolved: Vec::new(),
            next_unresolved: 0,
            closures: Vec::new(),
            branches: Vec::new(),
            pending_label: None,
            init_funcs: Vec::new(),
        }
    }

    pub fn compile_graph(&mut self, graph: &ModuleGraph) -> Result<()> {
        for (path, file) in &graph.modules {
            self.module = path.clone();
            self.compile_file(file)?;
        }

        self.module = String::new();
        self.compile_file(&graph.main)?;

        self.fix_unresolved()?;
        self.generate_inits()?;

        self.current = GLOBAL;
        self.ensure_return();
        tracing::debug!(
            functions = self.program.functions.len(),
            constants = self.program.constants.len(),
            "compiled program"
        );
        Ok(())
    }

    fn compile_file(&mut self, file: &SourceFile) -> Result<()> {
        self.imports = file.imports.clone();
        self.file_name = file.path.clone();
        self.file = match self.program.file_index(&file.path) {
            Some(i) => i,
            None => {
                self.program.files.push(file.path.clone());
                self.program.files.len() - 1
            }
        };

        for d in &file.directives {
            let (key, value) = d.split_once(' ').unwrap_or((d.as_str(), ""));
            self.program.add_directive(key, value);
        }

        let is_enum = |s: &&Spanned<Stmt>| matches!(s.node, Stmt::Var { is_enum: true, .. });
        let enums = file.stmts.iter().filter(is_enum);
        let rest = file.stmts.iter().filter(|s| !is_enum(s));
        for s in enums.chain(rest) {
            self.current = GLOBAL;
            self.compile_stmt(s)?;
        }
        Ok(())
    }

    /// Calls every `init` function, sorted by name, at the end of the global function.
    fn generate_inits(&mut self) -> Result<()> {
        self.module = String::new();
        self.current = GLOBAL;
        let mut names = std::mem::take(&mut self.init_funcs);
        names.sort();
        for name in names {
            let Some(&index) = self.by_name.get(&name) else {
                return Err(self.error(Position::NONE, Span::UNKNOWN, format!("Undeclared identifier: {}", name)));
            };
            self.emit(Opcode::Cal, Address::func(index), Address::VOID, Address::VOID, Position::NONE);
        }
        Ok(())
    }

    fn error(&self, pos: Position, span: Span, message: impl Into<String>) -> CompileError {
        CompileError { message: message.into(), position: pos, file: self.file_name.clone(), span }
    }

    // ── Emission ────────────────────────────────────────────────────

    fn pc(&self) -> usize {
        self.program.functions[self.current].instructions.len()
    }

    fn emit(&mut self, op: Opcode, a: Address, b: Address, c: Address, pos: Position) -> usize {
        let file = self.file;
        let f = &mut self.program.functions[self.current];
        f.instructions.push(Instruction::new(op, a, b, c));
        f.positions.push(Location { file, line: pos.line, column: pos.column });
        f.instructions.len() - 1
    }

    fn inst_mut(&mut self, pc: usize) -> &mut Instruction {
        &mut self.program.functions[self.current].instructions[pc]
    }

    fn ensure_return(&mut self) {
        self.emit(Opcode::Ret, Address::VOID, Address::VOID, Address::VOID, Position::NONE);
    }

    fn constant(&mut self, k: Constant) -> Address {
        self.program.add_constant(k)
    }

    // ── Registers and scopes ────────────────────────────────────────

    /// Globals are qualified with their module so modules can't collide.
    fn register_name(&self, name: &str) -> String {
        if name.contains('.') || self.module.is_empty() {
            return name.to_string();
        }
        format!("{}.{}", self.module, name)
    }

    fn new_register(&mut self, name: &str, exported: bool) -> Address {
        let is_global = self.current == GLOBAL;
        let name = if is_global { self.register_name(name) } else { name.to_string() };
        let start_pc = self.pc();

        let info = &mut self.funcs[self.current];
        let index = info.register_top;
        info.register_top += 1;
        let top = info.register_top;

        let f = &mut self.program.functions[self.current];
        f.max_reg_index = f.max_reg_index.max(top);
        f.registers.push(Register {
            name,
            index,
            start_pc,
            end_pc: None,
            exported,
            module: self.module.clone(),
        });

        if is_global { Address::global(index) } else { Address::local(index) }
    }

    fn temp_register(&mut self) -> Address {
        self.new_register("@", false)
    }

    fn open_scope(&mut self) {
        let info = &mut self.funcs[self.current];
        info.scopes.push(info.register_top);
    }

    fn close_scope(&mut self) {
        let Some(mark) = self.funcs[self.current].scopes.pop() else {
            return;
        };
        let f = &mut self.program.functions[self.current];
        let end = f.instructions.len().saturating_sub(1);
        for r in f.registers.iter_mut().filter(|r| r.index >= mark && r.end_pc.is_none()) {
            r.end_pc = Some(end);
        }
    }

    /// True if `name` is already declared in the innermost open scope.
    fn is_in_scope(&self, name: &str) -> bool {
        let name = if self.current == GLOBAL { self.register_name(name) } else { name.to_string() };
        let pc = self.pc();
        let start = self.funcs[self.current].scopes.last().copied().unwrap_or(0);
        self.program.functions[self.current]
            .registers
            .iter()
            .skip(start)
            .any(|r| r.name == name && r.is_live(pc))
    }

    // ── Name resolution ─────────────────────────────────────────────

    /// Resolves `name` as seen from function `fi` at its current pc.
    fn find_register(&mut self, name: &str, fi: usize, pos: Position) -> Result<Option<Address>> {
        if !self.program.functions[fi].is_global {
            let f = &self.program.functions[fi];
            let pc = f.instructions.len();
            let local = f.registers.iter().rev().find(|r| {
                !(r.start_pc > 0 && r.start_pc >= pc) && r.name == name && r.is_live(pc)
            });
            if let Some(r) = local {
                return Ok(Some(Address::local(r.index)));
            }

            let mut parent = self.funcs[fi].parent;
            while let Some(p) = parent {
                let pf = &self.program.functions[p];
                if pf.is_global {
                    break;
                }
                let pc = pf.instructions.len();
                let found = pf
                    .registers
                    .iter()
                    .rposition(|r| r.name == name && pc >= r.start_pc && r.is_live(pc));
                if let Some(reg) = found {
                    let id = self.mark_as_closure(p, reg);
                    return Ok(Some(Address::new(AddressKind::Closure, id)));
                }
                parent = self.funcs[p].parent;
            }
        }

        let qualified = self.register_name(name);

        let g = &self.program.functions[GLOBAL];
        let pc = g.instructions.len();
        let global = g.registers.iter().rev().find(|r| {
            r.start_pc < pc
                && r.name == qualified
                && r.is_live(pc)
                && (r.module == self.module || r.exported)
        });
        if let Some(r) = global {
            return Ok(Some(Address::global(r.index)));
        }

        if let Some(class) = self.program.classes.iter().find(|c| c.name == qualified) {
            let same_module = self.class_modules.get(&class.name) == Some(&self.module);
            if !class.exported && !same_module {
                return Err(self.error(pos, Span::UNKNOWN, format!("{} is not exported", name)));
            }
            let class_name = class.name.clone();
            return Ok(Some(self.constant(Constant::string(&class_name))));
        }

        if let Some(&index) = self.by_name.get(&qualified) {
            let f = &self.program.functions[index];
            if !name.contains('@') && self.funcs[index].module != self.module && !f.exported {
                return Err(self.error(pos, Span::UNKNOWN, format!("{} is not exported", name)));
            }
            return Ok(Some(Address::func(index)));
        }

        if self.natives.is_builtin(name)
            && let Some(nf) = self.natives.lookup(name)
        {
            return Ok(Some(Address::new(AddressKind::NativeFunc, nf.index)));
        }

        Ok(None)
    }

    /// `alias.name` where `alias` is an imported module.
    fn find_module_register(&mut self, alias: &str, name: &str, pos: Position) -> Result<Option<Address>> {
        let Some(path) = self.imports.iter().find(|i| i.alias.as_deref() == Some(alias)).map(|i| i.path.clone())
        else {
            return Ok(None);
        };

        let full = format!("{}.{}", path, name);
        if let Some(addr) = self.find_register(&full, GLOBAL, pos)? {
            return Ok(Some(addr));
        }

        // a local with the alias' name shadows the module
        if self.find_register(alias, self.current, pos)?.is_none() {
            return Ok(Some(self.get_unresolved(&full, pos, Span::UNKNOWN)));
        }
        Ok(None)
    }

    /// Returns a placeholder fixed up once the whole graph is compiled.
    fn get_unresolved(&mut self, name: &str, pos: Position, span: Span) -> Address {
        let existing = self.unresolved.iter().rev().find(|u| u.name == name && u.module == self.module);
        let id = match existing {
            Some(u) => u.id,
            None => {
                self.next_unresolved += 1;
                self.next_unresolved - 1
            }
        };
        self.unresolved.push(Unresolved {
            name: name.to_string(),
            id,
            pos,
            span,
            file: self.file_name.clone(),
            pc: self.pc(),
            module: self.module.clone(),
            function: self.current,
        });
        Address::new(AddressKind::Unresolved, id as usize)
    }

    fn fix_unresolved(&mut self) -> Result<()> {
        let entries = std::mem::take(&mut self.unresolved);
        let mut resolved: HashMap<u32, Address> = HashMap::new();

        for u in &entries {
            self.module = u.module.clone();
            self.file_name = u.file.clone();

            let undeclared = || CompileError {
                message: format!("Undeclared identifier: {}", u.name),
                position: u.pos,
                file: u.file.clone(),
                span: u.span,
            };

            let addr = self.find_register(&u.name, GLOBAL, u.pos)?.ok_or_else(undeclared)?;

            // a global of the same module can't be used by top level code before its declaration
            if addr.kind == AddressKind::Global && u.function == GLOBAL {
                let r = &self.program.functions[GLOBAL].registers[addr.index()];
                if r.module == u.module && r.start_pc >= u.pc {
                    return Err(undeclared());
                }
            }

            tracing::trace!(name = %u.name, address = %addr, "resolved forward reference");
            resolved.insert(u.id, addr);
        }

        for f in &mut self.program.functions {
            for inst in &mut f.instructions {
                for operand in [&mut inst.a, &mut inst.b, &mut inst.c] {
                    if operand.kind == AddressKind::Unresolved
                        && let Some(addr) = resolved.get(&operand.value)
                    {
                        *operand = *addr;
                    }
                }
            }
        }
        Ok(())
    }

    // ── Closures ────────────────────────────────────────────────────

    fn mark_as_closure(&mut self, func: usize, reg: usize) -> usize {
        let r = ClosureRef { func, reg };
        if self.funcs[func].closure_regs.contains(&reg)
            && let Some(id) = self.closures.iter().position(|c| *c == r)
        {
            return id;
        }
        self.funcs[func].closure_regs.push(reg);
        self.closures.push(r);
        self.closures.len() - 1
    }

    /// True if the function or a non-global ancestor has captured registers.
    fn needs_closure(&self, fi: usize) -> bool {
        let mut next = Some(fi);
        while let Some(i) = next {
            if self.program.functions[i].is_global {
                break;
            }
            if !self.funcs[i].closure_regs.is_empty() {
                return true;
            }
            next = self.funcs[i].parent;
        }
        false
    }

    /// Rewrites closure operands of the functions nested in `top` from capture
    /// ids to their index in the cell list the VM builds for the owner's
    /// frame: the cells each `clo` forwarded down to it, outermost first,
    /// followed by the owner's own. A function referenced with a plain `mov`
    /// starts with no cells, so the walk stops there.
    fn update_closure_indexes(&mut self, top: usize) {
        if self.closures.is_empty() {
            return;
        }

        let finals: Vec<usize> = self
            .closures
            .iter()
            .map(|cl| {
                let own = self.funcs[cl.func].closure_regs.iter().position(|&r| r == cl.reg).unwrap_or(0);
                let mut offset = 0;
                let mut child = cl.func;
                while self.funcs[child].forwards
                    && let Some(p) = self.funcs[child].parent
                {
                    offset += self.funcs[p].closure_regs.len();
                    child = p;
                }
                offset + own
            })
            .collect();

        for f in self.program.functions.iter_mut().skip(top + 1) {
            for inst in &mut f.instructions {
                for operand in [&mut inst.a, &mut inst.b, &mut inst.c] {
                    if operand.kind == AddressKind::Closure
                        && let Some(&index) = finals.get(operand.index())
                    {
                        tracing::trace!(function = %f.name, from = operand.value, to = index, "closure index");
                        *operand = Address::new(AddressKind::Closure, index);
                    }
                }
            }
        }
    }

    // ── Functions and classes ───────────────────────────────────────

    fn add_function(&mut self, kind: FunctionKind, name: String, pos: Position) -> Result<usize> {
        if self.by_name.contains_key(&name) {
            return Err(self.error(pos, Span::UNKNOWN, format!("Redeclared function '{}'", name)));
        }
        let index = self.program.functions.len();
        self.by_name.insert(name.clone(), index);
        self.program.functions.push(Function { name, kind, index, ..Default::default() });
        self.funcs.push(FuncInfo {
            parent: Some(self.current),
            module: self.module.clone(),
            ..Default::default()
        });
        self.current = index;
        Ok(index)
    }

    /// Compiles a top level function declaration.
    fn compile_func_decl(&mut self, decl: &FuncDecl, pos: Position, span: Span) -> Result<usize> {
        let mut name = decl.name.clone();
        let mut kind = FunctionKind::User;
        match name.as_str() {
            "init" => {
                if !decl.params.is_empty() {
                    return Err(self.error(pos, span, "init functions can't receive arguments."));
                }
                if decl.exported {
                    return Err(self.error(pos, span, "init functions can't be exported."));
                }
                // renamed so every module can have one
                name = "@init".to_string();
                self.init_funcs.push(self.register_name(&name));
                kind = FunctionKind::Init;
            }
            "main" => kind = FunctionKind::Main,
            _ => {}
        }
        let name = self.register_name(&name);
        self.compile_function(decl, name, kind, false, None, pos)
    }

    /// Shared by declarations, lambdas, methods and constructors. `receiver`
    /// reserves a `this` register after the parameters and runs the field
    /// initializers first.
    fn compile_function(
        &mut self,
        decl: &FuncDecl,
        name: String,
        kind: FunctionKind,
        anonymous: bool,
        receiver: Option<&[ClassField]>,
        pos: Position,
    ) -> Result<usize> {
        let index = self.add_function(kind, name, pos)?;
        {
            let f = &mut self.program.functions[index];
            f.arguments = decl.params.len();
            f.variadic = decl.variadic;
            f.exported = decl.exported;
            f.is_class = receiver.is_some();
        }

        if !anonymous {
            self.closures.clear();
        }
        let outer_branches = std::mem::take(&mut self.branches);

        self.open_scope();
        for p in &decl.params {
            self.new_register(p, false);
        }
        if let Some(fields) = receiver {
            let this = self.new_register("this", false);
            for field in fields {
                let key = self.constant(Constant::string(&field.name));
                let value = match &field.value {
                    Some(v) => self.compile_expr(v, Address::VOID)?,
                    None => self.constant(Constant::Null),
                };
                self.emit(Opcode::Set, this, key, value, pos);
            }
        }
        self.compile_stmts(&decl.body)?;
        self.ensure_return();
        self.close_scope();

        self.branches = outer_branches;

        let regs: Vec<Register> = {
            let f = &self.program.functions[index];
            self.funcs[index].closure_regs.iter().map(|&r| f.registers[r].clone()).collect()
        };
        self.program.functions[index].closures = regs;

        let parent = self.funcs[index].parent.unwrap_or(GLOBAL);
        self.current = parent;
        if self.program.functions[parent].is_global {
            self.update_closure_indexes(index);
        }

        tracing::debug!(
            function = %self.program.functions[index].name,
            instructions = self.program.functions[index].instructions.len(),
            "compiled function"
        );
        Ok(index)
    }

    fn compile_class(&mut self, decl: &crate::ast::ClassDecl, pos: Position) -> Result<()> {
        let name = self.register_name(&decl.name);
        if self.class_modules.contains_key(&name) {
            return Err(self.error(pos, Span::UNKNOWN, format!("Redeclared class '{}'", name)));
        }

        let class_index = self.program.classes.len();
        self.program.classes.push(Class {
            name: name.clone(),
            fields: decl.fields.iter().map(|f| Field { name: f.name.clone(), exported: f.exported }).collect(),
            functions: Vec::new(),
            exported: decl.exported,
        });
        self.class_modules.insert(name.clone(), self.module.clone());

        self.current = GLOBAL;
        self.closures.clear();

        let mut functions = Vec::new();
        if decl.constructor.is_some() || !decl.fields.is_empty() {
            let generated = FuncDecl::default();
            let ctor = decl.constructor.as_ref().unwrap_or(&generated);
            let fname = format!("{}.prototype.constructor", name);
            functions.push(self.compile_function(ctor, fname, FunctionKind::User, false, Some(&decl.fields), pos)?);
        }
        for m in &decl.methods {
            let fname = format!("{}.prototype.{}", name, m.name);
            functions.push(self.compile_function(m, fname, FunctionKind::User, false, Some(&[][..]), pos)?);
        }

        self.program.classes[class_index].functions = functions;
        self.current = GLOBAL;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ModuleGraph;
    use crate::parser::{loader, parse};
    use pretty_assertions::assert_eq;

    fn compile_str(source: &str) -> Result<Program> {
        let file = match parse(source, "") {
            Ok(f) => f,
            Err(e) => panic!("parse error: {}", e),
        };
        compile(&ModuleGraph::single(file), &NativeRegistry::with_prelude())
    }

    fn compile_ok(source: &str) -> Program {
        match compile_str(source) {
            Ok(p) => p,
            Err(e) => panic!("compile error: {}", e),
        }
    }

    fn compile_err(source: &str) -> String {
        match compile_str(source) {
            Ok(_) => panic!("expected a compile error for {:?}", source),
            Err(e) => e.message,
        }
    }

    fn function<'a>(p: &'a Program, name: &str) -> &'a Function {
        match p.functions.iter().find(|f| f.name == name) {
            Some(f) => f,
            None => panic!("function {} not found", name),
        }
    }

    fn ops(p: &Program, name: &str) -> Vec<Opcode> {
        function(p, name).instructions.iter().map(|i| i.op).collect()
    }

    fn compile_modules(main: &str, modules: &[(&str, &str)]) -> Result<Program> {
        let graph = loader::load_with("/main", "main.ts", main, |key| {
            let text = modules.iter().find(|(k, _)| *k == key).map(|(_, t)| t.to_string()).unwrap_or_default();
            Ok((format!("{}.ts", key), text))
        })
        .unwrap();
        compile(&graph, &NativeRegistry::with_prelude())
    }

    #[test]
    fn global_function_comes_first() {
        let p = compile_ok("let x = 1 + 2");
        assert_eq!(p.functions[0].name, "@global");
        assert!(p.functions[0].is_global);
        assert_eq!(ops(&p, "@global"), vec![Opcode::Add, Opcode::Ret]);
        assert_eq!(p.functions[0].registers[0].name, "x");
    }

    #[test]
    fn literal_with_destination_is_loaded() {
        let p = compile_ok("let x = 5");
        let g = &p.functions[0];
        assert_eq!(g.instructions[0], Instruction::new(Opcode::Ldk, Address::global(0), Address::constant(0), Address::VOID));
    }

    #[test]
    fn var_without_value_is_undefined() {
        let p = compile_ok("let x");
        assert_eq!(ops(&p, "@global"), vec![Opcode::Ldk, Opcode::Ret]);
        assert_eq!(p.constants[0], Constant::Undefined);
    }

    #[test]
    fn every_function_ends_with_return() {
        let p = compile_ok("function main() { let a = 1 }");
        let main = function(&p, "main");
        assert_eq!(main.kind, FunctionKind::Main);
        assert_eq!(main.instructions.last().map(|i| i.op), Some(Opcode::Ret));
    }

    #[test]
    fn parameters_take_the_first_registers() {
        let p = compile_ok("function add(a, b) { let c = a + b\n return c }");
        let f = function(&p, "add");
        assert_eq!(f.arguments, 2);
        let names: Vec<&str> = f.registers.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(f.instructions[0], Instruction::new(Opcode::Add, Address::local(2), Address::local(0), Address::local(1)));
    }

    #[test]
    fn unary_constants_are_folded() {
        let p = compile_ok("let a = -5\nlet b = !true\nlet c = ~0");
        assert_eq!(ops(&p, "@global"), vec![Opcode::Ldk, Opcode::Ldk, Opcode::Ldk, Opcode::Ret]);
        assert!(p.constants.contains(&Constant::Int(-5)));
        assert!(p.constants.contains(&Constant::Bool(false)));
        assert!(p.constants.contains(&Constant::Int(-1)));
    }

    #[test]
    fn invalid_unary_on_constant() {
        assert_eq!(compile_err("let a = !1"), "Invalid unary operator !");
    }

    #[test]
    fn greater_than_swaps_operands() {
        let p = compile_ok("function f(a, b) { return a > b }");
        let f = function(&p, "f");
        assert_eq!(f.instructions[0], Instruction::new(Opcode::Lst, Address::local(2), Address::local(1), Address::local(0)));
    }

    #[test]
    fn forward_function_reference_is_resolved() {
        let p = compile_ok("function main() { return foo() }\nfunction foo() { return 1 }");
        let main = function(&p, "main");
        let foo = function(&p, "foo").index;
        assert_eq!(main.instructions[0].op, Opcode::Cal);
        assert_eq!(main.instructions[0].a, Address::func(foo));
        for f in &p.functions {
            for i in &f.instructions {
                assert!([i.a, i.b, i.c].iter().all(|a| a.kind != AddressKind::Unresolved));
            }
        }
    }

    #[test]
    fn undeclared_identifier() {
        assert_eq!(compile_err("function main() { return y }"), "Undeclared identifier: y");
    }

    #[test]
    fn block_local_is_gone_after_the_block() {
        assert_eq!(compile_err("function main() { { let a = 1 }\n return a }"), "Undeclared identifier: a");
        assert_eq!(compile_err("function main() { let z = 0\n { let a = z }\n return a }"), "Undeclared identifier: a");
    }

    #[test]
    fn global_used_before_declaration() {
        assert_eq!(compile_err("let a = b\nlet b = 1"), "Undeclared identifier: b");
    }

    #[test]
    fn redeclared_identifier() {
        assert_eq!(compile_err("let x = 1\nlet x = 2"), "Redeclared identifier in the same block: 'x'");
        // a nested block may shadow
        compile_ok("function f() { let x = 1\n { let x = 2 } }");
    }

    #[test]
    fn redeclared_function() {
        assert_eq!(compile_err("function f() {}\nfunction f() {}"), "Redeclared function 'f'");
    }

    #[test]
    fn single_argument_uses_cas() {
        let p = compile_ok("function f(a) { return a }\nfunction main() { f(1)\n f(1, 2) }");
        assert_eq!(ops(&p, "main"), vec![Opcode::Cas, Opcode::Arr, Opcode::Set, Opcode::Set, Opcode::Cal, Opcode::Ret]);
        // statement calls drop the result
        let main = function(&p, "main");
        assert!(main.instructions[0].b.is_void());
    }

    #[test]
    fn spread_call_appends_spa() {
        let p = compile_ok("function f(...a) { return a }\nfunction main() { let x = [1]\n f(...x) }");
        assert!(function(&p, "f").variadic);
        assert!(ops(&p, "main").contains(&Opcode::Spa));
    }

    #[test]
    fn lambda_without_captures_is_a_function_address() {
        let p = compile_ok("function main() { let f = () => 1\n return f }");
        let main = function(&p, "main");
        let lambda = p.functions.iter().find(|f| f.name.starts_with("@lambda_")).map(|f| f.index);
        assert_eq!(main.instructions[0].op, Opcode::Mov);
        assert_eq!(Some(main.instructions[0].b.index()), lambda);
    }

    #[test]
    fn captured_register_becomes_closure() {
        let p = compile_ok("function main() { let a = 1\n let f = () => a\n return f() }");
        let main = function(&p, "main");
        assert_eq!(main.closures.len(), 1);
        assert_eq!(main.closures[0].name, "a");
        assert!(ops(&p, "main").contains(&Opcode::Clo));

        let lambda = p.functions.iter().find(|f| f.name.starts_with("@lambda_")).unwrap();
        assert_eq!(lambda.instructions[0], Instruction::new(
            Opcode::Ret,
            Address::new(AddressKind::Closure, 0),
            Address::VOID,
            Address::VOID
        ));
    }

    #[test]
    fn nested_closure_indexes_follow_ancestors() {
        let src = "function main() {
        let a = 1
        let b = 2
        let f = () => {
            let c = 3
            let g = () => a + b + c
            return g
        }
        return f
    }";
        let p = compile_ok(src);
        let g = p.functions.last().unwrap();
        let closures: Vec<usize> = g
            .instructions
            .iter()
            .flat_map(|i| [i.a, i.b, i.c])
            .filter(|a| a.kind == AddressKind::Closure)
            .map(|a| a.index())
            .collect();
        // a and b are main's cells, c follows them
        assert_eq!(closures, vec![0, 1, 2]);
    }

    #[test]
    fn closure_index_skips_cells_of_plain_function_ancestors() {
        // g is emitted as a plain function address before main captures a,
        // so frames below g never inherit main's cells
        let src = "function main() {
        let g = () => {
            let x = () => {
                let c = 3
                return () => c
            }
            return x()()
        }
        let a = 1
        let k = () => a
        return g() + k()
    }";
        let p = compile_ok(src);
        let closures: Vec<usize> = p
            .functions
            .iter()
            .filter(|f| f.name.starts_with("@lambda_"))
            .flat_map(|f| &f.instructions)
            .flat_map(|i| [i.a, i.b, i.c])
            .filter(|a| a.kind == AddressKind::Closure)
            .map(|a| a.index())
            .collect();
        assert_eq!(closures, vec![0, 0]);
    }

    #[test]
    fn nested_named_function_is_a_local() {
        let p = compile_ok("function main() { function inner() { return 1 }\n return inner() }");
        let main = function(&p, "main");
        assert_eq!(main.registers[0].name, "inner");
        assert_eq!(main.instructions[0].op, Opcode::Mov);
    }

    #[test]
    fn break_outside_loop() {
        assert_eq!(compile_err("function main() { break }"), "Unexpected exit");
    }

    #[test]
    fn continue_inside_switch_only() {
        assert_eq!(compile_err("function main() { switch (1) { case 1: continue } }"), "Invalid continue");
    }

    #[test]
    fn break_inside_finally() {
        let src = "function main() { while (true) { try { } finally { break } } }";
        assert_eq!(compile_err(src), "Control cannot leave the body of a finally clause");
    }

    #[test]
    fn break_inside_try_leaves_it() {
        let p = compile_ok("function main() { while (true) { try { break } catch { } } }");
        let ops = ops(&p, "main");
        let trx = ops.iter().position(|o| *o == Opcode::Trx).unwrap();
        assert_eq!(ops[trx + 1], Opcode::Jmp);
    }

    #[test]
    fn unknown_label() {
        assert_eq!(compile_err("function main() { for (;;) { break nope } }"), "Invalid break");
    }

    #[test]
    fn label_on_block_is_an_error() {
        assert_eq!(compile_err("function main() { here: { } }"), "Invalid label 'here'");
    }

    #[test]
    fn labeled_break_jumps_past_outer_loop() {
        let p = compile_ok("function main() { outer: while (true) { while (true) { break outer } } }");
        let main = function(&p, "main");
        let (pc, jmp) = main
            .instructions
            .iter()
            .enumerate()
            .find(|(_, i)| i.op == Opcode::Jmp)
            .unwrap();
        let target = pc + jmp.a.index() + 1;
        // the final RET follows the outer loop
        assert_eq!(target, main.instructions.len() - 1);
    }

    #[test]
    fn switch_fallthrough_needs_empty_case() {
        let src = "function main() { switch (1) { case 1: let a = 1\n case 2: break } }";
        assert_eq!(compile_err(src), "Fallthrough is only allowed in empty case");
        compile_ok("function main() { switch (1) { case 1:\n case 2: return 2\n default: return 3 } }");
    }

    #[test]
    fn switch_empty_case_jumps_to_next_body() {
        let p = compile_ok("function main(x) { switch (x) { case 1:\n case 2: return 2 } }");
        let main = function(&p, "main");
        let ejp = main.instructions.iter().position(|i| i.op == Opcode::Ejp).unwrap();
        let djp = main.instructions.iter().position(|i| i.op == Opcode::Djp).unwrap();
        assert_eq!(ejp + main.instructions[ejp].c.index() + 1, djp + 1);
    }

    #[test]
    fn try_operands() {
        let p = compile_ok("function main() { try { throw 1 } catch (e) { return e } finally { let x = 2 } }");
        let main = function(&p, "main");
        let t = main.instructions[0];
        assert_eq!(t.op, Opcode::Try);
        assert_eq!(main.instructions[t.c.index()].op, Opcode::Ldk);
        assert_eq!(main.instructions[t.a.index()].op, Opcode::Ret);
        let e = &main.registers[t.b.index()];
        assert_eq!(e.name, "e");
        assert_eq!(e.start_pc, 0);
        assert!(ops(&p, "main").contains(&Opcode::Fen));
        assert!(!ops(&p, "main").contains(&Opcode::Tre));
    }

    #[test]
    fn try_without_finally_ends_with_tre_and_cen() {
        let p = compile_ok("function main() { try { } catch { } }");
        assert_eq!(ops(&p, "main"), vec![Opcode::Try, Opcode::Tre, Opcode::Jmp, Opcode::Cen, Opcode::Ret]);
    }

    #[test]
    fn for_of_iterates_values() {
        let p = compile_ok("function main() { for (let v of [1, 2]) { } }");
        let ops = ops(&p, "main");
        assert!(ops.contains(&Opcode::Val));
        assert!(ops.contains(&Opcode::Len));
        assert_eq!(ops.iter().filter(|o| **o == Opcode::Jpb).count(), 1);
    }

    #[test]
    fn class_functions() {
        let p = compile_ok("class Foo { x = 1\n bar() { return this.x } }\nfunction main() { return new Foo() }");
        let class = p.class("Foo").unwrap();
        assert_eq!(class.functions.len(), 2);
        let ctor = function(&p, "Foo.prototype.constructor");
        assert!(ctor.is_class);
        assert_eq!(ctor.registers[0].name, "this");
        assert_eq!(ctor.instructions[0].op, Opcode::Set);
        assert_eq!(function(&p, "Foo.prototype.bar").registers[0].name, "this");
        assert_eq!(ops(&p, "main"), vec![Opcode::New, Opcode::Ret, Opcode::Ret]);
    }

    #[test]
    fn init_functions_are_called_by_global() {
        let p = compile_ok("function init() { }");
        let init = function(&p, "@init");
        assert_eq!(init.kind, FunctionKind::Init);
        let g = &p.functions[0];
        assert_eq!(g.instructions[0], Instruction::new(Opcode::Cal, Address::func(init.index), Address::VOID, Address::VOID));
    }

    #[test]
    fn init_restrictions() {
        assert_eq!(compile_err("function init(a) { }"), "init functions can't receive arguments.");
        assert_eq!(compile_err("export function init() { }"), "init functions can't be exported.");
    }

    #[test]
    fn directives_are_recorded() {
        let p = compile_ok("/// permissions fs net\nlet x = 1");
        assert!(p.has_permission("net"));
    }

    #[test]
    fn native_function_and_property() {
        let p = compile_ok("function main() { console.log(math.pi) }");
        assert_eq!(ops(&p, "main"), vec![Opcode::Rnp, Opcode::Cas, Opcode::Ret]);
        let cas = function(&p, "main").instructions[1];
        assert_eq!(cas.a.kind, AddressKind::NativeFunc);
    }

    #[test]
    fn module_members_are_qualified() {
        let p = compile_modules(
            "import * as m from \"./m\"\nfunction main() { return m.f() + m.x }",
            &[("/m", "export let x = 1\nexport function f() { return x }")],
        )
        .unwrap();
        assert!(p.functions.iter().any(|f| f.name == "/m.f"));
        assert_eq!(p.functions[0].registers[0].name, "/m.x");
        let main = function(&p, "main");
        assert_eq!(main.instructions[0].a.kind, AddressKind::Func);
    }

    #[test]
    fn other_module_global_is_visible_before_its_declaration() {
        // /a compiles before /b, so b.y is still a forward reference there
        let p = compile_modules(
            "import * as a from \"./a\"\nfunction main() { return a.z }",
            &[("/a", "import * as b from \"./b\"\nexport let z = b.y"), ("/b", "export let y = 1")],
        );
        assert!(p.is_ok(), "{:?}", p.err());
    }

    #[test]
    fn unexported_module_function() {
        let err = compile_modules(
            "import * as m from \"./m\"\nfunction main() { return m.g() }",
            &[("/m", "function g() { return 1 }")],
        )
        .unwrap_err();
        assert_eq!(err.message, "/m.g is not exported");
    }

    #[test]
    fn compile_error_display() {
        let err = CompileError {
            message: "Undeclared identifier: y".into(),
            position: Position { line: 3, column: 7 },
            file: "main.ts".into(),
            span: Span::UNKNOWN,
        };
        assert_eq!(err.to_string(), "Compiler error: Undeclared identifier: y\n -> main.ts:3:7");
    }
}
