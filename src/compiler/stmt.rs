use super::{Branch, BranchKind, Compiler, GLOBAL, Result};
use crate::ast::{
    CatchClause, Expr, ForEachKind, FuncDecl, IfBranch, Position, Span, Spanned, Stmt, SwitchCase, UpdateOp,
};
use crate::program::{Address, Constant, FunctionKind, Opcode};

const FALLTHROUGH_ERR: &str = "Fallthrough is only allowed in empty case";

impl Compiler<'_> {
    pub(super) fn compile_stmts(&mut self, stmts: &[Spanned<Stmt>]) -> Result<()> {
        for s in stmts {
            self.compile_stmt(s)?;
        }
        Ok(())
    }

    /// A nested block gets its own scope.
    fn compile_block(&mut self, stmts: &[Spanned<Stmt>]) -> Result<()> {
        self.open_scope();
        self.compile_stmts(stmts)?;
        self.close_scope();
        Ok(())
    }

    pub(super) fn compile_stmt(&mut self, s: &Spanned<Stmt>) -> Result<()> {
        let pos = s.pos;
        match &s.node {
            Stmt::Var { name, value, exported, .. } => self.compile_var(name, value.as_ref(), *exported, pos, s.span),
            Stmt::Function(decl) if self.current == GLOBAL => self.compile_func_decl(decl, pos, s.span).map(|_| ()),
            Stmt::Function(decl) => self.compile_nested_function(decl, pos, s.span),
            Stmt::Class(decl) => self.compile_class(decl, pos),
            Stmt::Assign { target, value } => self.compile_assign(target, value),
            Stmt::Update { target, op } => self.compile_update(target, *op),
            Stmt::Expr(e) => match &e.node {
                Expr::Call { callee, args, spread } => {
                    self.compile_call(callee, args, *spread, Address::VOID, false, e.pos).map(|_| ())
                }
                _ => self.compile_expr(e, Address::VOID).map(|_| ()),
            },
            Stmt::Return(value) => {
                let r = match value {
                    Some(v) => self.compile_expr(v, Address::VOID)?,
                    None => Address::VOID,
                };
                self.emit(Opcode::Ret, r, Address::VOID, Address::VOID, pos);
                Ok(())
            }
            Stmt::Block(stmts) => self.compile_block(stmts),
            Stmt::If { branches, otherwise } => self.compile_if(branches, otherwise.as_deref(), pos),
            Stmt::Switch { subject, cases, default } => self.compile_switch(subject, cases, default.as_deref(), pos),
            Stmt::For { init, cond, step, body } => {
                if init.is_empty() && cond.is_none() && step.is_none() {
                    self.compile_infinite_loop(body)
                } else {
                    self.compile_for(init, cond.as_ref(), step.as_deref(), body, pos)
                }
            }
            Stmt::ForEach { kind, name, iterable, body } => self.compile_for_each(*kind, name, iterable, body, pos),
            Stmt::While { cond, body } => self.compile_while(cond, body, pos),
            Stmt::Throw(value) => {
                let e = self.compile_expr(value, Address::VOID)?;
                self.emit(Opcode::Trw, e, Address::VOID, Address::VOID, pos);
                Ok(())
            }
            Stmt::Try { body, catch, finally } => self.compile_try(body, catch.as_ref(), finally.as_deref(), pos),
            Stmt::Break(label) => self.compile_break(label.as_deref(), pos, s.span),
            Stmt::Continue(label) => self.compile_continue(label.as_deref(), pos, s.span),
            Stmt::Labeled { label, body } => {
                if !matches!(body.node, Stmt::For { .. } | Stmt::ForEach { .. } | Stmt::While { .. } | Stmt::Switch { .. }) {
                    return Err(self.error(pos, s.span, format!("Invalid label '{}'", label)));
                }
                self.pending_label = Some(label.clone());
                self.compile_stmt(body)
            }
        }
    }

    fn compile_var(
        &mut self,
        name: &str,
        value: Option<&Spanned<crate::ast::Expr>>,
        exported: bool,
        pos: Position,
        span: Span,
    ) -> Result<()> {
        if self.is_in_scope(name) {
            return Err(self.error(pos, span, format!("Redeclared identifier in the same block: '{}'", name)));
        }
        let r = self.new_register(name, exported);
        match value {
            Some(v) => {
                self.compile_expr(v, r)?;
            }
            None => {
                let k = self.constant(Constant::Undefined);
                self.emit(Opcode::Ldk, r, k, Address::VOID, pos);
            }
        }
        Ok(())
    }

    /// A named function inside a body is a local holding a lambda.
    fn compile_nested_function(&mut self, decl: &FuncDecl, pos: Position, span: Span) -> Result<()> {
        if self.is_in_scope(&decl.name) {
            return Err(self.error(pos, span, format!("Redeclared identifier in the same block: '{}'", decl.name)));
        }
        let r = self.new_register(&decl.name, false);
        self.compile_lambda(decl, r, pos)?;
        Ok(())
    }

    fn compile_assign(&mut self, target: &Spanned<Expr>, value: &Spanned<Expr>) -> Result<()> {
        match &target.node {
            Expr::Ident(_) => {
                let left = self.compile_expr(target, Address::VOID)?;
                self.compile_expr(value, left)?;
            }
            Expr::Selector { object, name } => {
                let x = self.compile_expr(object, Address::VOID)?;
                let key = self.constant(Constant::string(name));
                let v = self.compile_expr(value, Address::VOID)?;
                self.emit(Opcode::Set, x, key, v, target.pos);
            }
            Expr::Index { object, index } => {
                let x = self.compile_expr(object, Address::VOID)?;
                let i = self.compile_expr(index, Address::VOID)?;
                let v = self.compile_expr(value, Address::VOID)?;
                self.emit(Opcode::Set, x, i, v, target.pos);
            }
            _ => return Err(self.error(target.pos, target.span, "Invalid assignment")),
        }
        Ok(())
    }

    /// Identifiers are incremented in place, properties with get/inc/set.
    fn compile_update(&mut self, target: &Spanned<Expr>, op: UpdateOp) -> Result<()> {
        let opcode = match op {
            UpdateOp::Inc => Opcode::Inc,
            UpdateOp::Dec => Opcode::Dec,
        };
        let pos = target.pos;

        let (x, key) = match &target.node {
            Expr::Ident(_) => {
                let r = self.compile_expr(target, Address::VOID)?;
                self.emit(opcode, r, Address::VOID, Address::VOID, pos);
                return Ok(());
            }
            Expr::Selector { object, name } => {
                let x = self.compile_expr(object, Address::VOID)?;
                (x, self.constant(Constant::string(name)))
            }
            Expr::Index { object, index } => {
                let x = self.compile_expr(object, Address::VOID)?;
                (x, self.compile_expr(index, Address::VOID)?)
            }
            _ => return Err(self.error(pos, target.span, "Invalid inc/dec statement")),
        };

        let v = self.temp_register();
        self.emit(Opcode::Get, v, x, key, pos);
        self.emit(opcode, v, Address::VOID, Address::VOID, pos);
        self.emit(Opcode::Set, x, key, v, pos);
        Ok(())
    }

    // ── Conditionals ────────────────────────────────────────────────

    fn compile_if(&mut self, branches: &[IfBranch], otherwise: Option<&[Spanned<Stmt>]>, pos: Position) -> Result<()> {
        if let ([branch], None) = (branches, otherwise) {
            let r = self.compile_expr(&branch.cond, Address::VOID)?;
            // jump over the body if false
            let jump = self.emit(Opcode::Tjp, r, Address::data(1), Address::data(1), pos);
            let body_start = self.pc();
            self.compile_block(&branch.body)?;
            let len = self.pc() - body_start;
            self.inst_mut(jump).b = Address::data(len);
            return Ok(());
        }

        let mut exits = Vec::new();
        for branch in branches {
            let r = self.compile_expr(&branch.cond, Address::VOID)?;
            // when true skip the jump to the next branch
            self.emit(Opcode::Tjp, r, Address::data(1), Address::VOID, branch.cond.pos);
            let jump = self.emit(Opcode::Jmp, Address::VOID, Address::VOID, Address::VOID, Position::NONE);
            let body_start = self.pc();
            self.compile_block(&branch.body)?;
            exits.push(self.emit(Opcode::Jmp, Address::VOID, Address::VOID, Address::VOID, Position::NONE));
            let len = self.pc() - body_start;
            self.inst_mut(jump).a = Address::data(len);
        }

        if let Some(stmts) = otherwise {
            self.compile_block(stmts)?;
        }

        let end = self.pc();
        for pc in exits {
            self.inst_mut(pc).a = Address::data(end - pc - 1);
        }
        Ok(())
    }

    fn compile_switch(
        &mut self,
        subject: &Spanned<Expr>,
        cases: &[SwitchCase],
        default: Option<&[Spanned<Stmt>]>,
        pos: Position,
    ) -> Result<()> {
        self.open_branch(BranchKind::Switch);
        let a = self.compile_expr(subject, Address::VOID)?;

        let mut fallthroughs: Vec<usize> = Vec::new();
        for case in cases {
            if !ends_with_exit(&case.body) {
                return Err(self.error(case.value.pos, case.value.span, FALLTHROUGH_ERR));
            }
            let b = self.compile_expr(&case.value, Address::VOID)?;

            if case.body.is_empty() {
                fallthroughs.push(self.emit(Opcode::Ejp, a, b, Address::VOID, case.value.pos));
                continue;
            }

            // skip the body when different
            let jump = self.emit(Opcode::Djp, a, b, Address::VOID, case.value.pos);
            let body_start = self.pc();
            for pc in fallthroughs.drain(..) {
                self.inst_mut(pc).c = Address::data(body_start - pc - 1);
            }

            self.open_scope();
            self.compile_stmts(&case.body)?;
            self.close_scope();

            let len = self.pc() - body_start;
            self.inst_mut(jump).c = Address::data(len);
        }

        if let Some(stmts) = default {
            if !ends_with_exit(stmts) {
                return Err(self.error(pos, Span::UNKNOWN, FALLTHROUGH_ERR));
            }
            let body_start = self.pc();
            for pc in fallthroughs.drain(..) {
                self.inst_mut(pc).c = Address::data(body_start - pc - 1);
            }
            self.open_scope();
            self.compile_stmts(stmts)?;
            self.close_scope();
        }

        let end = self.pc();
        self.close_branch(end);
        Ok(())
    }

    // ── Loops ───────────────────────────────────────────────────────

    fn compile_for(
        &mut self,
        init: &[Spanned<Stmt>],
        cond: Option<&Spanned<Expr>>,
        step: Option<&Spanned<Stmt>>,
        body: &[Spanned<Stmt>],
        pos: Position,
    ) -> Result<()> {
        self.open_branch(BranchKind::Loop);
        self.open_scope();

        self.compile_stmts(init)?;

        // skip the step on the first iteration
        let first = self.emit(Opcode::Jmp, Address::VOID, Address::VOID, Address::VOID, Position::NONE);
        let loop_start = self.pc();
        self.set_continue_pc(loop_start);

        if let Some(step) = step {
            self.compile_stmt(step)?;
        }
        let len = self.pc() - loop_start;
        self.inst_mut(first).a = Address::data(len);

        let test = match cond {
            Some(cond) => {
                let r = self.compile_expr(cond, Address::VOID)?;
                Some(self.emit(Opcode::Tjp, r, Address::VOID, Address::data(1), pos))
            }
            None => None,
        };
        let body_start = self.pc();

        self.compile_block(body)?;

        let back = self.pc() - loop_start;
        self.emit(Opcode::Jpb, Address::data(back), Address::VOID, Address::VOID, Position::NONE);

        let end = self.pc();
        if let Some(test) = test {
            self.inst_mut(test).b = Address::data(end - body_start);
        }

        self.close_scope();
        self.close_branch(end);
        Ok(())
    }

    fn compile_infinite_loop(&mut self, body: &[Spanned<Stmt>]) -> Result<()> {
        self.open_branch(BranchKind::Loop);
        let body_start = self.pc();
        self.set_continue_pc(body_start);

        self.compile_block(body)?;

        let back = self.pc() - body_start;
        self.emit(Opcode::Jpb, Address::data(back), Address::VOID, Address::VOID, Position::NONE);
        let end = self.pc();
        self.close_branch(end);
        Ok(())
    }

    fn compile_while(&mut self, cond: &Spanned<Expr>, body: &[Spanned<Stmt>], pos: Position) -> Result<()> {
        self.open_branch(BranchKind::Loop);
        self.open_scope();

        let loop_start = self.pc();
        self.set_continue_pc(loop_start);

        let r = self.compile_expr(cond, Address::VOID)?;
        let test = self.emit(Opcode::Tjp, r, Address::VOID, Address::data(1), pos);
        let body_start = self.pc();

        self.compile_block(body)?;

        let back = self.pc() - loop_start;
        self.emit(Opcode::Jpb, Address::data(back), Address::VOID, Address::VOID, Position::NONE);

        let end = self.pc();
        self.inst_mut(test).b = Address::data(end - body_start);

        self.close_scope();
        self.close_branch(end);
        Ok(())
    }

    /// `for (let x in e)` walks the keys, `for (let x of e)` the values.
    fn compile_for_each(
        &mut self,
        kind: ForEachKind,
        name: &str,
        iterable: &Spanned<Expr>,
        body: &[Spanned<Stmt>],
        pos: Position,
    ) -> Result<()> {
        self.open_branch(BranchKind::Loop);
        self.open_scope();

        let source = self.compile_expr(iterable, Address::VOID)?;
        let item = self.new_register(name, false);

        let items = self.temp_register();
        let op = match kind {
            ForEachKind::In => Opcode::Key,
            ForEachKind::Of => Opcode::Val,
        };
        self.emit(op, items, source, Address::VOID, pos);

        let len = self.temp_register();
        self.emit(Opcode::Len, len, items, Address::VOID, Position::NONE);

        let counter = self.temp_register();
        let zero = self.constant(Constant::Int(0));
        self.emit(Opcode::Ldk, counter, zero, Address::VOID, Position::NONE);

        let is_less = self.temp_register();

        // skip the increment on the first iteration
        self.emit(Opcode::Jmp, Address::data(1), Address::VOID, Address::VOID, Position::NONE);

        let loop_start = self.pc();
        self.set_continue_pc(loop_start);

        self.emit(Opcode::Inc, counter, Address::VOID, Address::VOID, Position::NONE);
        self.emit(Opcode::Lst, is_less, counter, len, Position::NONE);

        let body_start = self.pc();
        let test = self.emit(Opcode::Tjp, is_less, Address::VOID, Address::data(1), Position::NONE);
        self.emit(Opcode::Get, item, items, counter, Position::NONE);

        self.compile_block(body)?;

        let back = self.pc() - loop_start;
        self.emit(Opcode::Jpb, Address::data(back), Address::VOID, Address::VOID, Position::NONE);

        let end = self.pc();
        self.inst_mut(test).b = Address::data(end - body_start - 1);

        self.close_scope();
        self.close_branch(end);
        Ok(())
    }

    // ── Exceptions ──────────────────────────────────────────────────

    fn compile_try(
        &mut self,
        body: &[Spanned<Stmt>],
        catch: Option<&CatchClause>,
        finally: Option<&[Spanned<Stmt>]>,
        pos: Position,
    ) -> Result<()> {
        // A: catch pc, B: error register, C: finally pc
        let try_pc = self.emit(Opcode::Try, Address::VOID, Address::VOID, Address::VOID, pos);

        self.open_scope();
        self.open_branch(BranchKind::Try);

        self.compile_block(body)?;

        // with a finally, FEN ends the try instead
        if finally.is_none() {
            self.emit(Opcode::Tre, Address::VOID, Address::VOID, Address::VOID, Position::NONE);
        }

        // reached only without an exception
        let skip = self.emit(Opcode::Jmp, Address::VOID, Address::VOID, Address::VOID, Position::NONE);
        let catch_start = self.pc();

        if let Some(catch) = catch {
            if let Some(binding) = &catch.binding {
                let r = self.new_register(binding, true);
                self.inst_mut(try_pc).b = r;
                // the error register is in scope from the start
                if let Some(reg) = self.program.functions[self.current].registers.last_mut() {
                    reg.start_pc = 0;
                }
            }

            self.inst_mut(try_pc).a = Address::data(catch_start);
            self.compile_block(&catch.body)?;

            if finally.is_none() {
                self.emit(Opcode::Cen, Address::VOID, Address::VOID, Address::VOID, Position::NONE);
            }
        }

        let len = self.pc() - catch_start;
        self.inst_mut(skip).a = Address::data(len);

        if let Some(stmts) = finally {
            self.set_in_finally(true);
            let finally_pc = self.pc();
            self.inst_mut(try_pc).c = Address::data(finally_pc);
            self.compile_block(stmts)?;
            self.emit(Opcode::Fen, Address::VOID, Address::VOID, Address::VOID, Position::NONE);
            self.set_in_finally(false);
        }

        let end = self.pc();
        self.close_branch(end);
        self.close_scope();
        Ok(())
    }

    // ── Branches ────────────────────────────────────────────────────

    fn open_branch(&mut self, kind: BranchKind) {
        let label = if kind == BranchKind::Try { None } else { self.pending_label.take() };
        self.branches.push(Branch {
            kind,
            label,
            continue_pc: 0,
            breaks: Vec::new(),
            continues: Vec::new(),
            in_finally: false,
        });
    }

    fn set_continue_pc(&mut self, pc: usize) {
        if let Some(b) = self.branches.last_mut() {
            b.continue_pc = pc;
        }
    }

    fn set_in_finally(&mut self, value: bool) {
        if let Some(b) = self.branches.last_mut() {
            b.in_finally = value;
        }
    }

    /// Pops the innermost branch and patches its jumps.
    fn close_branch(&mut self, break_pc: usize) {
        let Some(b) = self.branches.pop() else {
            return;
        };
        for pc in b.breaks {
            self.inst_mut(pc).a = Address::data(break_pc - pc - 1);
        }
        for pc in b.continues {
            self.inst_mut(pc).a = Address::data(pc - b.continue_pc);
        }
    }

    fn check_exit(&self, pos: Position, span: Span) -> Result<()> {
        if self.branches.is_empty() {
            return Err(self.error(pos, span, "Unexpected exit"));
        }
        for b in self.branches.iter().rev() {
            if b.kind != BranchKind::Try {
                return Ok(());
            }
            if b.in_finally {
                return Err(self.error(pos, span, "Control cannot leave the body of a finally clause"));
            }
        }
        Ok(())
    }

    fn find_target(&self, label: Option<&str>, is_continue: bool) -> Option<usize> {
        self.branches.iter().rposition(|b| {
            let kind_ok = match b.kind {
                BranchKind::Loop => true,
                BranchKind::Switch => !is_continue,
                BranchKind::Try => false,
            };
            kind_ok && label.is_none_or(|l| b.label.as_deref() == Some(l))
        })
    }

    /// Every try between here and the target must be left explicitly.
    fn compile_branch_exit(&mut self, target: usize, pos: Position) {
        let tries = self.branches[target + 1..].iter().filter(|b| b.kind == BranchKind::Try).count();
        for _ in 0..tries {
            self.emit(Opcode::Trx, Address::VOID, Address::VOID, Address::VOID, pos);
        }
    }

    fn compile_break(&mut self, label: Option<&str>, pos: Position, span: Span) -> Result<()> {
        self.check_exit(pos, span)?;
        let Some(target) = self.find_target(label, false) else {
            return Err(self.error(pos, span, "Invalid break"));
        };
        self.compile_branch_exit(target, pos);
        let pc = self.emit(Opcode::Jmp, Address::VOID, Address::VOID, Address::VOID, pos);
        self.branches[target].breaks.push(pc);
        Ok(())
    }

    fn compile_continue(&mut self, label: Option<&str>, pos: Position, span: Span) -> Result<()> {
        self.check_exit(pos, span)?;
        let Some(target) = self.find_target(label, true) else {
            return Err(self.error(pos, span, "Invalid continue"));
        };
        self.compile_branch_exit(target, pos);
        let pc = self.emit(Opcode::Jpb, Address::VOID, Address::VOID, Address::VOID, pos);
        self.branches[target].continues.push(pc);
        Ok(())
    }

    /// Compiles `decl` as an anonymous function and stores it in `dest`.
    pub(super) fn compile_lambda(&mut self, decl: &FuncDecl, dest: Address, pos: Position) -> Result<Address> {
        let index = self.program.functions.len();
        let name = self.register_name(&format!("@lambda_{}", index));
        let fi = self.compile_function(decl, name, FunctionKind::User, true, None, pos)?;

        let func = Address::func(fi);
        if self.needs_closure(fi) {
            self.funcs[fi].forwards = true;
            let dest = if dest.is_void() { self.temp_register() } else { dest };
            self.emit(Opcode::Clo, dest, func, Address::VOID, pos);
            return Ok(dest);
        }
        if dest.is_void() {
            return Ok(func);
        }
        self.emit(Opcode::Mov, dest, func, Address::VOID, pos);
        Ok(dest)
    }
}

/// A case body must not fall into the next one.
fn ends_with_exit(stmts: &[Spanned<Stmt>]) -> bool {
    match stmts.last().map(|s| &s.node) {
        None => true,
        Some(Stmt::Block(inner)) => !inner.is_empty() && ends_with_exit(inner),
        Some(s) => s.is_exit(),
    }
}
