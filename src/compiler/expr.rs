use super::{Compiler, Result};
use crate::ast::{BinOp, Expr, Literal, Position, Spanned, UnaryOp};
use crate::program::{Address, AddressKind, Constant, Opcode};

impl Compiler<'_> {
    /// Compiles `e`. With a `dest` the result is written there; otherwise the
    /// returned address holds it, which may be a constant or a register of
    /// its own.
    pub(super) fn compile_expr(&mut self, e: &Spanned<Expr>, dest: Address) -> Result<Address> {
        let pos = e.pos;
        match &e.node {
            Expr::Literal(lit) => {
                let k = self.constant(literal_constant(lit));
                self.load(k, dest, pos)
            }
            Expr::Ident(name) => {
                let addr = match self.find_register(name, self.current, pos)? {
                    Some(addr) => addr,
                    None => self.get_unresolved(name, pos, e.span),
                };
                self.move_to(addr, dest, pos)
            }
            Expr::Unary { op, operand } => self.compile_unary(*op, operand, dest, pos),
            Expr::Binary { op: BinOp::And, left, right } => self.compile_and_or(left, right, true, dest),
            Expr::Binary { op: BinOp::Or, left, right } => self.compile_and_or(left, right, false, dest),
            Expr::Binary { op, left, right } => self.compile_binary(*op, left, right, dest),
            Expr::Ternary { cond, then, otherwise } => self.compile_ternary(cond, then, otherwise, dest),
            Expr::Map(entries) => {
                let dest = self.or_temp(dest);
                self.emit(Opcode::Map, dest, Address::data(entries.len()), Address::VOID, pos);
                for (key, value) in entries {
                    let k = self.constant(Constant::string(key));
                    let v = self.compile_expr(value, Address::VOID)?;
                    self.emit(Opcode::Set, dest, k, v, Position::NONE);
                }
                Ok(dest)
            }
            Expr::Array(items) => {
                let dest = self.or_temp(dest);
                self.emit(Opcode::Arr, dest, Address::data(items.len()), Address::VOID, pos);
                for (i, item) in items.iter().enumerate() {
                    let v = self.compile_expr(item, Address::VOID)?;
                    self.emit(Opcode::Set, dest, Address::data(i), v, pos);
                }
                Ok(dest)
            }
            Expr::Index { object, index } => {
                let left = self.compile_expr(object, Address::VOID)?;
                let i = self.compile_expr(index, Address::VOID)?;
                let dest = self.or_temp(dest);
                self.emit(Opcode::Get, dest, left, i, object.pos);
                Ok(dest)
            }
            Expr::Selector { object, name } => self.compile_selector(object, name, dest, pos),
            Expr::Function(decl) => self.compile_lambda(decl, dest, pos),
            Expr::Call { callee, args, spread } => self.compile_call(callee, args, *spread, dest, true, pos),
            Expr::New { class, args, spread } => self.compile_new(class, args, *spread, dest, pos),
        }
    }

    fn or_temp(&mut self, dest: Address) -> Address {
        if dest.is_void() { self.temp_register() } else { dest }
    }

    fn load(&mut self, k: Address, dest: Address, pos: Position) -> Result<Address> {
        if dest.is_void() {
            return Ok(k);
        }
        self.emit(Opcode::Ldk, dest, k, Address::VOID, pos);
        Ok(dest)
    }

    fn move_to(&mut self, addr: Address, dest: Address, pos: Position) -> Result<Address> {
        if dest.is_void() {
            return Ok(addr);
        }
        self.emit(Opcode::Mov, dest, addr, Address::VOID, pos);
        Ok(dest)
    }

    // ── Operators ───────────────────────────────────────────────────

    fn compile_unary(&mut self, op: UnaryOp, operand: &Spanned<Expr>, dest: Address, pos: Position) -> Result<Address> {
        if let Expr::Literal(lit) = &operand.node {
            let folded = match (op, lit) {
                (UnaryOp::Neg, Literal::Int(n)) => Some(Constant::Int(n.wrapping_neg())),
                (UnaryOp::BitNot, Literal::Int(n)) => Some(Constant::Int(!n)),
                (UnaryOp::Neg, Literal::Float(f)) => Some(Constant::Float(-f)),
                (UnaryOp::Not, Literal::Bool(b)) => Some(Constant::Bool(!b)),
                (_, Literal::Int(_) | Literal::Float(_) | Literal::Bool(_)) => {
                    return Err(self.error(pos, operand.span, format!("Invalid unary operator {}", unary_symbol(op))));
                }
                _ => None,
            };
            if let Some(k) = folded {
                let k = self.constant(k);
                return self.load(k, dest, pos);
            }
        }

        let r = self.compile_expr(operand, Address::VOID)?;
        let dest = self.or_temp(dest);
        let opcode = match op {
            UnaryOp::Neg => Opcode::Unm,
            UnaryOp::Not => Opcode::Not,
            UnaryOp::BitNot => Opcode::Bnt,
        };
        self.emit(opcode, dest, r, Address::VOID, pos);
        Ok(dest)
    }

    fn compile_binary(
        &mut self,
        op: BinOp,
        left: &Spanned<Expr>,
        right: &Spanned<Expr>,
        dest: Address,
    ) -> Result<Address> {
        let l = self.compile_expr(left, Address::VOID)?;
        let r = self.compile_expr(right, Address::VOID)?;
        let dest = self.or_temp(dest);

        // comparisons read their operands swapped
        let (opcode, b, c) = match op {
            BinOp::Add => (Opcode::Add, l, r),
            BinOp::Sub => (Opcode::Sub, l, r),
            BinOp::Mul => (Opcode::Mul, l, r),
            BinOp::Div => (Opcode::Div, l, r),
            BinOp::Mod => (Opcode::Mod, l, r),
            BinOp::BitOr => (Opcode::Bor, l, r),
            BinOp::BitAnd => (Opcode::And, l, r),
            BinOp::BitXor => (Opcode::Xor, l, r),
            BinOp::Shl => (Opcode::Lsh, l, r),
            BinOp::Shr => (Opcode::Rsh, l, r),
            BinOp::Less => (Opcode::Lst, l, r),
            BinOp::LessEq => (Opcode::Lse, l, r),
            BinOp::Greater => (Opcode::Lst, r, l),
            BinOp::GreaterEq => (Opcode::Lse, r, l),
            BinOp::Equals => (Opcode::Eql, r, l),
            BinOp::NotEquals => (Opcode::Neq, r, l),
            BinOp::StrictEquals => (Opcode::Seq, r, l),
            BinOp::StrictNotEquals => (Opcode::Sne, r, l),
            BinOp::And | BinOp::Or => {
                return Err(self.error(left.pos, left.span, format!("Unknown operator {}", op.symbol())));
            }
        };
        self.emit(opcode, dest, b, c, left.pos);
        Ok(dest)
    }

    /// Short circuit: the right side is skipped when the left one decides.
    fn compile_and_or(
        &mut self,
        left: &Spanned<Expr>,
        right: &Spanned<Expr>,
        and: bool,
        dest: Address,
    ) -> Result<Address> {
        let l = self.compile_expr(left, Address::VOID)?;
        let dest = self.or_temp(dest);
        let left_set = self.temp_register();

        self.emit(Opcode::Mob, dest, l, left_set, left.pos);

        // && jumps when false, || when true
        let when = Address::data(if and { 1 } else { 0 });
        let jump = self.emit(Opcode::Tjp, left_set, Address::VOID, when, left.pos);
        let start = self.pc();

        let r = self.compile_expr(right, Address::VOID)?;
        self.emit(Opcode::Mov, dest, r, Address::VOID, left.pos);

        let len = self.pc() - start;
        self.inst_mut(jump).b = Address::data(len);
        Ok(dest)
    }

    fn compile_ternary(
        &mut self,
        cond: &Spanned<Expr>,
        then: &Spanned<Expr>,
        otherwise: &Spanned<Expr>,
        dest: Address,
    ) -> Result<Address> {
        let dest = self.or_temp(dest);
        let c = self.compile_expr(cond, Address::VOID)?;

        let jump = self.emit(Opcode::Tjp, c, Address::VOID, Address::data(1), then.pos);
        let start = self.pc();

        self.compile_expr(then, dest)?;

        let skip = self.emit(Opcode::Jmp, Address::VOID, Address::VOID, Address::VOID, Position::NONE);
        let else_start = self.pc();
        self.inst_mut(jump).b = Address::data(else_start - start);

        self.compile_expr(otherwise, dest)?;

        let len = self.pc() - else_start;
        self.inst_mut(skip).a = Address::data(len);
        Ok(dest)
    }

    // ── Properties and modules ──────────────────────────────────────

    /// `x.name` may be a module member, a native function, a native
    /// property or a plain property read, tried in that order.
    fn compile_selector(&mut self, object: &Spanned<Expr>, name: &str, dest: Address, pos: Position) -> Result<Address> {
        if let Expr::Ident(pkg) = &object.node {
            if let Some(addr) = self.find_module_register(pkg, name, pos)? {
                return self.move_to(addr, dest, pos);
            }

            if let Some(nf) = self.natives.lookup(&format!("{}.{}", pkg, name)) {
                let addr = Address::new(AddressKind::NativeFunc, nf.index);
                return self.move_to(addr, dest, pos);
            }

            if let Some(nf) = self.natives.lookup(&format!("->{}.{}", pkg, name)) {
                let addr = Address::new(AddressKind::NativeFunc, nf.index);
                let dest = self.or_temp(dest);
                self.emit(Opcode::Rnp, dest, addr, Address::VOID, pos);
                return Ok(dest);
            }
        }

        let x = self.compile_expr(object, Address::VOID)?;
        let key = self.constant(Constant::string(name));
        let dest = self.or_temp(dest);
        self.emit(Opcode::Get, dest, x, key, object.pos);
        Ok(dest)
    }

    // ── Calls ───────────────────────────────────────────────────────

    /// `ret_val` is false for calls in statement position, whose result is dropped.
    pub(super) fn compile_call(
        &mut self,
        callee: &Spanned<Expr>,
        args: &[Spanned<Expr>],
        spread: bool,
        dest: Address,
        ret_val: bool,
        pos: Position,
    ) -> Result<Address> {
        let f = self.compile_expr(callee, Address::VOID)?;
        let dest = if ret_val { self.or_temp(dest) } else { dest };

        if let ([arg], false) = (args, spread) {
            let a = self.compile_expr(arg, Address::VOID)?;
            self.emit(Opcode::Cas, f, dest, a, pos);
            return Ok(dest);
        }

        let a = self.compile_call_args(args, spread)?;
        self.emit(Opcode::Cal, f, dest, a, pos);
        Ok(dest)
    }

    /// Packs the arguments in a fresh array. No arguments is `VOID`.
    fn compile_call_args(&mut self, args: &[Spanned<Expr>], spread: bool) -> Result<Address> {
        let Some(first) = args.first() else {
            return Ok(Address::VOID);
        };

        let dest = self.temp_register();
        self.emit(Opcode::Arr, dest, Address::data(args.len()), Address::VOID, first.pos);

        for (i, arg) in args.iter().enumerate() {
            let v = self.compile_expr(arg, Address::VOID)?;
            self.emit(Opcode::Set, dest, Address::data(i), v, arg.pos);
        }

        if spread && let Some(last) = args.last() {
            self.emit(Opcode::Spa, dest, Address::VOID, Address::VOID, last.pos);
        }
        Ok(dest)
    }

    fn compile_new(
        &mut self,
        class: &Spanned<Expr>,
        args: &[Spanned<Expr>],
        spread: bool,
        dest: Address,
        pos: Position,
    ) -> Result<Address> {
        let addr = match &class.node {
            Expr::Ident(name) => {
                let name = self.register_name(name);
                self.constant(Constant::string(&name))
            }
            Expr::Selector { object, name } => {
                let Expr::Ident(alias) = &object.node else {
                    return Err(self.error(class.pos, class.span, "Expected class name"));
                };
                match self.find_module_register(alias, name, class.pos)? {
                    Some(addr) => addr,
                    None => return Err(self.error(class.pos, class.span, "Expected class name")),
                }
            }
            _ => return Err(self.error(class.pos, class.span, "Expected class name")),
        };

        let dest = self.or_temp(dest);

        if let ([arg], false) = (args, spread) {
            let a = self.compile_expr(arg, Address::VOID)?;
            self.emit(Opcode::Nes, addr, dest, a, pos);
            return Ok(dest);
        }

        let a = self.compile_call_args(args, spread)?;
        self.emit(Opcode::New, addr, dest, a, pos);
        Ok(dest)
    }
}

fn literal_constant(lit: &Literal) -> Constant {
    match lit {
        Literal::Int(i) => Constant::Int(*i),
        Literal::Float(f) => Constant::Float(*f),
        Literal::String(s) => Constant::string(s),
        Literal::Rune(c) => Constant::Rune(*c),
        Literal::Bool(b) => Constant::Bool(*b),
        Literal::Null => Constant::Null,
        Literal::Undefined => Constant::Undefined,
    }
}

fn unary_symbol(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "-",
        UnaryOp::Not => "!",
        UnaryOp::BitNot => "~",
    }
}
