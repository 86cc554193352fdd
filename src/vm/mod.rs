//! Register VM executing a compiled `Program`.
//!
//! Frame 0 holds the globals and lives as long as the VM. `initialize` runs
//! the global function in it once; every later call pushes frames on top.
//! Errors travel as `Exception`s and are routed to the innermost open
//! try context by `unwind::handle`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::config::VmConfig;
use crate::native::NativeRegistry;
use crate::program::{Address, AddressKind, Constant, Function, Instruction, Opcode, Program, TraceLine};
use crate::value::exception::as_exception;
use crate::value::object::{BoundHostMethod, Closure, Method, NativePrototype};
use crate::value::{Callee, ClosureCell, Exception, Finalizable, Instance, Value, VmError, VmResult};

mod ops;
mod unwind;

use unwind::TryContext;

/// What the dispatch loop does after an instruction.
enum Flow {
    Next,
    /// The instruction already moved the pc (or pushed a frame).
    Jump,
    Exit,
}

struct Frame {
    func: usize,
    pc: usize,
    values: Rc<RefCell<Vec<Value>>>,
    closures: Rc<[ClosureCell]>,
    ret_address: Address,
    finalizables: Vec<Rc<dyn Finalizable>>,
    /// Return value staged while a finally block runs.
    ret_value: Option<Value>,
    /// Set on frames pushed by `run_func`; returning from them leaves the loop.
    exit: bool,
}

impl Frame {
    fn new(func: usize, values: Rc<RefCell<Vec<Value>>>, closures: Rc<[ClosureCell]>, exit: bool) -> Self {
        Frame {
            func,
            pc: 0,
            values,
            closures,
            ret_address: Address::VOID,
            finalizables: Vec::new(),
            ret_value: None,
            exit,
        }
    }
}

fn no_cells() -> Rc<[ClosureCell]> {
    Rc::from(Vec::new())
}

/// Errors no try block can intercept.
fn is_terminal(e: &Exception) -> bool {
    matches!(
        e.kind,
        VmError::StepLimit(_) | VmError::AllocationLimit(_) | VmError::FrameLimit(_) | VmError::Panic(_)
    )
}

pub struct Vm<'a> {
    program: &'a Program,
    natives: &'a NativeRegistry,
    config: VmConfig,
    frames: Vec<Frame>,
    try_stack: Vec<TryContext>,
    ret_value: Value,
    steps: usize,
    allocations: usize,
    initialized: bool,
}

impl<'a> Vm<'a> {
    pub fn new(program: &'a Program, natives: &'a NativeRegistry) -> Self {
        Vm::with_globals(program, natives, Vec::new())
    }

    /// Seeds frame 0 with globals taken from another, already initialized VM
    /// over the same program. The global function is not run again.
    pub fn with_globals(program: &'a Program, natives: &'a NativeRegistry, globals: Vec<Value>) -> Self {
        let initialized = !globals.is_empty();
        let mut globals = globals;
        if let Some(g) = program.functions.first()
            && globals.len() < g.max_reg_index
        {
            globals.resize(g.max_reg_index, Value::Null);
        }
        let allocations = program.constants.iter().map(|k| k.to_value().size()).sum();
        Vm {
            program,
            natives,
            config: VmConfig::default(),
            frames: vec![Frame::new(0, Rc::new(RefCell::new(globals)), no_cells(), true)],
            try_stack: Vec::new(),
            ret_value: Value::Null,
            steps: 0,
            allocations,
            initialized,
        }
    }

    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn program(&self) -> &'a Program {
        self.program
    }

    pub fn natives(&self) -> &'a NativeRegistry {
        self.natives
    }

    // ── Entry points ────────────────────────────────────────────────

    /// Runs the global function once.
    pub fn initialize(&mut self) -> VmResult<()> {
        if self.initialized || self.program.functions.is_empty() {
            self.initialized = true;
            return Ok(());
        }
        tracing::debug!(globals = self.frames[0].values.borrow().len(), "initializing");
        let result = self.execute();
        self.initialized = true;
        result.map(|_| ())
    }

    /// Initializes if needed, then calls `main` with `args`. Without a
    /// `main` the value returned by the global function is the result.
    pub fn run(&mut self, args: &[Value]) -> VmResult<Value> {
        let mut result = self.initialize().map(|_| self.ret_value.clone());
        if result.is_ok()
            && let Some(main) = self.program.function_index("main")
        {
            result = self.run_func_index(main, args);
        }

        let globals = mem::take(&mut self.frames[0].finalizables);
        let finalized = self.finalize(&globals);
        match (result, finalized) {
            (Ok(_), Err(e)) => Err(e),
            (result, _) => result,
        }
    }

    pub fn run_func(&mut self, name: &str, args: &[Value]) -> VmResult<Value> {
        let Some(index) = self.program.function_index(name) else {
            return Err(VmError::FunctionNotFound(name.to_string()).into());
        };
        self.run_func_index(index, args)
    }

    pub fn run_func_index(&mut self, index: usize, args: &[Value]) -> VmResult<Value> {
        self.run_function(index, args.to_vec(), None, no_cells())
    }

    /// Calls a callable value obtained from a previous run: a function
    /// reference, a closure, a bound method or a native.
    pub fn run_closure(&mut self, callee: &Value, args: &[Value]) -> VmResult<Value> {
        match callee {
            Value::Func(i) => self.run_function(*i, args.to_vec(), None, no_cells()),
            Value::NativeFunc(i) => self.call_native_sync(*i, Value::Null, args),
            Value::Object(o) => match o.callee() {
                Some(Callee::Closure { func, cells }) => self.run_function(func, args.to_vec(), None, cells),
                Some(Callee::Method { func, this }) => self.run_function(func, args.to_vec(), Some(this), no_cells()),
                Some(Callee::Native { index, this }) => self.call_native_sync(index, this, args),
                Some(Callee::Host(m)) => m(self, args),
                None => Err(VmError::NotCallable(o.to_text()).into()),
            },
            other => Err(VmError::NotCallable(other.to_string()).into()),
        }
    }

    fn run_function(
        &mut self,
        func: usize,
        args: Vec<Value>,
        this: Option<Value>,
        cells: Rc<[ClosureCell]>,
    ) -> VmResult<Value> {
        let program = self.program;
        let Some(f) = program.functions.get(func) else {
            return Err(VmError::FunctionNotFound(format!("#{}", func)).into());
        };
        if !f.variadic && args.len() > f.arguments {
            return Err(VmError::Arity { name: f.name.clone(), expected: f.arguments, got: args.len() }.into());
        }
        self.check_frames()?;

        let values = self.bind_args(f, args, this)?;
        let depth = self.frames.len();
        let tries = mem::take(&mut self.try_stack);
        self.frames.push(Frame::new(func, values, cells, true));

        let result = self.execute();
        let unwound = self.unwind_frames(depth);
        self.try_stack = tries;
        match (result, unwound) {
            (Ok(_), Err(e)) => Err(e),
            (result, _) => result,
        }
    }

    /// Runs the loop until the current exit frame returns. Host panics
    /// become terminal exceptions.
    fn execute(&mut self) -> VmResult<Value> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_loop())) {
            Ok(result) => result,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let mut e: Exception = VmError::Panic(msg).into();
                e.stacktrace = self.trace();
                let backtrace = std::backtrace::Backtrace::capture();
                if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
                    e.message.push_str(&format!("\n\n{}", backtrace));
                }
                tracing::warn!(error = %e.message, "panic in vm");
                Err(e)
            }
        }
    }

    fn run_loop(&mut self) -> VmResult<Value> {
        loop {
            self.steps += 1;
            let max = self.config.max_steps;
            if max > 0 && self.steps > max {
                tracing::warn!(steps = self.steps, "step limit reached");
                return Err(self.traced(VmError::StepLimit(max).into()));
            }

            let flow = match self.fetch() {
                Ok(instr) => self.exec(instr),
                Err(e) => Err(e),
            };

            match flow {
                Ok(Flow::Next) => self.frame_mut().pc += 1,
                Ok(Flow::Jump) => {}
                Ok(Flow::Exit) => return Ok(self.ret_value.clone()),
                Err(e) => {
                    let e = self.traced(e);
                    if is_terminal(&e) {
                        return Err(e);
                    }
                    self.handle(e)?;
                }
            }
        }
    }

    fn fetch(&self) -> VmResult<Instruction> {
        let frame = self.frame();
        self.program
            .functions
            .get(frame.func)
            .and_then(|f| f.instructions.get(frame.pc))
            .copied()
            .ok_or_else(|| VmError::InvalidAddress(format!("pc {} of function {}", frame.pc, frame.func)).into())
    }

    // ── Dispatch ────────────────────────────────────────────────────

    fn exec(&mut self, instr: Instruction) -> VmResult<Flow> {
        let Instruction { op, a, b, c } = instr;
        match op {
            Opcode::Ldk | Opcode::Mov => {
                let v = self.get(b)?;
                self.set(a, v)?;
            }
            Opcode::Mob => {
                let v = self.get(b)?;
                let truthy = v.is_truthy();
                self.set(a, v)?;
                self.set(c, Value::Bool(truthy))?;
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Bor
            | Opcode::And
            | Opcode::Xor
            | Opcode::Lsh
            | Opcode::Rsh => {
                let v = ops::binary(op, &self.get(b)?, &self.get(c)?)?;
                self.set(a, v)?;
            }
            Opcode::Inc | Opcode::Dec => {
                let v = ops::unary(op, &self.get(a)?)?;
                self.set(a, v)?;
            }
            Opcode::Unm | Opcode::Not | Opcode::Bnt => {
                let v = ops::unary(op, &self.get(b)?)?;
                self.set(a, v)?;
            }
            Opcode::Eql | Opcode::Neq | Opcode::Seq | Opcode::Sne => {
                let (l, r) = (self.get(b)?, self.get(c)?);
                let v = match op {
                    Opcode::Eql => l.equals(&r),
                    Opcode::Neq => !l.equals(&r),
                    Opcode::Seq => l.strict_equals(&r),
                    _ => !l.strict_equals(&r),
                };
                self.set(a, Value::Bool(v))?;
            }
            Opcode::Lst | Opcode::Lse => {
                let v = ops::less(op, &self.get(b)?, &self.get(c)?)?;
                self.set(a, Value::Bool(v))?;
            }
            Opcode::New | Opcode::Nes => return self.new_instance(op, a, b, c),
            Opcode::Arr => self.set(a, Value::array(vec![Value::Null; b.index()]))?,
            Opcode::Map => self.set(a, Value::map(BTreeMap::new()))?,
            Opcode::Key => {
                let v = ops::keys(&self.get(b)?)?;
                self.set(a, Value::array(v))?;
            }
            Opcode::Val => {
                let v = ops::values(&self.get(b)?)?;
                self.set(a, Value::array(v))?;
            }
            Opcode::Len => {
                let n = ops::len(&self.get(b)?)?;
                self.set(a, Value::Int(n as i64))?;
            }
            Opcode::Get => {
                let v = self.get_from_object(b, c)?;
                self.set(a, v)?;
            }
            Opcode::Set => self.set_to_object(a, b, c)?,
            Opcode::Spa => self.spread(a)?,
            Opcode::Jmp => {
                self.frame_mut().pc += a.index() + 1;
                return Ok(Flow::Jump);
            }
            Opcode::Jpb => {
                let frame = self.frame_mut();
                frame.pc = frame
                    .pc
                    .checked_sub(a.index())
                    .ok_or_else(|| VmError::InvalidAddress(format!("jump {}", a)))?;
                return Ok(Flow::Jump);
            }
            Opcode::Ejp | Opcode::Djp => {
                let equal = self.get(a)?.equals(&self.get(b)?);
                if equal == (op == Opcode::Ejp) {
                    self.frame_mut().pc += c.index();
                }
            }
            Opcode::Tjp => {
                let truthy = self.get(a)?.is_truthy();
                // C = 1 inverts the test
                let jump = if c.value == 1 { !truthy } else { truthy };
                if jump {
                    self.frame_mut().pc += b.index();
                }
            }
            Opcode::Cal | Opcode::Cas => return self.call(op, a, b, c),
            Opcode::Rnp => {
                if b.kind != AddressKind::NativeFunc {
                    return Err(VmError::InvalidAddress(b.to_string()).into());
                }
                return self.call_native(b.index(), a, Value::Null, Vec::new());
            }
            Opcode::Ret => return self.ret(a),
            Opcode::Clo => self.new_closure(a, b)?,
            Opcode::Trw => {
                let v = self.get(a)?;
                let e = match as_exception(&v) {
                    Some(e) => e.clone(),
                    None => Exception::new(v.to_text()),
                };
                return Err(e);
            }
            Opcode::Try => {
                let fp = self.frames.len() - 1;
                self.try_stack.push(TryContext::new(fp, a, b, c));
            }
            Opcode::Tre | Opcode::Cen => {
                self.try_stack.pop();
            }
            Opcode::Fen => return self.end_finally(),
            Opcode::Trx => return self.exit_try(),
        }
        Ok(Flow::Next)
    }

    // ── Registers ───────────────────────────────────────────────────

    fn frame(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn get(&self, a: Address) -> VmResult<Value> {
        let i = a.index();
        let v = match a.kind {
            AddressKind::Void => Some(Value::Null),
            AddressKind::Local => self.frame().values.borrow().get(i).cloned(),
            AddressKind::Global => self.frames[0].values.borrow().get(i).cloned(),
            AddressKind::Constant => self.program.constants.get(i).map(Constant::to_value),
            AddressKind::Closure => self.frame().closures.get(i).map(ClosureCell::get),
            AddressKind::Func if i < self.program.functions.len() => Some(Value::Func(i)),
            AddressKind::NativeFunc if i < self.natives.len() => Some(Value::NativeFunc(i)),
            AddressKind::Data => Some(Value::Int(i as i64)),
            _ => None,
        };
        v.ok_or_else(|| VmError::InvalidAddress(a.to_string()).into())
    }

    fn set(&mut self, a: Address, v: Value) -> VmResult<()> {
        self.add_allocations(v.size())?;
        let i = a.index();
        let stored = match a.kind {
            AddressKind::Void => true,
            AddressKind::Local => store(&self.frame().values, i, v),
            AddressKind::Global => store(&self.frames[0].values, i, v),
            AddressKind::Closure => match self.frame().closures.get(i) {
                Some(cell) => {
                    cell.set(v);
                    true
                }
                None => false,
            },
            _ => false,
        };
        if !stored {
            return Err(VmError::InvalidAddress(a.to_string()).into());
        }
        Ok(())
    }

    // ── Objects ─────────────────────────────────────────────────────

    fn get_from_object(&mut self, b: Address, c: Address) -> VmResult<Value> {
        let target = self.get(b)?;
        let key = self.get(c)?;
        match (&target, &key) {
            (Value::Null, _) => Err(VmError::NullReference("null").into()),
            (Value::Undefined, _) => Err(VmError::NullReference("undefined").into()),
            (_, Value::Int(i)) => self.get_index(&target, *i),
            (_, Value::String(name)) => self.get_property(&target, name),
            _ => Err(VmError::InvalidIndex(key.type_name().to_string()).into()),
        }
    }

    fn get_index(&mut self, target: &Value, i: i64) -> VmResult<Value> {
        let index = usize::try_from(i).ok();
        let out_of_range = || Exception::from(VmError::IndexOutOfRange);
        match target {
            Value::Array(a) => index.and_then(|i| a.borrow().get(i).cloned()).ok_or_else(out_of_range),
            Value::String(s) => index
                .and_then(|i| s.as_bytes().get(i))
                .map(|b| Value::Rune(*b as char))
                .ok_or_else(out_of_range),
            Value::Bytes(b) => index
                .and_then(|i| b.borrow().get(i).copied())
                .map(|b| Value::Int(b as i64))
                .ok_or_else(out_of_range),
            Value::Map(m) => Ok(m.borrow().get(&i.to_string()).cloned().unwrap_or(Value::Undefined)),
            Value::Object(o) => match o.get_index(i)? {
                Some(v) => Ok(v),
                None => Err(VmError::NotIndexable(o.type_name().to_string()).into()),
            },
            other => Err(VmError::NotIndexable(other.type_name().to_string()).into()),
        }
    }

    fn get_property(&mut self, target: &Value, name: &str) -> VmResult<Value> {
        match target {
            Value::Map(m) => Ok(m.borrow().get(name).cloned().unwrap_or(Value::Undefined)),
            Value::Object(o) => {
                if let Some(m) = o.get_method(name) {
                    return Ok(Value::object(BoundHostMethod(m)));
                }
                if let Some(v) = o.clone().get_property(name, self)?
                    && !matches!(v, Value::Undefined)
                {
                    return Ok(v);
                }
                if o.values().is_some() {
                    return Ok(self.prototype(&["Array"], name, target).unwrap_or(Value::Undefined));
                }
                Ok(Value::Undefined)
            }
            Value::Array(a) if name == "length" => Ok(Value::Int(a.borrow().len() as i64)),
            Value::Array(_) => Ok(self.prototype(&["Array"], name, target).unwrap_or(Value::Undefined)),
            Value::String(s) => match name {
                "length" => Ok(Value::Int(s.len() as i64)),
                "runeCount" => Ok(Value::Int(s.chars().count() as i64)),
                _ => Ok(self.prototype(&["String"], name, target).unwrap_or(Value::Undefined)),
            },
            Value::Bytes(b) if name == "length" => Ok(Value::Int(b.borrow().len() as i64)),
            Value::Bytes(_) => Ok(self.prototype(&["Bytes", "Array"], name, target).unwrap_or(Value::Undefined)),
            other => Err(VmError::Message(format!("Can't read {} of {}", name, other.type_name())).into()),
        }
    }

    /// `<Type>.prototype.<name>` bound to `this`: natives first, then
    /// program functions.
    fn prototype(&self, types: &[&str], name: &str, this: &Value) -> Option<Value> {
        types.iter().find_map(|t| {
            let full = format!("{}.prototype.{}", t, name);
            if let Some(nf) = self.natives.lookup(&full) {
                return Some(Value::object(NativePrototype { index: nf.index, this: this.clone() }));
            }
            let func = self.program.function_index(&full)?;
            Some(Value::object(Method { func, this: this.clone() }))
        })
    }

    fn set_to_object(&mut self, a: Address, b: Address, c: Address) -> VmResult<()> {
        let target = self.get(a)?;
        let key = self.get(b)?;
        let v = self.get(c)?;
        self.add_allocations(v.size())?;

        match (&target, &key) {
            (Value::Array(items), Value::Int(i)) => {
                let mut items = items.borrow_mut();
                match usize::try_from(*i).ok().and_then(|i| items.get_mut(i)) {
                    Some(slot) => *slot = v,
                    None => return Err(VmError::IndexOutOfRange.into()),
                }
            }
            (Value::Bytes(bytes), Value::Int(i)) => {
                let Value::Int(byte) = v else {
                    return Err(VmError::Message(format!("Can't convert {} to byte", v.type_name())).into());
                };
                let mut bytes = bytes.borrow_mut();
                match usize::try_from(*i).ok().and_then(|i| bytes.get_mut(i)) {
                    Some(slot) => *slot = byte as u8,
                    None => return Err(VmError::IndexOutOfRange.into()),
                }
            }
            (Value::Map(m), Value::Int(i)) => {
                m.borrow_mut().insert(i.to_string(), v);
            }
            (Value::Object(o), Value::Int(i)) => {
                if !o.set_index(*i, v)? {
                    return Err(VmError::NotIndexable(o.type_name().to_string()).into());
                }
            }
            (Value::Map(m), Value::String(name)) => {
                m.borrow_mut().insert(name.to_string(), v);
            }
            (Value::Object(o), Value::String(name)) => {
                if !o.set_property(name, v, self)? {
                    return Err(VmError::ReadonlyProperty(name.to_string()).into());
                }
            }
            (Value::Null, Value::String(name)) => {
                let map = BTreeMap::from([(name.to_string(), v)]);
                self.set(a, Value::map(map))?;
            }
            (_, Value::Int(_)) => return Err(VmError::NotIndexable(target.type_name().to_string()).into()),
            (_, Value::String(name)) => return Err(VmError::ReadonlyProperty(name.to_string()).into()),
            _ => return Err(VmError::InvalidIndex(key.type_name().to_string()).into()),
        }
        Ok(())
    }

    /// Flattens the last element of the argument array at `a`.
    fn spread(&mut self, a: Address) -> VmResult<()> {
        let Value::Array(items) = self.get(a)? else {
            return Err(VmError::InvalidOperand { op: "spread", operand: self.get(a)?.type_name().to_string() }.into());
        };
        let mut items = items.borrow_mut();
        if let Some(Value::Array(last)) = items.last().cloned() {
            items.pop();
            items.extend(last.borrow().iter().cloned());
        }
        Ok(())
    }

    fn new_instance(&mut self, op: Opcode, a: Address, b: Address, c: Address) -> VmResult<Flow> {
        let class = self.get(a)?;
        let Some(name) = class.as_str() else {
            return Err(VmError::ClassNotFound(class.type_name().to_string()).into());
        };
        if self.program.class(name).is_none() {
            return Err(VmError::ClassNotFound(name.to_string()).into());
        }

        let instance = Value::object(Instance::new(name));
        self.set(b, instance.clone())?;

        let Some(ctor) = self.program.function_index(&format!("{}.prototype.constructor", name)) else {
            return Ok(Flow::Next);
        };
        let args = self.call_args(op == Opcode::Nes, c)?;
        self.call_program(ctor, Address::VOID, args, Some(instance), no_cells())
    }

    fn new_closure(&mut self, a: Address, b: Address) -> VmResult<()> {
        let program = self.program;
        let frame = self.frame();
        let Some(owner) = program.functions.get(frame.func) else {
            return Err(VmError::FunctionNotFound(format!("#{}", frame.func)).into());
        };
        // inherited cells first, then this frame's captured registers
        let cells: Vec<ClosureCell> = frame
            .closures
            .iter()
            .cloned()
            .chain(owner.closures.iter().map(|r| ClosureCell { values: frame.values.clone(), index: r.index }))
            .collect();
        let closure = Closure { func: b.index(), cells: Rc::from(cells) };
        self.set(a, Value::object(closure))
    }

    // ── Calls ───────────────────────────────────────────────────────

    fn call_args(&self, single: bool, c: Address) -> VmResult<Vec<Value>> {
        if single {
            return Ok(vec![self.get(c)?]);
        }
        if c.is_void() {
            return Ok(Vec::new());
        }
        match self.get(c)? {
            Value::Array(items) => Ok(items.borrow().clone()),
            other => Ok(vec![other]),
        }
    }

    fn call(&mut self, op: Opcode, a: Address, ret: Address, c: Address) -> VmResult<Flow> {
        let args = self.call_args(op == Opcode::Cas, c)?;
        match a.kind {
            AddressKind::Func => self.call_program(a.index(), ret, args, None, no_cells()),
            AddressKind::NativeFunc => self.call_native(a.index(), ret, Value::Null, args),
            _ => {
                let callee = self.get(a)?;
                self.call_value(callee, ret, args)
            }
        }
    }

    fn call_value(&mut self, callee: Value, ret: Address, args: Vec<Value>) -> VmResult<Flow> {
        match callee {
            Value::Func(i) => self.call_program(i, ret, args, None, no_cells()),
            Value::NativeFunc(i) => self.call_native(i, ret, Value::Null, args),
            Value::Object(o) => match o.callee() {
                Some(Callee::Closure { func, cells }) => self.call_program(func, ret, args, None, cells),
                Some(Callee::Method { func, this }) => self.call_program(func, ret, args, Some(this), no_cells()),
                Some(Callee::Native { index, this }) => self.call_native(index, ret, this, args),
                Some(Callee::Host(m)) => self.call_host(ret, |vm| m(vm, &args)),
                None => Err(VmError::NotCallable(o.to_text()).into()),
            },
            other => Err(VmError::NotCallable(other.to_string()).into()),
        }
    }

    /// Pushes a frame for a program function. The caller resumes after the
    /// call instruction once the callee returns.
    fn call_program(
        &mut self,
        func: usize,
        ret: Address,
        args: Vec<Value>,
        this: Option<Value>,
        cells: Rc<[ClosureCell]>,
    ) -> VmResult<Flow> {
        let program = self.program;
        let Some(f) = program.functions.get(func) else {
            return Err(VmError::FunctionNotFound(format!("#{}", func)).into());
        };
        self.check_frames()?;
        let values = self.bind_args(f, args, this)?;

        let caller = self.frame_mut();
        caller.ret_address = ret;
        caller.pc += 1;
        self.frames.push(Frame::new(func, values, cells, false));
        tracing::trace!(function = %f.name, depth = self.frames.len(), "call");
        Ok(Flow::Jump)
    }

    fn call_native(&mut self, index: usize, ret: Address, this: Value, args: Vec<Value>) -> VmResult<Flow> {
        let natives = self.natives;
        let Some(native) = natives.get(index) else {
            return Err(VmError::FunctionNotFound(format!("native #{}", index)).into());
        };
        if native.arguments >= 0 && native.arguments as usize != args.len() {
            return Err(VmError::Arity {
                name: native.name.clone(),
                expected: native.arguments as usize,
                got: args.len(),
            }
            .into());
        }
        self.call_host(ret, |vm| (native.function)(vm, this, &args))
    }

    /// The pc moves past the call while host code runs so that stack traces
    /// taken from nested runs point at the call site.
    fn call_host(&mut self, ret: Address, f: impl FnOnce(&mut Self) -> VmResult<Value>) -> VmResult<Flow> {
        self.frame_mut().pc += 1;
        match f(self) {
            Ok(v) => {
                self.set(ret, v)?;
                Ok(Flow::Jump)
            }
            Err(e) => {
                self.frame_mut().pc -= 1;
                Err(e)
            }
        }
    }

    fn call_native_sync(&mut self, index: usize, this: Value, args: &[Value]) -> VmResult<Value> {
        let natives = self.natives;
        match natives.get(index) {
            Some(native) => (native.function)(self, this, args),
            None => Err(VmError::FunctionNotFound(format!("native #{}", index)).into()),
        }
    }

    fn check_frames(&self) -> VmResult<()> {
        let max = self.config.max_frames;
        if max > 0 && self.frames.len() > max {
            tracing::warn!(frames = self.frames.len(), "frame limit reached");
            return Err(VmError::FrameLimit(max).into());
        }
        Ok(())
    }

    /// Lays out a new frame's registers: positional arguments, the variadic
    /// rest array, then `this`.
    fn bind_args(&mut self, f: &Function, mut args: Vec<Value>, this: Option<Value>) -> VmResult<Rc<RefCell<Vec<Value>>>> {
        let n = f.arguments;
        let size = f.max_reg_index.max(n + usize::from(this.is_some()));
        let mut values = vec![Value::Null; size];

        let weight: usize = args.iter().map(Value::size).sum();
        self.add_allocations(weight)?;

        if f.variadic && n > 0 {
            let rest = args.split_off((n - 1).min(args.len()));
            values[n - 1] = Value::array(rest);
        } else {
            args.truncate(n);
        }
        for (slot, v) in values.iter_mut().zip(args) {
            *slot = v;
        }
        if let Some(this) = this {
            values[n] = this;
        }
        Ok(Rc::new(RefCell::new(values)))
    }

    fn ret(&mut self, a: Address) -> VmResult<Flow> {
        let v = self.get(a)?;
        if self.return_from_finally() {
            let frame = self.frame_mut();
            if frame.ret_value.is_none() {
                frame.ret_value = Some(v);
            }
            return Ok(Flow::Jump);
        }
        let v = self.frame_mut().ret_value.take().unwrap_or(v);
        self.return_value(v)
    }

    fn return_value(&mut self, v: Value) -> VmResult<Flow> {
        if self.frames.len() == 1 {
            self.ret_value = v;
            return Ok(Flow::Exit);
        }
        let Some(frame) = self.frames.pop() else {
            return Ok(Flow::Exit);
        };
        self.finalize(&frame.finalizables)?;
        if frame.exit {
            self.ret_value = v;
            return Ok(Flow::Exit);
        }
        let ret = mem::replace(&mut self.frame_mut().ret_address, Address::VOID);
        self.set(ret, v)?;
        Ok(Flow::Jump)
    }

    // ── Finalizers ──────────────────────────────────────────────────

    /// Registers `f` to be closed when the current frame is discarded.
    pub fn set_finalizer(&mut self, f: Rc<dyn Finalizable>) {
        self.frame_mut().finalizables.push(f);
    }

    /// Registers `f` to be closed at the end of `run`.
    pub fn set_global_finalizer(&mut self, f: Rc<dyn Finalizable>) {
        self.frames[0].finalizables.push(f);
    }

    /// Closes every finalizer; the first failure is reported.
    fn finalize(&self, list: &[Rc<dyn Finalizable>]) -> VmResult<()> {
        let mut first = None;
        for f in list {
            if let Err(e) = f.close() {
                tracing::debug!(error = %e.message, "finalizer failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Pops frames down to `depth`, finalizing each.
    fn unwind_frames(&mut self, depth: usize) -> VmResult<()> {
        let mut first = Ok(());
        while self.frames.len() > depth.max(1) {
            let Some(frame) = self.frames.pop() else {
                break;
            };
            if let Err(e) = self.finalize(&frame.finalizables)
                && first.is_ok()
            {
                first = Err(e);
            }
        }
        first
    }

    // ── Limits ──────────────────────────────────────────────────────

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn reset_steps(&mut self) {
        self.steps = 0;
    }

    /// Charges `n` extra steps, used by natives doing expensive work.
    pub fn add_steps(&mut self, n: usize) -> VmResult<()> {
        self.steps += n;
        let max = self.config.max_steps;
        if max > 0 && self.steps > max {
            return Err(VmError::StepLimit(max).into());
        }
        Ok(())
    }

    pub fn allocations(&self) -> usize {
        self.allocations
    }

    pub fn add_allocations(&mut self, size: usize) -> VmResult<()> {
        self.allocations += size;
        let max = self.config.max_allocations;
        if max > 0 && self.allocations > max {
            tracing::warn!(allocations = self.allocations, "allocation limit reached");
            return Err(VmError::AllocationLimit(max).into());
        }
        Ok(())
    }

    pub fn has_permission(&self, name: &str) -> bool {
        self.config.trusted || self.program.has_permission(name)
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn globals(&self) -> Vec<Value> {
        self.frames[0].values.borrow().clone()
    }

    /// Looks a register up by name in the current frame, then in the globals.
    pub fn register_value(&self, name: &str) -> Option<Value> {
        let lookup = |frame: &Frame| {
            let f = self.program.functions.get(frame.func)?;
            let r = f.registers.iter().rev().find(|r| r.name == name)?;
            frame.values.borrow().get(r.index).cloned()
        };
        if self.frames.len() > 1
            && let Some(v) = lookup(self.frame())
        {
            return Some(v);
        }
        lookup(&self.frames[0])
    }

    /// The language level call stack, innermost first.
    pub fn trace(&self) -> Vec<TraceLine> {
        let top = self.frames.len() - 1;
        self.frames
            .iter()
            .enumerate()
            .rev()
            .filter(|(i, _)| *i > 0 || !self.initialized || top == 0)
            .filter_map(|(i, frame)| {
                let f = self.program.functions.get(frame.func)?;
                // callers have already moved past the call
                let pc = if i == top { frame.pc } else { frame.pc.saturating_sub(1) };
                Some(self.program.to_trace_line(f, pc))
            })
            .collect()
    }

    pub fn stacktrace(&self) -> Vec<String> {
        self.trace().iter().filter(|l| !l.is_empty()).map(|l| l.to_string()).collect()
    }

    fn traced(&self, mut e: Exception) -> Exception {
        if e.stacktrace.is_empty() {
            e.stacktrace = self.trace();
            e.pc = self.frame().pc;
            e.instruction = self.fetch().ok();
        }
        e
    }
}

fn store(values: &RefCell<Vec<Value>>, i: usize, v: Value) -> bool {
    match values.borrow_mut().get_mut(i) {
        Some(slot) => {
            *slot = v;
            true
        }
        None => false,
    }
}
