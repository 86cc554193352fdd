//! Try/catch/finally bookkeeping.

use super::{Flow, Vm};
use crate::program::Address;
use crate::value::{Exception, Value, VmError, VmResult};

/// One open try statement.
#[derive(Debug)]
pub(super) struct TryContext {
    fp: usize,
    catch_pc: Option<usize>,
    error_reg: Address,
    finally_pc: Option<usize>,
    /// Where to continue once the finally block ends, when a `return` or a
    /// loop exit entered it.
    resume_pc: Option<usize>,
    /// Raised again at the end of the finally block.
    pending: Option<Exception>,
    catch_executed: bool,
    finally_executed: bool,
}

impl TryContext {
    pub(super) fn new(fp: usize, catch: Address, error_reg: Address, finally: Address) -> Self {
        let pc = |a: Address| (!a.is_void()).then(|| a.index());
        TryContext {
            fp,
            catch_pc: pc(catch),
            error_reg,
            finally_pc: pc(finally),
            resume_pc: None,
            pending: None,
            catch_executed: false,
            finally_executed: false,
        }
    }
}

impl Vm<'_> {
    /// Routes `err` to the innermost try context able to take it. Returns
    /// the error back when nothing does.
    pub(super) fn handle(&mut self, err: Exception) -> VmResult<()> {
        let Some(ctx) = self.try_stack.last() else {
            return Err(err);
        };

        // errors raised inside the finally block leave this try statement
        let in_finally = match (ctx.finally_pc, self.frames.get(ctx.fp)) {
            (Some(f), Some(frame)) => frame.pc >= f,
            _ => false,
        };
        let spent = ctx.catch_executed && (ctx.finally_pc.is_none() || ctx.finally_executed);
        if in_finally || spent {
            self.try_stack.pop();
            return self.handle(err);
        }

        let Some(ctx) = self.try_stack.last_mut() else {
            return Err(err);
        };
        let fp = ctx.fp;
        let error_reg = ctx.error_reg;

        let (target, catching) = match (ctx.catch_executed, ctx.catch_pc, ctx.finally_pc) {
            // thrown again from the catch block
            (true, _, Some(f)) => (f, false),
            (false, Some(pc), _) => (pc, true),
            (false, None, Some(f)) => (f, false),
            _ => {
                self.try_stack.pop();
                return Err(VmError::TryWithoutHandler.into());
            }
        };
        ctx.catch_executed = true;
        if !catching {
            ctx.finally_executed = true;
            ctx.pending = Some(err.clone());
        }

        self.unwind_frames(fp + 1)?;
        let frame = self.frame_mut();
        frame.pc = target;
        frame.ret_value = None;
        tracing::debug!(error = %err.message, pc = target, "exception handled");

        if catching && !error_reg.is_void() {
            self.set(error_reg, Value::from(err))?;
        }
        Ok(())
    }

    /// Called by `ret`. Walks the open try statements of the current frame
    /// and jumps into the first finally block that still has to run. A
    /// return from inside a finally block drops the staged return value.
    pub(super) fn return_from_finally(&mut self) -> bool {
        let fp = self.frames.len() - 1;
        let pc = self.frame().pc;
        while let Some(ctx) = self.try_stack.last_mut() {
            if ctx.fp != fp {
                break;
            }
            match ctx.finally_pc {
                Some(f) if pc < f && !ctx.finally_executed => {
                    ctx.finally_executed = true;
                    ctx.resume_pc = Some(pc);
                    self.frame_mut().pc = f;
                    return true;
                }
                Some(_) => {
                    self.try_stack.pop();
                    self.frame_mut().ret_value = None;
                }
                None => {
                    self.try_stack.pop();
                }
            }
        }
        false
    }

    /// `fen`: rethrows a pending error, resumes an interrupted return or
    /// loop exit, or falls through.
    pub(super) fn end_finally(&mut self) -> VmResult<Flow> {
        let Some(ctx) = self.try_stack.pop() else {
            return Ok(Flow::Next);
        };
        if let Some(err) = ctx.pending {
            return Err(err);
        }
        if let Some(pc) = ctx.resume_pc {
            self.frame_mut().pc = pc;
            return Ok(Flow::Jump);
        }
        Ok(Flow::Next)
    }

    /// `trx`: leaves the innermost try statement on `break`/`continue`,
    /// running its finally block first.
    pub(super) fn exit_try(&mut self) -> VmResult<Flow> {
        let next = self.frame().pc + 1;
        let Some(ctx) = self.try_stack.last_mut() else {
            return Ok(Flow::Next);
        };
        match ctx.finally_pc {
            Some(f) if !ctx.finally_executed => {
                ctx.finally_executed = true;
                ctx.resume_pc = Some(next);
                self.frame_mut().pc = f;
                Ok(Flow::Jump)
            }
            _ => {
                self.try_stack.pop();
                Ok(Flow::Next)
            }
        }
    }
}
