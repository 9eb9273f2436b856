//! Calls, returns, closures, upvalues, and deferred blocks.

use super::{CallFrame, Flow, FrameKind, Vm, VmError};
use crate::bridge::ExtensionHandle;
use crate::natives::NativeContext;
use crate::values::{Closure, ClosureKind, Data, UpvalueCell, UpvalueRef, Value};
use lattice_core::{Chunk, Constant, OperandReader};
use std::sync::Arc;

/// Stack heights to restore when a nested run fails.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SavePoint {
    pub(crate) frames: usize,
    stack: usize,
    handlers: usize,
    defers: usize,
}

impl Vm {
    pub(crate) fn save_point(&self) -> SavePoint {
        SavePoint {
            frames: self.frames.len(),
            stack: self.stack.len(),
            handlers: self.handlers.len(),
            defers: self.defers.len(),
        }
    }

    pub(crate) fn restore(&mut self, at: SavePoint) {
        self.close_upvalues(at.stack);
        self.frames.truncate(at.frames);
        self.stack.truncate(at.stack);
        self.handlers.truncate(at.handlers);
        self.defers.truncate(at.defers);
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// `CALL argc`: the callee sits below its arguments. Compiled callees
    /// get a new frame; natives and extensions run to completion here.
    pub(crate) fn call_value(&mut self, argc: usize) -> Result<(), VmError> {
        let callee_slot = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| VmError::Runtime("stack underflow".into()))?;
        let callee = self.stack[callee_slot].clone();
        let Data::Closure(closure) = &callee.data else {
            return Err(VmError::Type(format!(
                "cannot call a value of type {}",
                callee.type_name()
            )));
        };
        match &closure.kind {
            ClosureKind::Compiled { chunk, upvalues } => {
                if argc != chunk.arity() {
                    return Err(VmError::Runtime(format!(
                        "{}() expected {} arguments but got {argc}",
                        closure.display_name(),
                        chunk.arity()
                    )));
                }
                if self.frames.len() >= self.config.max_frames
                    || self.stack.len() >= self.config.max_stack
                {
                    return Err(VmError::StackOverflow);
                }
                self.frames.push(CallFrame {
                    chunk: Arc::clone(chunk),
                    upvalues: Arc::clone(upvalues),
                    ip: 0,
                    base: callee_slot,
                    kind: FrameKind::Call,
                });
            }
            ClosureKind::Native(f) => {
                let f = *f;
                let args = self.stack.split_off(callee_slot + 1);
                self.stack.truncate(callee_slot);
                let result = f(&mut NativeContext::new(self), &args).map_err(VmError::Runtime)?;
                self.push(result);
            }
            ClosureKind::Extension(handle) => {
                let handle = *handle;
                let args = self.stack.split_off(callee_slot + 1);
                self.stack.truncate(callee_slot);
                let result = self.call_extension(handle, &args)?;
                self.push(result);
            }
        }
        Ok(())
    }

    fn call_extension(&self, handle: ExtensionHandle, args: &[Value]) -> Result<Value, VmError> {
        match &self.bridge {
            Some(bridge) => bridge.call(handle, args).map_err(VmError::Runtime),
            None => Err(VmError::Runtime("extension bridge not configured".into())),
        }
    }

    /// Call a closure value from Rust and run it to completion. VM state is
    /// restored if the call fails.
    pub(crate) fn call_closure(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, VmError> {
        let Some(closure) = callee.as_closure() else {
            return Err(VmError::Type(format!(
                "cannot call a value of type {}",
                callee.type_name()
            )));
        };
        match &closure.kind {
            ClosureKind::Native(f) => {
                let f = *f;
                f(&mut NativeContext::new(self), &args).map_err(VmError::Runtime)
            }
            ClosureKind::Extension(handle) => self.call_extension(*handle, &args),
            ClosureKind::Compiled { .. } => {
                let saved = self.save_point();
                let argc = args.len();
                self.push(callee.clone());
                self.stack.extend(args);
                let result = self
                    .call_value(argc)
                    .and_then(|()| self.run_until(saved.frames));
                if result.is_err() {
                    self.restore(saved);
                }
                result
            }
        }
    }

    /// Run a scope or select sub-body on this VM. Slot 0 of the body is a
    /// Unit placeholder; globals carry everything the body reads.
    pub(crate) fn run_sub(&mut self, chunk: Arc<Chunk>) -> Result<Value, VmError> {
        if self.frames.len() >= self.config.max_frames {
            return Err(VmError::StackOverflow);
        }
        let saved = self.save_point();
        self.push(Value::unit());
        self.frames.push(CallFrame {
            chunk,
            upvalues: Arc::from(Vec::new()),
            ip: 0,
            base: saved.stack,
            kind: FrameKind::Sub,
        });
        let result = self.run_until(saved.frames);
        if result.is_err() {
            self.restore(saved);
        }
        result
    }

    /// Pop the current frame, running its defers first. Returns `Done`
    /// once the frame count drops to `limit`.
    pub(crate) fn finish_frame(&mut self, result: Value, limit: usize) -> Result<Flow, VmError> {
        let index = self
            .frames
            .len()
            .checked_sub(1)
            .ok_or_else(|| VmError::Runtime("no active frame".into()))?;
        let frame = &self.frames[index];
        let (base, kind) = (frame.base, frame.kind);

        if let FrameKind::Defer { restore_top } = kind {
            self.close_upvalues(restore_top);
            self.stack.truncate(restore_top);
            self.frames.pop();
            self.handlers.retain(|h| h.frame_index < index);
            return Ok(if self.frames.len() <= limit {
                Flow::Done(Value::unit())
            } else {
                Flow::Continue
            });
        }

        let result = if self.defers.iter().any(|d| d.frame_index == index) {
            self.shadow_roots.push(result);
            let ran = self.run_defers(index, 0);
            let result = self.shadow_roots.pop().unwrap_or_default();
            ran?;
            result
        } else {
            result
        };

        self.close_upvalues(base);
        self.stack.truncate(base);
        self.frames.pop();
        self.handlers.retain(|h| h.frame_index < index);
        self.defers.retain(|d| d.frame_index < index);
        if self.frames.len() <= limit {
            Ok(Flow::Done(result))
        } else {
            self.push(result);
            Ok(Flow::Continue)
        }
    }

    /// Run the defers of frame `frame_index` registered at scope depth
    /// `min_depth` or deeper, newest first. TOS is preserved.
    pub(crate) fn run_defers(&mut self, frame_index: usize, min_depth: u8) -> Result<(), VmError> {
        while let Some(pos) = self
            .defers
            .iter()
            .rposition(|d| d.frame_index == frame_index && d.depth >= min_depth)
        {
            let entry = self.defers.remove(pos);
            let upvalues = Arc::clone(&self.frames[frame_index].upvalues);
            let restore_top = self.stack.len();
            self.frames.push(CallFrame {
                chunk: entry.chunk,
                upvalues,
                ip: entry.ip,
                base: entry.base,
                kind: FrameKind::Defer { restore_top },
            });
            let limit = self.frames.len() - 1;
            self.run_until(limit)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Closures and upvalues
    // ------------------------------------------------------------------

    pub(crate) fn make_closure(
        &mut self,
        chunk: &Chunk,
        r: &mut OperandReader<'_>,
        wide: bool,
    ) -> Result<(), VmError> {
        let idx = if wide { r.wide_index() } else { r.index() };
        let count = r.index();
        let function = chunk
            .constants
            .get(idx)
            .and_then(Constant::as_function)
            .cloned()
            .ok_or_else(|| VmError::Runtime(format!("constant {idx} is not a function")))?;
        let (base, enclosing) = {
            let frame = self.frame()?;
            (frame.base, Arc::clone(&frame.upvalues))
        };
        let mut upvalues = Vec::with_capacity(count);
        for _ in 0..count {
            let is_local = r.u8() == 1;
            let index = r.index();
            if is_local {
                upvalues.push(self.capture_upvalue(base + index));
            } else {
                let uv = enclosing.get(index).cloned().ok_or_else(|| {
                    VmError::Runtime(format!("upvalue index {index} out of range"))
                })?;
                upvalues.push(uv);
            }
        }
        self.alloc_push(Value::closure(Closure::compiled(function, upvalues)));
        Ok(())
    }

    /// Reuse the open upvalue for `slot` or create one.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> UpvalueRef {
        if let Some((_, uv)) = self.open_upvalues.iter().rev().find(|(s, _)| *s == slot) {
            return uv.clone();
        }
        let uv = UpvalueRef::open(slot);
        let at = self.open_upvalues.partition_point(|(s, _)| *s < slot);
        self.open_upvalues.insert(at, (slot, uv.clone()));
        uv
    }

    /// Close every open upvalue at or above `from`.
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        while let Some((slot, _)) = self.open_upvalues.last() {
            if *slot < from {
                break;
            }
            let Some((slot, uv)) = self.open_upvalues.pop() else {
                break;
            };
            let value = self.stack.get(slot).cloned().unwrap_or_default();
            uv.close(value);
        }
    }

    fn frame_upvalue(&self, idx: usize) -> Result<UpvalueRef, VmError> {
        self.frame()?
            .upvalues
            .get(idx)
            .cloned()
            .ok_or_else(|| VmError::Runtime(format!("upvalue index {idx} out of range")))
    }

    pub(crate) fn read_upvalue(&self, idx: usize) -> Result<Value, VmError> {
        let uv = self.frame_upvalue(idx)?;
        let cell = uv.cell().lock();
        Ok(match &*cell {
            UpvalueCell::Open(slot) => self.stack.get(*slot).cloned().unwrap_or_default(),
            UpvalueCell::Closed(v) => v.clone(),
        })
    }

    pub(crate) fn write_upvalue(&mut self, idx: usize, value: Value) -> Result<(), VmError> {
        let uv = self.frame_upvalue(idx)?;
        let mut cell = uv.cell().lock();
        match &mut *cell {
            UpvalueCell::Open(slot) => {
                if let Some(target) = self.stack.get_mut(*slot) {
                    *target = value;
                }
            }
            UpvalueCell::Closed(v) => *v = value,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use lattice_core::ChunkBuilder;

    #[test]
    fn capture_reuses_open_cell_and_keeps_order() {
        let mut vm = Vm::with_config(VmConfig::default());
        let a = vm.capture_upvalue(5);
        vm.capture_upvalue(2);
        let again = vm.capture_upvalue(5);
        assert!(a.ptr_eq(&again));
        let slots: Vec<usize> = vm.open_upvalues.iter().map(|(s, _)| *s).collect();
        assert_eq!(slots, [2, 5]);
    }

    #[test]
    fn closing_moves_stack_value_into_cell() {
        let mut vm = Vm::with_config(VmConfig::default());
        vm.stack = vec![Value::int(0), Value::int(1), Value::int(42)];
        let uv = vm.capture_upvalue(2);
        let low = vm.capture_upvalue(0);
        vm.close_upvalues(1);
        assert_eq!(uv.open_slot(), None);
        assert_eq!(low.open_slot(), Some(0));
        match &*uv.cell().lock() {
            UpvalueCell::Closed(v) => assert_eq!(*v, Value::int(42)),
            UpvalueCell::Open(_) => panic!("expected closed cell"),
        };
    }

    #[test]
    fn failed_nested_call_restores_state() {
        let mut vm = Vm::with_config(VmConfig::default());
        let mut b = ChunkBuilder::function("boom", &[]);
        b.string("bad");
        b.op(lattice_core::OpCode::Throw);
        let f = Value::closure(Closure::compiled(Arc::new(b.build().unwrap()), Vec::new()));
        vm.stack.push(Value::int(9));
        let err = vm.call_closure(&f, Vec::new()).unwrap_err();
        assert_eq!(err.to_string(), "bad");
        assert_eq!(vm.stack.len(), 1);
        assert!(vm.frames.is_empty());
    }
}
