//! Structured concurrency: `SCOPE` and `SELECT`.
//!
//! Sub-bodies read the enclosing function's locals through an environment
//! scope that exports every named live local. Spawned bodies run on their
//! own OS thread in a child VM whose globals are a deep copy of that
//! environment; channels are the only state shared across threads.

use super::{Vm, VmError};
use crate::channel::{Channel, SelectWaiter, TryRecvError};
use crate::env::Env;
use crate::values::{Closure, ClosureKind, Data, Home, UpvalueCell, UpvalueRef, Value};
use lattice_core::opcode::{ARM_BINDING, ARM_DEFAULT, ARM_TIMEOUT, NO_INDEX};
use lattice_core::{Chunk, OperandReader};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Deep copy for a child VM. Open upvalues are closed over the value they
/// currently alias, so exported closures never point into the parent stack.
struct Exporter<'a> {
    stack: &'a [Value],
    closures: HashMap<usize, Value>,
    cells: HashMap<usize, UpvalueRef>,
}

impl<'a> Exporter<'a> {
    fn new(stack: &'a [Value]) -> Self {
        Self {
            stack,
            closures: HashMap::new(),
            cells: HashMap::new(),
        }
    }

    fn export(&mut self, v: &Value) -> Value {
        let data = match &v.data {
            Data::Closure(c) => return self.export_closure(v, c),
            Data::Array(items) => Data::Array(self.export_all(items)),
            Data::Tuple(items) => Data::Tuple(self.export_all(items)),
            Data::Map(m) => Data::Map(m.iter().map(|(k, x)| (k.clone(), self.export(x))).collect()),
            Data::Struct(s) => {
                let mut s = s.clone();
                for (_, field) in s.fields.iter_mut() {
                    *field = self.export(field);
                }
                Data::Struct(s)
            }
            _ => return v.deep_clone(),
        };
        Value {
            data,
            phase: v.phase,
            home: match v.home {
                Home::Region(r) => Home::Region(r),
                _ => Home::None,
            },
        }
    }

    fn export_all(&mut self, items: &[Value]) -> Vec<Value> {
        items.iter().map(|x| self.export(x)).collect()
    }

    fn export_closure(&mut self, v: &Value, c: &Arc<Closure>) -> Value {
        let ClosureKind::Compiled { chunk, upvalues } = &c.kind else {
            return v.clone();
        };
        let key = Arc::as_ptr(c) as usize;
        if let Some(done) = self.closures.get(&key) {
            return done.clone();
        }
        let cells = upvalues.iter().map(|u| self.export_cell(u)).collect();
        let out = Value::closure(Closure::compiled(Arc::clone(chunk), cells)).with_phase(v.phase);
        self.closures.insert(key, out.clone());
        out
    }

    fn export_cell(&mut self, cell: &UpvalueRef) -> UpvalueRef {
        if let Some(done) = self.cells.get(&cell.addr()) {
            return done.clone();
        }
        let fresh = UpvalueRef::closed(Value::nil());
        self.cells.insert(cell.addr(), fresh.clone());
        let current = match &*cell.cell().lock() {
            UpvalueCell::Open(slot) => self.stack.get(*slot).cloned().unwrap_or_default(),
            UpvalueCell::Closed(v) => v.clone(),
        };
        fresh.close(self.export(&current));
        fresh
    }
}

fn sub_chunk(chunk: &Chunk, idx: u8) -> Result<Arc<Chunk>, VmError> {
    chunk
        .constants
        .get(idx as usize)
        .and_then(|c| c.as_function())
        .cloned()
        .ok_or_else(|| VmError::Runtime(format!("constant {idx} is not a sub-body")))
}

// ---------------------------------------------------------------------------
// Select arms
// ---------------------------------------------------------------------------

enum ArmSource {
    Channel(Arc<Chunk>),
    Timeout(Arc<Chunk>),
    Default,
}

struct Arm {
    source: ArmSource,
    body: Arc<Chunk>,
    binding: Option<String>,
}

/// An arm whose channel or timeout expression has been evaluated.
enum Ready {
    Channel(Arc<Channel>),
    Timeout(Instant),
    Default,
}

impl Vm {
    /// Define every named live local, innermost frame last, in the current
    /// environment scope.
    fn export_locals(&mut self) {
        let mut exported = Vec::new();
        for (i, frame) in self.frames.iter().enumerate() {
            let limit = self
                .frames
                .get(i + 1)
                .map(|next| next.base)
                .unwrap_or(self.stack.len());
            for (slot, name) in frame.chunk.local_names.iter().enumerate() {
                let idx = frame.base + slot;
                if let Some(name) = name.as_deref().filter(|n| !n.is_empty()) {
                    if idx < limit {
                        exported.push((name.to_string(), self.stack[idx].clone()));
                    }
                }
            }
        }
        for (name, value) in exported {
            self.env.define(&name, value);
        }
    }

    fn spawn_vm(&self) -> Vm {
        let mut exporter = Exporter::new(&self.stack);
        let env: Env = self.env.snapshot_with(|v| exporter.export(v));
        let mut child = Vm::from_parts(Arc::clone(&self.config), Arc::clone(&self.natives), env);
        child.output = self.output.clone();
        child.bridge = self.bridge.clone();
        child.loader = self.loader.clone();
        child
    }

    // ------------------------------------------------------------------
    // SCOPE
    // ------------------------------------------------------------------

    /// `SCOPE n sync spawn*`: run the sync body here, then every spawn body
    /// on its own thread, and join them all. Pushes the sync body's value.
    pub(crate) fn op_scope(&mut self, chunk: &Arc<Chunk>, r: &mut OperandReader<'_>) -> Result<(), VmError> {
        let count = r.index();
        let sync = r.u8();
        let sync = if sync == NO_INDEX {
            None
        } else {
            Some(sub_chunk(chunk, sync)?)
        };
        let spawns = (0..count)
            .map(|_| sub_chunk(chunk, r.u8()))
            .collect::<Result<Vec<_>, _>>()?;

        self.env.push_scope();
        self.export_locals();
        let result = self.run_scope(sync, spawns);
        self.env.pop_scope();
        self.push(result?);
        Ok(())
    }

    fn run_scope(&mut self, sync: Option<Arc<Chunk>>, spawns: Vec<Arc<Chunk>>) -> Result<Value, VmError> {
        let value = match sync {
            Some(body) => self.run_sub(body)?,
            None => Value::unit(),
        };
        if spawns.is_empty() {
            return Ok(value);
        }

        let mut handles = Vec::with_capacity(spawns.len());
        for (i, body) in spawns.into_iter().enumerate() {
            let mut child = self.spawn_vm();
            let handle = thread::Builder::new()
                .name(format!("lattice-spawn-{i}"))
                .spawn(move || child.run_detached(body).map_err(|e| e.message()))
                .map_err(|e| VmError::Concurrency(format!("failed to spawn thread: {e}")))?;
            handles.push(handle);
        }
        tracing::debug!(spawned = handles.len(), "scope joining spawned bodies");

        let mut first_error = None;
        for (i, handle) in handles.into_iter().enumerate() {
            let error = match handle.join() {
                Ok(Ok(_)) => continue,
                Ok(Err(message)) => message,
                Err(_) => "spawned thread panicked".to_string(),
            };
            tracing::debug!(spawn = i, %error, "spawned body failed");
            first_error.get_or_insert(error);
        }
        match first_error {
            Some(message) => Err(VmError::Concurrency(message)),
            None => Ok(value),
        }
    }

    // ------------------------------------------------------------------
    // SELECT
    // ------------------------------------------------------------------

    /// `SELECT n (flags chan body binding)*`: run the first ready arm.
    pub(crate) fn op_select(&mut self, chunk: &Arc<Chunk>, r: &mut OperandReader<'_>) -> Result<(), VmError> {
        let count = r.index();
        let mut arms = Vec::with_capacity(count);
        for _ in 0..count {
            let flags = r.u8();
            let chan = r.u8();
            let body = sub_chunk(chunk, r.u8())?;
            let binding_idx = r.u8();
            let source = if flags & ARM_DEFAULT != 0 {
                ArmSource::Default
            } else if flags & ARM_TIMEOUT != 0 {
                ArmSource::Timeout(sub_chunk(chunk, chan)?)
            } else {
                ArmSource::Channel(sub_chunk(chunk, chan)?)
            };
            let binding = if flags & ARM_BINDING != 0 {
                Some(self.name_operand(chunk, binding_idx as usize)?.to_string())
            } else {
                None
            };
            arms.push(Arm { source, body, binding });
        }

        self.env.push_scope();
        self.export_locals();
        let result = self.run_select(&arms);
        self.env.pop_scope();
        self.push(result?);
        Ok(())
    }

    fn evaluate_arms(&mut self, arms: &[Arm]) -> Result<Vec<Ready>, VmError> {
        let mut ready = Vec::with_capacity(arms.len());
        for arm in arms {
            ready.push(match &arm.source {
                ArmSource::Channel(expr) => {
                    let v = self.run_sub(Arc::clone(expr))?;
                    let ch = v.as_channel().cloned().ok_or_else(|| {
                        VmError::Concurrency("select arm: expression is not a Channel".into())
                    })?;
                    Ready::Channel(ch)
                }
                ArmSource::Timeout(expr) => {
                    let v = self.run_sub(Arc::clone(expr))?;
                    let ms = v.as_int().ok_or_else(|| {
                        VmError::Concurrency("select timeout must be an Int (milliseconds)".into())
                    })?;
                    Ready::Timeout(Instant::now() + Duration::from_millis(ms.max(0) as u64))
                }
                ArmSource::Default => Ready::Default,
            });
        }
        Ok(ready)
    }

    fn run_select(&mut self, arms: &[Arm]) -> Result<Value, VmError> {
        let ready = self.evaluate_arms(arms)?;
        let mut order: Vec<usize> = ready
            .iter()
            .enumerate()
            .filter(|(_, r)| matches!(r, Ready::Channel(_)))
            .map(|(i, _)| i)
            .collect();
        if self.config.select.fair_shuffle {
            order.shuffle(&mut rand::thread_rng());
        }
        let default = ready.iter().position(|r| matches!(r, Ready::Default));
        let timeout = ready.iter().enumerate().find_map(|(i, r)| match r {
            Ready::Timeout(at) => Some((i, *at)),
            _ => None,
        });
        let channels: Vec<Arc<Channel>> = order
            .iter()
            .filter_map(|&i| match &ready[i] {
                Ready::Channel(ch) => Some(Arc::clone(ch)),
                _ => None,
            })
            .collect();
        if channels.is_empty() && default.is_none() && timeout.is_none() {
            return Ok(Value::unit());
        }

        let waiter = SelectWaiter::new();
        let mut registered = false;
        let outcome = loop {
            if let Some(hit) = poll(&order, &ready) {
                break hit;
            }
            if let Some(i) = default {
                break (i, None);
            }
            if !registered {
                for ch in &channels {
                    ch.add_waiter(&waiter);
                }
                registered = true;
                continue;
            }
            let deadline = timeout.map(|(_, at)| at);
            tracing::trace!(arms = channels.len(), ?deadline, "select blocking");
            if !waiter.wait(deadline) {
                if let Some((i, at)) = timeout {
                    if Instant::now() >= at {
                        tracing::trace!("select timed out");
                        break (i, None);
                    }
                }
            }
        };
        if registered {
            for ch in &channels {
                ch.remove_waiter(&waiter);
            }
        }

        let (index, received) = outcome;
        let arm = &arms[index];
        self.env.push_scope();
        if let Some(name) = &arm.binding {
            self.env.define(name, received.unwrap_or_default());
        }
        let result = self.run_sub(Arc::clone(&arm.body));
        self.env.pop_scope();
        result
    }
}

/// One non-blocking pass over the channel arms in `order`. A closed,
/// drained channel only counts once every channel arm is closed.
fn poll(order: &[usize], ready: &[Ready]) -> Option<(usize, Option<Value>)> {
    let mut first_closed = None;
    let mut closed = 0;
    for &i in order {
        let Ready::Channel(ch) = &ready[i] else {
            continue;
        };
        match ch.try_recv() {
            Ok(v) => return Some((i, Some(v))),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                closed += 1;
                first_closed = Some(first_closed.map_or(i, |f: usize| f.min(i)));
            }
        }
    }
    if closed > 0 && closed == order.len() {
        return first_closed.map(|i| (i, Some(Value::nil())));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use lattice_core::{ChunkBuilder, OpCode, SelectArm};

    fn vm() -> Vm {
        Vm::with_config(VmConfig::default())
    }

    fn body(f: impl FnOnce(&mut ChunkBuilder)) -> Chunk {
        let mut b = ChunkBuilder::script();
        f(&mut b);
        b.ret();
        b.build().unwrap()
    }

    fn with_channel(b: &mut ChunkBuilder) {
        b.get_global("channel");
        b.call(0);
        b.define_global("ch");
    }

    #[test]
    fn spawned_body_sends_to_parent() {
        let mut b = ChunkBuilder::script();
        with_channel(&mut b);
        let sender = body(|b| {
            b.get_global("ch");
            b.int(42);
            b.invoke("send", 1);
        });
        b.scope(None, vec![sender]);
        b.op(OpCode::Pop);
        b.get_global("ch");
        b.invoke("recv", 0);
        b.ret();
        assert_eq!(vm().run(b.build().unwrap()).unwrap(), Value::int(42));
    }

    #[test]
    fn spawned_body_sees_exported_local() {
        let mut b = ChunkBuilder::script();
        b.local(1, "n");
        b.int(20);
        with_channel(&mut b);
        let sender = body(|b| {
            b.get_global("ch");
            b.get_global("n");
            b.int(1);
            b.op(OpCode::Add);
            b.invoke("send", 1);
        });
        let sync = body(|b| {
            b.get_global("n");
        });
        b.scope(Some(sync), vec![sender]);
        b.get_global("ch");
        b.invoke("recv", 0);
        b.op(OpCode::Add);
        b.ret();
        assert_eq!(vm().run(b.build().unwrap()).unwrap(), Value::int(41));
    }

    #[test]
    fn spawn_error_surfaces_after_join() {
        let mut b = ChunkBuilder::script();
        let failing = body(|b| {
            b.string("boom");
            b.op(OpCode::Throw);
        });
        b.scope(None, vec![failing, body(|b| {
            b.op(OpCode::Unit);
        })]);
        b.ret();
        let err = vm().run(b.build().unwrap()).unwrap_err();
        assert!(err.message_contains("boom"));
    }

    #[test]
    fn select_prefers_ready_channel_and_binds() {
        let mut b = ChunkBuilder::script();
        with_channel(&mut b);
        b.get_global("ch");
        b.int(7);
        b.invoke("send", 1);
        b.op(OpCode::Pop);
        let chan = body(|b| {
            b.get_global("ch");
        });
        let arm = body(|b| {
            b.get_global("v");
        });
        b.select(vec![
            SelectArm::recv(chan, Some("v"), arm),
            SelectArm::default_arm(body(|b| {
                b.string("idle");
            })),
        ]);
        b.ret();
        assert_eq!(vm().run(b.build().unwrap()).unwrap(), Value::int(7));
    }

    #[test]
    fn select_default_when_nothing_ready() {
        let mut b = ChunkBuilder::script();
        with_channel(&mut b);
        let chan = body(|b| {
            b.get_global("ch");
        });
        b.select(vec![
            SelectArm::recv(chan, None, body(|b| {
                b.string("got");
            })),
            SelectArm::default_arm(body(|b| {
                b.string("idle");
            })),
        ]);
        b.ret();
        assert_eq!(vm().run(b.build().unwrap()).unwrap(), Value::string("idle"));
    }

    #[test]
    fn select_times_out() {
        let mut b = ChunkBuilder::script();
        with_channel(&mut b);
        let chan = body(|b| {
            b.get_global("ch");
        });
        b.select(vec![
            SelectArm::recv(chan, None, body(|b| {
                b.string("got");
            })),
            SelectArm::timeout(body(|b| {
                b.int(10);
            }), body(|b| {
                b.string("late");
            })),
        ]);
        b.ret();
        let started = Instant::now();
        assert_eq!(vm().run(b.build().unwrap()).unwrap(), Value::string("late"));
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn select_on_closed_channels_yields_nil() {
        let mut b = ChunkBuilder::script();
        with_channel(&mut b);
        b.get_global("ch");
        b.invoke("close", 0);
        b.op(OpCode::Pop);
        let chan = body(|b| {
            b.get_global("ch");
        });
        b.select(vec![SelectArm::recv(chan, Some("v"), body(|b| {
            b.get_global("v");
        }))]);
        b.ret();
        assert_eq!(vm().run(b.build().unwrap()).unwrap(), Value::nil());
    }

    #[test]
    fn select_rejects_non_channel() {
        let mut b = ChunkBuilder::script();
        b.select(vec![SelectArm::recv(body(|b| {
            b.int(1);
        }), None, body(|b| {
            b.op(OpCode::Unit);
        }))]);
        b.ret();
        let err = vm().run(b.build().unwrap()).unwrap_err();
        assert!(err.message_contains("select arm: expression is not a Channel"));
    }

    #[test]
    fn exported_closure_owns_its_captures() {
        let parent = vec![Value::int(1), Value::int(9)];
        let cell = UpvalueRef::open(1);
        let chunk = Arc::new(Chunk::new(Some("f")));
        let f = Value::closure(Closure::compiled(chunk, vec![cell.clone()]));
        let mut exporter = Exporter::new(&parent);
        let copy = exporter.export(&f);
        let Some(ClosureKind::Compiled { upvalues, .. }) = copy.as_closure().map(|c| &c.kind) else {
            panic!("expected a compiled closure");
        };
        assert!(upvalues[0].open_slot().is_none());
        assert!(matches!(&*upvalues[0].cell().lock(), UpvalueCell::Closed(v) if *v == Value::int(9)));
        assert!(!upvalues[0].ptr_eq(&cell));
    }
}
