//! Stack VM dispatch loop for executing Lattice bytecode.

mod buffers;
mod calls;
mod collect;
mod concurrency;
mod intrinsics;
mod methods;
mod ops;
mod phase;
mod strings;

pub use intrinsics::{builtin_handler, CALLBACK_BASE};

use crate::bridge::{ExtensionBridge, ExtensionHandle, ModuleLoader};
use crate::config::VmConfig;
use crate::env::Env;
use crate::heap::{FluidHeap, GcStats, RegionTable};
use crate::natives::{core_natives, NativeFn, NativeRegistry};
use crate::phase::PhaseRegistry;
use crate::pic::{djb2, PicCache, PicStats};
use crate::values::{Closure, Data, Home, UpvalueRef, Value};
use lattice_core::{Chunk, Constant, OpCode};
use ops::BinaryOp;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// One live frame in an error's stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function: String,
    pub line: u32,
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("{0}")]
    Runtime(String),
    #[error("{0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("modulo by zero")]
    ModuloByZero,
    #[error("integer overflow")]
    Overflow,
    #[error("stack overflow")]
    StackOverflow,
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
    #[error("{0}")]
    Phase(String),
    #[error("{0}")]
    Concurrency(String),
    #[error("{}", thrown_message(.0))]
    Thrown(Value),
    #[error("[line {line}] {inner}")]
    AtLine { line: u32, inner: Box<VmError> },
    #[error("{message}\nStack trace (most recent call last):{stack_trace}")]
    WithStackTrace {
        message: String,
        stack_trace: String,
        frames: Vec<StackFrame>,
    },
}

fn thrown_message(v: &Value) -> String {
    match v.as_str() {
        Some(s) => s.to_string(),
        None => format!("unhandled exception: {v}"),
    }
}

impl VmError {
    /// Attach a stack trace. No-op for an empty trace or an already
    /// wrapped error.
    pub fn with_stack_trace(self, frames: Vec<StackFrame>) -> Self {
        if frames.is_empty() || matches!(self, VmError::WithStackTrace { .. }) {
            return self;
        }
        let message = self.to_string();
        let stack_trace = Self::format_stack_trace(&frames);
        VmError::WithStackTrace {
            message,
            stack_trace,
            frames,
        }
    }

    pub fn format_stack_trace(frames: &[StackFrame]) -> String {
        let mut trace = String::new();
        for (i, frame) in frames.iter().rev().enumerate() {
            trace.push_str(&format!(
                "\n  #{}: {} (line {})",
                i, frame.function, frame.line
            ));
        }
        trace
    }

    /// Message without the line prefix or stack trace.
    pub fn message(&self) -> String {
        match self {
            VmError::AtLine { inner, .. } => inner.message(),
            VmError::WithStackTrace { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Value pushed for a `catch`: the thrown value itself, or the message.
    pub fn into_catch_value(self) -> Value {
        match self {
            VmError::Thrown(v) => v,
            VmError::AtLine { inner, .. } => inner.into_catch_value(),
            other => Value::string(other.message()),
        }
    }

    /// Check if the error message contains a string (works through wrappers).
    pub fn message_contains(&self, needle: &str) -> bool {
        self.to_string().contains(needle)
    }

    pub fn is_division_by_zero(&self) -> bool {
        match self {
            VmError::DivisionByZero | VmError::ModuloByZero => true,
            VmError::AtLine { inner, .. } => inner.is_division_by_zero(),
            VmError::WithStackTrace { message, .. } => {
                message.ends_with("division by zero") || message.ends_with("modulo by zero")
            }
            _ => false,
        }
    }

    pub fn is_stack_overflow(&self) -> bool {
        match self {
            VmError::StackOverflow => true,
            VmError::AtLine { inner, .. } => inner.is_stack_overflow(),
            VmError::WithStackTrace { message, .. } => message.ends_with("stack overflow"),
            _ => false,
        }
    }

    /// Source line of an uncaught error, when known.
    pub fn line(&self) -> Option<u32> {
        match self {
            VmError::AtLine { line, .. } => Some(*line),
            VmError::WithStackTrace { frames, .. } => frames.last().map(|f| f.line),
            _ => None,
        }
    }

    pub fn stack_frames(&self) -> &[StackFrame] {
        match self {
            VmError::WithStackTrace { frames, .. } => frames,
            _ => &[],
        }
    }

    pub(crate) fn type_error(op: &str, lhs: &Value, rhs: &Value) -> Self {
        VmError::Type(format!(
            "cannot apply '{op}' to {} and {}",
            lhs.type_name(),
            rhs.type_name()
        ))
    }
}

// ---------------------------------------------------------------------------
// Frames and handler records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Call,
    /// Deferred block of the frame below; the stack is cut back to
    /// `restore_top` when it returns.
    Defer { restore_top: usize },
    /// Scope or select sub-body.
    Sub,
}

#[derive(Debug, Clone)]
pub(crate) struct CallFrame {
    pub(crate) chunk: Arc<Chunk>,
    pub(crate) upvalues: Arc<[UpvalueRef]>,
    pub(crate) ip: usize,
    pub(crate) base: usize,
    pub(crate) kind: FrameKind,
}

#[derive(Debug, Clone)]
pub(crate) struct ExceptionHandler {
    pub(crate) ip: usize,
    pub(crate) chunk: Arc<Chunk>,
    pub(crate) frame_index: usize,
    pub(crate) stack_top: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct DeferEntry {
    pub(crate) ip: usize,
    pub(crate) chunk: Arc<Chunk>,
    pub(crate) frame_index: usize,
    pub(crate) base: usize,
    pub(crate) depth: u8,
}

/// Outcome of one dispatch step.
pub(crate) enum Flow {
    Continue,
    Done(Value),
}

/// The Lattice stack VM.
pub struct Vm {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Open upvalues sorted by slot; the highest slot is last.
    pub(crate) open_upvalues: Vec<(usize, UpvalueRef)>,
    pub(crate) handlers: Vec<ExceptionHandler>,
    pub(crate) defers: Vec<DeferEntry>,
    pub(crate) env: Env,
    pub(crate) phases: PhaseRegistry,
    pub(crate) heap: FluidHeap,
    pub(crate) regions: RegionTable,
    pub(crate) pic: PicCache,
    pub(crate) config: Arc<VmConfig>,
    pub(crate) natives: Arc<NativeRegistry>,
    pub(crate) bridge: Option<Arc<dyn ExtensionBridge>>,
    pub(crate) loader: Option<Arc<dyn ModuleLoader>>,
    /// Values held by natives and pending returns across a collection.
    pub(crate) shadow_roots: Vec<Value>,
    /// Captured `print` output, shared with spawned VMs.
    pub(crate) output: Option<Arc<Mutex<Vec<String>>>>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// VM configured from `lattice.toml` (or defaults).
    pub fn new() -> Self {
        Self::with_config(VmConfig::load())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut natives = NativeRegistry::default();
        for (name, f) in core_natives().into_iter().chain(phase::phase_natives()) {
            natives.register(name, f);
        }
        Self::from_parts(Arc::new(config), Arc::new(natives), Env::new())
    }

    pub(crate) fn from_parts(
        config: Arc<VmConfig>,
        natives: Arc<NativeRegistry>,
        mut env: Env,
    ) -> Self {
        for (name, f) in natives.iter() {
            if !env.contains(name) {
                env.define(name, Value::closure(Closure::native(name, f)));
            }
        }
        let heap = FluidHeap::new(
            config.gc.threshold_bytes,
            config.gc.growth_factor,
            config.gc.stress,
        );
        Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(16),
            open_upvalues: Vec::new(),
            handlers: Vec::new(),
            defers: Vec::new(),
            env,
            phases: PhaseRegistry::default(),
            heap,
            regions: RegionTable::default(),
            pic: PicCache::default(),
            config,
            natives,
            bridge: None,
            loader: None,
            shadow_roots: Vec::new(),
            output: None,
        }
    }

    // ------------------------------------------------------------------
    // Host API
    // ------------------------------------------------------------------

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Register a native as a global. Spawned VMs inherit it.
    pub fn register_native(&mut self, name: &str, f: NativeFn) {
        Arc::make_mut(&mut self.natives).register(name, f);
        self.env
            .define(name, Value::closure(Closure::native(name, f)));
    }

    /// Define a global closure routed through the extension bridge.
    pub fn register_extension(&mut self, name: &str, params: &[&str], handle: ExtensionHandle) {
        self.env
            .define(name, Value::closure(Closure::extension(name, params, handle)));
    }

    pub fn set_extension_bridge(&mut self, bridge: Arc<dyn ExtensionBridge>) {
        self.bridge = Some(bridge);
    }

    pub fn set_module_loader(&mut self, loader: Arc<dyn ModuleLoader>) {
        self.loader = Some(loader);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.env.get(name).cloned()
    }

    pub fn define_global(&mut self, name: &str, value: Value) {
        self.env.define(name, value);
    }

    /// Capture `print` output instead of writing to stdout.
    pub fn capture_output(&mut self) {
        self.output = Some(Arc::new(Mutex::new(Vec::new())));
    }

    pub fn take_output(&mut self) -> Vec<String> {
        match &self.output {
            Some(buf) => std::mem::take(&mut *buf.lock()),
            None => Vec::new(),
        }
    }

    pub fn phases(&self) -> &PhaseRegistry {
        &self.phases
    }

    pub fn pic_stats(&self) -> PicStats {
        self.pic.stats()
    }

    /// Handler id cached for `(receiver type, method)` at the call site at
    /// `offset` of `chunk`, if any.
    pub fn cached_handler(
        &self,
        chunk: &Arc<Chunk>,
        offset: usize,
        receiver: &Value,
        method: &str,
    ) -> Option<u8> {
        self.pic
            .table(chunk)
            .and_then(|t| t.lookup(offset, receiver.type_tag(), djb2(method)))
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    pub fn run(&mut self, chunk: Chunk) -> Result<Value, VmError> {
        self.run_arc(Arc::new(chunk))
    }

    /// Run a shared chunk. Keeping the `Arc` lets callers inspect per-chunk
    /// state such as the inline cache afterwards.
    pub fn run_arc(&mut self, chunk: Arc<Chunk>) -> Result<Value, VmError> {
        self.reset();
        self.push_script_frame(chunk, FrameKind::Call);
        let result = self.run_until(0).map_err(|err| {
            let err = self.decorate(err);
            tracing::debug!(error = %err, "uncaught error");
            err
        });
        self.reset();
        result
    }

    /// Run a sub-body on a spawned VM. Errors are returned undecorated; the
    /// parent reports them at its own scope instruction.
    pub(crate) fn run_detached(&mut self, chunk: Arc<Chunk>) -> Result<Value, VmError> {
        self.reset();
        self.push_script_frame(chunk, FrameKind::Sub);
        let result = self.run_until(0);
        self.reset();
        result
    }

    fn push_script_frame(&mut self, chunk: Arc<Chunk>, kind: FrameKind) {
        // Slot 0 holds the running closure, as for any call.
        self.stack
            .push(Value::closure(Closure::compiled(Arc::clone(&chunk), Vec::new())));
        self.frames.push(CallFrame {
            chunk,
            upvalues: Arc::from(Vec::new()),
            ip: 0,
            base: 0,
            kind,
        });
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.handlers.clear();
        self.defers.clear();
        self.shadow_roots.clear();
    }

    fn decorate(&self, err: VmError) -> VmError {
        let err = match err {
            VmError::Thrown(_) => err,
            other => VmError::AtLine {
                line: self.current_line(),
                inner: Box::new(other),
            },
        };
        if self.frames.len() > 1 {
            err.with_stack_trace(self.capture_stack_trace())
        } else {
            err
        }
    }

    pub(crate) fn capture_stack_trace(&self) -> Vec<StackFrame> {
        self.frames
            .iter()
            .map(|f| StackFrame {
                function: f.chunk.display_name().to_string(),
                line: f.chunk.line_at(f.ip.saturating_sub(1)),
            })
            .collect()
    }

    pub(crate) fn current_line(&self) -> u32 {
        self.frames
            .last()
            .map(|f| f.chunk.line_at(f.ip.saturating_sub(1)))
            .unwrap_or(0)
    }

    pub(crate) fn current_function(&self) -> String {
        self.frames
            .last()
            .map(|f| f.chunk.display_name().to_string())
            .unwrap_or_default()
    }

    pub(crate) fn emit_output(&mut self, text: &str) {
        match &self.output {
            Some(buf) => buf.lock().push(text.to_string()),
            None => println!("{text}"),
        }
    }

    // ------------------------------------------------------------------
    // Stack helpers
    // ------------------------------------------------------------------

    pub(crate) fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub(crate) fn pop(&mut self) -> Result<Value, VmError> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::Runtime("stack underflow".into()))
    }

    pub(crate) fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, VmError> {
        let at = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| VmError::Runtime("stack underflow".into()))?;
        Ok(self.stack.split_off(at))
    }

    pub(crate) fn peek(&self, depth: usize) -> Result<&Value, VmError> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .and_then(|i| self.stack.get(i))
            .ok_or_else(|| VmError::Runtime("stack underflow".into()))
    }

    fn frame(&self) -> Result<&CallFrame, VmError> {
        self.frames
            .last()
            .ok_or_else(|| VmError::Runtime("no active frame".into()))
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame, VmError> {
        self.frames
            .last_mut()
            .ok_or_else(|| VmError::Runtime("no active frame".into()))
    }

    fn local_index(&self, slot: usize) -> Result<usize, VmError> {
        let idx = self.frame()?.base + slot;
        if idx < self.stack.len() {
            Ok(idx)
        } else {
            Err(VmError::Runtime(format!("local slot {slot} out of range")))
        }
    }

    /// Register a heap-backed value in the fluid ledger, push it, and give
    /// the collector a chance to run.
    pub(crate) fn alloc_push(&mut self, mut value: Value) {
        self.register(&mut value);
        self.push(value);
        self.maybe_collect();
    }

    pub(crate) fn register(&mut self, value: &mut Value) {
        if let Some(tag) = crate::gc::TypeTag::of(value) {
            value.home = Home::Fluid(self.heap.alloc(tag, value.approx_size()));
        }
    }

    fn constant_value(&self, chunk: &Chunk, idx: usize) -> Result<Value, VmError> {
        let constant = chunk
            .constants
            .get(idx)
            .ok_or_else(|| VmError::Runtime(format!("constant index {idx} out of bounds")))?;
        Ok(match constant {
            Constant::Nil => Value::nil(),
            Constant::Unit => Value::unit(),
            Constant::Bool(b) => Value::bool(*b),
            Constant::Int(i) => Value::int(*i),
            Constant::Float(f) => Value::float(*f),
            Constant::String(s) => Value::string(s.as_str()),
            Constant::Function(f) => Value::closure(Closure::compiled(Arc::clone(f), Vec::new())),
        })
    }

    fn name_operand<'c>(&self, chunk: &'c Chunk, idx: usize) -> Result<&'c str, VmError> {
        chunk
            .constant_str(idx)
            .ok_or_else(|| VmError::Runtime(format!("constant {idx} is not a name")))
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Execute until the frame stack drops to `limit` frames, returning the
    /// value produced by the frame that returned last.
    pub(crate) fn run_until(&mut self, limit: usize) -> Result<Value, VmError> {
        loop {
            match self.step(limit) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done(value)) => return Ok(value),
                Err(err) => self.recover(err, limit)?,
            }
        }
    }

    /// Route an error to the innermost handler registered at or above
    /// `limit`, or hand it back.
    fn recover(&mut self, err: VmError, limit: usize) -> Result<(), VmError> {
        let usable = self
            .handlers
            .last()
            .is_some_and(|h| h.frame_index >= limit && h.frame_index < self.frames.len());
        if !usable {
            return Err(err);
        }
        let Some(handler) = self.handlers.pop() else {
            return Err(err);
        };
        tracing::trace!(error = %err, frame = handler.frame_index, "caught");
        self.frames.truncate(handler.frame_index + 1);
        self.close_upvalues(handler.stack_top);
        self.stack.truncate(handler.stack_top);
        self.defers.retain(|d| d.frame_index <= handler.frame_index);
        let frame = &mut self.frames[handler.frame_index];
        frame.ip = handler.ip;
        frame.chunk = handler.chunk;
        self.push(err.into_catch_value());
        Ok(())
    }

    fn step(&mut self, limit: usize) -> Result<Flow, VmError> {
        let (chunk, offset) = {
            let frame = self.frame_mut()?;
            let offset = frame.ip;
            if offset >= frame.chunk.code.len() {
                return self.finish_frame(Value::unit(), limit);
            }
            let len = frame.chunk.instruction_len(offset).ok_or_else(|| {
                VmError::Runtime(format!("malformed instruction at offset {offset}"))
            })?;
            frame.ip = offset + len;
            (Arc::clone(&frame.chunk), offset)
        };
        let Some(op) = OpCode::decode(chunk.code[offset]) else {
            return Err(VmError::Runtime(format!(
                "unknown opcode {:#04x}",
                chunk.code[offset]
            )));
        };
        let mut r = chunk.operands(offset);

        match op {
            OpCode::Constant => {
                let v = self.constant_value(&chunk, r.index())?;
                self.push(v);
            }
            OpCode::Constant16 => {
                let v = self.constant_value(&chunk, r.wide_index())?;
                self.push(v);
            }
            OpCode::Nil => self.push(Value::nil()),
            OpCode::True => self.push(Value::bool(true)),
            OpCode::False => self.push(Value::bool(false)),
            OpCode::Unit => self.push(Value::unit()),
            OpCode::LoadInt8 => self.push(Value::int(r.i8() as i64)),
            OpCode::Pop => {
                self.pop()?;
            }
            OpCode::Dup => {
                let v = self.peek(0)?.clone();
                self.push(v);
            }
            OpCode::Swap => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(VmError::Runtime("stack underflow".into()));
                }
                self.stack.swap(len - 1, len - 2);
            }

            // ---- arithmetic ----
            OpCode::Add => self.binary_arith(BinaryOp::Add)?,
            OpCode::Sub => self.binary_arith(BinaryOp::Sub)?,
            OpCode::Mul => self.binary_arith(BinaryOp::Mul)?,
            OpCode::Div => self.binary_arith(BinaryOp::Div)?,
            OpCode::Mod => self.binary_arith(BinaryOp::Mod)?,
            OpCode::AddInt => self.int_fast_path(BinaryOp::Add)?,
            OpCode::SubInt => self.int_fast_path(BinaryOp::Sub)?,
            OpCode::MulInt => self.int_fast_path(BinaryOp::Mul)?,
            OpCode::Neg => {
                let v = self.pop()?;
                self.push(ops::negate(&v)?);
            }
            OpCode::Not => {
                let v = self.pop()?;
                self.push(Value::bool(!v.is_truthy()));
            }
            OpCode::BitAnd
            | OpCode::BitOr
            | OpCode::BitXor
            | OpCode::LShift
            | OpCode::RShift => self.bitwise(op)?,
            OpCode::BitNot => {
                let v = self.pop()?;
                match v.data {
                    Data::Int(i) => self.push(Value::int(!i)),
                    _ => {
                        return Err(VmError::Type(format!(
                            "cannot apply '~' to {}",
                            v.type_name()
                        )))
                    }
                }
            }

            // ---- comparison ----
            OpCode::Eq | OpCode::Neq => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let eq = lhs == rhs;
                self.push(Value::bool(if op == OpCode::Eq { eq } else { !eq }));
            }
            OpCode::Lt | OpCode::Gt | OpCode::LtEq | OpCode::GtEq => self.compare(op)?,
            OpCode::LtInt => self.int_compare(OpCode::Lt)?,
            OpCode::LtEqInt => self.int_compare(OpCode::LtEq)?,
            OpCode::Concat => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.push(Value::string(format!("{lhs}{rhs}")));
            }

            // ---- variables ----
            OpCode::GetLocal => {
                let idx = self.local_index(r.index())?;
                let v = self.stack[idx].clone();
                self.push(v);
            }
            OpCode::SetLocal => {
                let slot = r.index();
                let idx = self.local_index(slot)?;
                let v = self.peek(0)?.clone();
                self.stack[idx] = v;
                if let Some(name) = chunk.local_name(slot) {
                    self.note_write(name, idx);
                }
            }
            OpCode::IncLocal | OpCode::DecLocal => {
                let slot = r.index();
                let idx = self.local_index(slot)?;
                let step = if op == OpCode::IncLocal { 1 } else { -1 };
                let next = match self.stack[idx].data {
                    Data::Int(i) => Value::int(i.checked_add(step).ok_or(VmError::Overflow)?),
                    Data::Float(f) => Value::float(f + step as f64),
                    _ => {
                        return Err(VmError::Type(format!(
                            "cannot increment {}",
                            self.stack[idx].type_name()
                        )))
                    }
                };
                let phase = self.stack[idx].phase;
                if phase == crate::values::Phase::Crystal {
                    return Err(VmError::Phase("cannot modify a frozen value".into()));
                }
                self.stack[idx] = next.with_phase(phase);
            }
            OpCode::GetGlobal | OpCode::GetGlobal16 => {
                let idx = if op == OpCode::GetGlobal { r.index() } else { r.wide_index() };
                let name = self.name_operand(&chunk, idx)?;
                let v = self
                    .env
                    .get(name)
                    .cloned()
                    .ok_or_else(|| VmError::UndefinedVariable(name.to_string()))?;
                self.push(v);
            }
            OpCode::SetGlobal | OpCode::SetGlobal16 => {
                let idx = if op == OpCode::SetGlobal { r.index() } else { r.wide_index() };
                let name = self.name_operand(&chunk, idx)?;
                let v = self.peek(0)?.clone();
                if !self.env.assign(name, v.clone()) {
                    return Err(VmError::UndefinedVariable(name.to_string()));
                }
                self.note_global_write(name, &v);
            }
            OpCode::DefineGlobal | OpCode::DefineGlobal16 => {
                let idx = if op == OpCode::DefineGlobal { r.index() } else { r.wide_index() };
                let name = self.name_operand(&chunk, idx)?;
                let v = self.pop()?;
                self.env.define(name, v.clone());
                self.note_global_write(name, &v);
            }
            OpCode::GetUpvalue => {
                let v = self.read_upvalue(r.index())?;
                self.push(v);
            }
            OpCode::SetUpvalue => {
                let v = self.peek(0)?.clone();
                self.write_upvalue(r.index(), v)?;
            }
            OpCode::CloseUpvalue => {
                let top = self
                    .stack
                    .len()
                    .checked_sub(1)
                    .ok_or_else(|| VmError::Runtime("stack underflow".into()))?;
                self.close_upvalues(top);
                self.pop()?;
            }

            // ---- control flow ----
            OpCode::Jump => {
                let d = r.wide_index();
                self.frame_mut()?.ip += d;
            }
            OpCode::JumpIfFalse | OpCode::JumpIfTrue | OpCode::JumpIfNotNil => {
                let d = r.wide_index();
                let top = self.peek(0)?;
                let taken = match op {
                    OpCode::JumpIfFalse => !top.is_truthy(),
                    OpCode::JumpIfTrue => top.is_truthy(),
                    _ => !top.is_nil(),
                };
                if taken {
                    self.frame_mut()?.ip += d;
                }
            }
            OpCode::Loop => {
                let d = r.wide_index();
                let frame = self.frame_mut()?;
                frame.ip = frame.ip.checked_sub(d).ok_or_else(|| {
                    VmError::Runtime(format!("loop target before chunk start at {offset}"))
                })?;
            }

            // ---- calls ----
            OpCode::Call => self.call_value(r.index())?,
            OpCode::Closure => self.make_closure(&chunk, &mut r, false)?,
            OpCode::Closure16 => self.make_closure(&chunk, &mut r, true)?,
            OpCode::Return => {
                let result = self.pop()?;
                return self.finish_frame(result, limit);
            }
            OpCode::Halt => {
                let base = self.frame()?.base;
                let result = if self.stack.len() > base + 1 {
                    self.pop()?
                } else {
                    Value::unit()
                };
                // Unwind to the caller of this run, so a nested run leaves
                // the outer frames as it found them.
                let bottom = self.frames.get(limit).map(|f| match f.kind {
                    FrameKind::Defer { restore_top } => restore_top,
                    _ => f.base,
                });
                if let Some(bottom) = bottom {
                    self.close_upvalues(bottom);
                    self.stack.truncate(bottom);
                    self.frames.truncate(limit);
                    self.handlers.retain(|h| h.frame_index < limit);
                    self.defers.retain(|d| d.frame_index < limit);
                }
                return Ok(Flow::Done(result));
            }

            // ---- iteration ----
            OpCode::IterInit => {
                let collection = self.pop()?;
                let iterable = intrinsics::iterable(collection)?;
                self.push(iterable);
                self.push(Value::int(0));
            }
            OpCode::IterNext => {
                let d = r.wide_index();
                let len = self.stack.len();
                if len < 2 {
                    return Err(VmError::Runtime("stack underflow".into()));
                }
                let index = self.stack[len - 1].as_int().unwrap_or(0);
                match intrinsics::iter_element(&self.stack[len - 2], index) {
                    Some(item) => {
                        self.stack[len - 1] = Value::int(index + 1);
                        self.push(item);
                    }
                    None => self.frame_mut()?.ip += d,
                }
            }

            // ---- construction ----
            OpCode::BuildArray => {
                let items = self.pop_n(r.index())?;
                self.alloc_push(Value::array(items));
            }
            OpCode::ArrayFlatten => {
                let v = self.pop()?;
                let flat = intrinsics::flatten_once(&v)?;
                self.alloc_push(flat);
            }
            OpCode::BuildTuple => {
                let items = self.pop_n(r.index())?;
                self.alloc_push(Value::tuple(items));
            }
            OpCode::BuildMap => {
                let flat = self.pop_n(r.index() * 2)?;
                let mut entries = BTreeMap::new();
                let mut it = flat.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    let key = match k.as_str() {
                        Some(s) => s.to_string(),
                        None => k.to_string(),
                    };
                    entries.insert(key, v);
                }
                self.alloc_push(Value::map(entries));
            }
            OpCode::BuildStruct => {
                let name_idx = r.index();
                let count = r.index();
                let name = self.name_operand(&chunk, name_idx)?.to_string();
                let values = self.pop_n(count)?;
                let mut fields = Vec::with_capacity(count);
                for (i, v) in values.into_iter().enumerate() {
                    let field = self.name_operand(&chunk, name_idx + 1 + i)?;
                    fields.push((field.to_string(), v));
                }
                self.alloc_push(Value::structure(&name, fields));
            }
            OpCode::BuildRange => {
                let end = self.pop()?;
                let start = self.pop()?;
                match (start.as_int(), end.as_int()) {
                    (Some(s), Some(e)) => self.push(Value::range(s, e)),
                    _ => {
                        return Err(VmError::Type(format!(
                            "range bounds must be Int, got {} and {}",
                            start.type_name(),
                            end.type_name()
                        )))
                    }
                }
            }
            OpCode::BuildEnum => {
                let enum_name = self.name_operand(&chunk, r.index())?.to_string();
                let variant = self.name_operand(&chunk, r.index())?.to_string();
                let payload = self.pop_n(r.index())?;
                self.alloc_push(Value::enumeration(&enum_name, &variant, payload));
            }

            // ---- indexing and fields ----
            OpCode::Index => {
                let index = self.pop()?;
                let target = self.pop()?;
                self.push(intrinsics::index_value(&target, &index)?);
            }
            OpCode::SetIndex => {
                let index = self.pop()?;
                let mut target = self.pop()?;
                let value = self.pop()?;
                intrinsics::set_index(&mut target, &index, value)?;
                self.push(target);
            }
            OpCode::SetIndexLocal => {
                let idx = self.local_index(r.index())?;
                let index = self.pop()?;
                let value = self.peek(0)?.clone();
                let mut target = std::mem::take(&mut self.stack[idx]);
                let result = intrinsics::set_index(&mut target, &index, value);
                self.stack[idx] = target;
                result?;
            }
            OpCode::GetField => {
                let name = self.name_operand(&chunk, r.index())?;
                let target = self.pop()?;
                self.push(intrinsics::get_field(&target, name)?);
            }
            OpCode::SetField => {
                let name = self.name_operand(&chunk, r.index())?;
                let mut target = self.pop()?;
                let value = self.pop()?;
                intrinsics::set_field(&mut target, name, value)?;
                self.push(target);
            }
            OpCode::Invoke => {
                let name = self.name_operand(&chunk, r.index())?;
                let argc = r.index();
                self.op_invoke(&chunk, offset, name, argc)?;
            }
            OpCode::InvokeLocal => {
                let slot = r.index();
                let name = self.name_operand(&chunk, r.index())?;
                let argc = r.index();
                self.op_invoke_local(&chunk, offset, slot, name, argc)?;
            }
            OpCode::InvokeGlobal => {
                let global = self.name_operand(&chunk, r.index())?;
                let name = self.name_operand(&chunk, r.index())?;
                let argc = r.index();
                self.op_invoke_global(&chunk, offset, global, name, argc)?;
            }

            // ---- exceptions and defer ----
            OpCode::PushExceptionHandler => {
                let d = r.wide_index();
                if self.handlers.len() >= self.config.max_handlers {
                    return Err(VmError::Runtime(
                        "too many nested exception handlers".into(),
                    ));
                }
                let ip = self.frame()?.ip + d;
                self.handlers.push(ExceptionHandler {
                    ip,
                    chunk: Arc::clone(&chunk),
                    frame_index: self.frames.len() - 1,
                    stack_top: self.stack.len(),
                });
            }
            OpCode::PopExceptionHandler => {
                self.handlers.pop();
            }
            OpCode::Throw => {
                let v = self.pop()?;
                return Err(VmError::Thrown(v));
            }
            OpCode::TryUnwrap => {
                let v = self.pop()?;
                match intrinsics::unwrap_result(v)? {
                    Ok(inner) => self.push(inner),
                    Err(err) => return self.finish_frame(err, limit),
                }
            }
            OpCode::DeferPush => {
                let depth = r.u8();
                let skip = r.wide_index();
                if self.defers.len() >= self.config.max_defers {
                    return Err(VmError::Runtime("too many deferred blocks".into()));
                }
                let frame_index = self.frames.len() - 1;
                let frame = self.frame_mut()?;
                let entry = DeferEntry {
                    ip: frame.ip,
                    chunk: Arc::clone(&chunk),
                    frame_index,
                    base: frame.base,
                    depth,
                };
                frame.ip += skip;
                self.defers.push(entry);
            }
            OpCode::DeferRun => {
                let min = r.u8();
                let frame_index = self.frames.len() - 1;
                self.run_defers(frame_index, min)?;
            }

            // ---- phase system ----
            OpCode::Freeze => {
                let v = self.pop()?;
                let frozen = self.freeze_value(v)?;
                self.push(frozen);
            }
            OpCode::Thaw => {
                let v = self.pop()?;
                let thawed = self.thaw_value(&v);
                self.push(thawed);
            }
            OpCode::Clone => {
                let v = self.pop()?;
                let mut copy = v.deep_clone();
                self.register(&mut copy);
                self.push(copy);
            }
            OpCode::MarkFluid => {
                let top = self.stack.len().checked_sub(1);
                match top {
                    Some(i) => self.stack[i].phase = crate::values::Phase::Fluid,
                    None => return Err(VmError::Runtime("stack underflow".into())),
                }
            }
            OpCode::Sublimate => {
                let v = self.pop()?;
                self.push(v.with_phase(crate::values::Phase::Sublimated));
            }
            OpCode::React => {
                let name = self.name_operand(&chunk, r.index())?;
                self.op_react(name)?;
            }
            OpCode::Unreact => {
                let name = self.name_operand(&chunk, r.index())?;
                self.phases.remove_reactions(name);
                self.push(Value::unit());
            }
            OpCode::Bond => {
                let target = self.name_operand(&chunk, r.index())?;
                self.op_bond(target)?;
            }
            OpCode::Unbond => {
                let target = self.name_operand(&chunk, r.index())?;
                let dep = self.pop()?;
                if let Some(dep) = dep.as_str() {
                    self.phases.remove_bond(target, dep);
                }
                self.push(Value::unit());
            }
            OpCode::Seed => {
                let name = self.name_operand(&chunk, r.index())?;
                self.op_seed(name)?;
            }
            OpCode::Unseed => {
                let name = self.name_operand(&chunk, r.index())?;
                self.phases.remove_seeds(name);
                self.push(Value::unit());
            }
            OpCode::FreezeVar | OpCode::ThawVar | OpCode::SublimateVar => {
                let name = self.name_operand(&chunk, r.index())?;
                let location = r.u8();
                let slot = r.index();
                self.op_phase_var(op, name, location, slot)?;
            }

            // ---- misc ----
            OpCode::Print => {
                let values = self.pop_n(r.index())?;
                let line = values
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                self.emit_output(&line);
                self.push(Value::unit());
            }
            OpCode::Import => {
                let path = self.name_operand(&chunk, r.index())?;
                let module = match &self.loader {
                    Some(loader) => loader.load(path).map_err(VmError::Runtime)?,
                    None => {
                        return Err(VmError::Runtime(format!("import not supported: {path}")))
                    }
                };
                self.push(module);
            }
            OpCode::Scope => self.op_scope(&chunk, &mut r)?,
            OpCode::Select => self.op_select(&chunk, &mut r)?,
        }
        Ok(Flow::Continue)
    }
}
