//! Chunk assembler.
//!
//! `ChunkBuilder` is the emission API used by the compiler back end and by
//! runtime tests that assemble bytecode by hand. Jump targets are patched
//! in place; the first encoding problem is remembered and reported by
//! [`ChunkBuilder::build`].

use crate::chunk::{Chunk, Constant};
use crate::opcode::{OpCode, VarLocation, ARM_BINDING, ARM_DEFAULT, ARM_TIMEOUT, NO_INDEX};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("jump offset {0} does not fit in 16 bits")]
    JumpTooFar(usize),
    #[error("constant index {0} does not fit in a one-byte operand")]
    ConstantOverflow(usize),
    #[error("operand count {0} does not fit in one byte")]
    TooManyOperands(usize),
}

/// How a closure captures one variable of the enclosing function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// Local slot of the immediately enclosing frame.
    Local(u8),
    /// Upvalue index of the immediately enclosing closure.
    Upvalue(u8),
}

#[derive(Debug, Clone)]
pub enum ArmKind {
    /// Sub-body evaluating to the channel to receive from.
    Channel(Chunk),
    /// Sub-body evaluating to a timeout in milliseconds.
    Timeout(Chunk),
    Default,
}

#[derive(Debug, Clone)]
pub struct SelectArm {
    pub kind: ArmKind,
    pub body: Chunk,
    pub binding: Option<String>,
}

impl SelectArm {
    pub fn recv(channel: Chunk, binding: Option<&str>, body: Chunk) -> Self {
        Self {
            kind: ArmKind::Channel(channel),
            body,
            binding: binding.map(str::to_string),
        }
    }

    pub fn timeout(millis: Chunk, body: Chunk) -> Self {
        Self {
            kind: ArmKind::Timeout(millis),
            body,
            binding: None,
        }
    }

    pub fn default_arm(body: Chunk) -> Self {
        Self {
            kind: ArmKind::Default,
            body,
            binding: None,
        }
    }
}

#[derive(Debug)]
pub struct ChunkBuilder {
    chunk: Chunk,
    line: u32,
    error: Option<BuildError>,
}

impl ChunkBuilder {
    /// Builder for a named function. Slot 0 holds the callee; parameters
    /// occupy slots `1..=n`.
    pub fn function(name: &str, params: &[&str]) -> Self {
        let mut chunk = Chunk::new(Some(name));
        chunk.param_names = params.iter().map(|p| p.to_string()).collect();
        for (i, p) in params.iter().enumerate() {
            chunk.set_local_name(i + 1, p);
        }
        Self {
            chunk,
            line: 1,
            error: None,
        }
    }

    /// Builder for a top-level script or a scope/select sub-body.
    pub fn script() -> Self {
        Self {
            chunk: Chunk::new(None),
            line: 1,
            error: None,
        }
    }

    pub fn build(self) -> Result<Chunk, BuildError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.chunk),
        }
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    /// Current code offset (target for `emit_loop`).
    pub fn offset(&self) -> usize {
        self.chunk.code.len()
    }

    pub fn line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    fn fail(&mut self, err: BuildError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn byte_operand(&mut self, value: usize) -> u8 {
        match u8::try_from(value) {
            Ok(b) => b,
            Err(_) => {
                self.fail(BuildError::ConstantOverflow(value));
                0
            }
        }
    }

    fn count_operand(&mut self, count: usize) -> u8 {
        match u8::try_from(count) {
            Ok(b) => b,
            Err(_) => {
                self.fail(BuildError::TooManyOperands(count));
                0
            }
        }
    }

    // ------------------------------------------------------------------
    // Raw emission
    // ------------------------------------------------------------------

    pub fn byte(&mut self, b: u8) -> &mut Self {
        self.chunk.write(b, self.line);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.byte((v >> 8) as u8).byte((v & 0xFF) as u8)
    }

    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.byte(op as u8)
    }

    pub fn op_u8(&mut self, op: OpCode, a: u8) -> &mut Self {
        self.op(op).byte(a)
    }

    // ------------------------------------------------------------------
    // Constants and variables
    // ------------------------------------------------------------------

    pub fn add_constant(&mut self, constant: impl Into<Constant>) -> usize {
        self.chunk.add_constant(constant.into())
    }

    pub fn name(&mut self, name: &str) -> usize {
        self.chunk.add_name(name)
    }

    /// Push a constant, choosing the wide form past index 255.
    pub fn constant(&mut self, constant: impl Into<Constant>) -> &mut Self {
        let idx = self.add_constant(constant);
        self.indexed(OpCode::Constant, OpCode::Constant16, idx)
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.constant(s)
    }

    pub fn int(&mut self, v: i64) -> &mut Self {
        match i8::try_from(v) {
            Ok(small) => self.op_u8(OpCode::LoadInt8, small as u8),
            Err(_) => self.constant(v),
        }
    }

    fn indexed(&mut self, narrow: OpCode, wide: OpCode, idx: usize) -> &mut Self {
        if let Ok(b) = u8::try_from(idx) {
            self.op_u8(narrow, b)
        } else if let Ok(w) = u16::try_from(idx) {
            self.op(wide).u16(w)
        } else {
            self.fail(BuildError::ConstantOverflow(idx));
            self
        }
    }

    pub fn get_global(&mut self, name: &str) -> &mut Self {
        let idx = self.name(name);
        self.indexed(OpCode::GetGlobal, OpCode::GetGlobal16, idx)
    }

    pub fn set_global(&mut self, name: &str) -> &mut Self {
        let idx = self.name(name);
        self.indexed(OpCode::SetGlobal, OpCode::SetGlobal16, idx)
    }

    pub fn define_global(&mut self, name: &str) -> &mut Self {
        let idx = self.name(name);
        self.indexed(OpCode::DefineGlobal, OpCode::DefineGlobal16, idx)
    }

    /// Record a source name for a local slot.
    pub fn local(&mut self, slot: u8, name: &str) -> &mut Self {
        self.chunk.set_local_name(slot as usize, name);
        self
    }

    pub fn get_local(&mut self, slot: u8) -> &mut Self {
        self.op_u8(OpCode::GetLocal, slot)
    }

    pub fn set_local(&mut self, slot: u8) -> &mut Self {
        self.op_u8(OpCode::SetLocal, slot)
    }

    pub fn get_upvalue(&mut self, idx: u8) -> &mut Self {
        self.op_u8(OpCode::GetUpvalue, idx)
    }

    pub fn set_upvalue(&mut self, idx: u8) -> &mut Self {
        self.op_u8(OpCode::SetUpvalue, idx)
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    /// Emit a forward jump with a placeholder offset; returns the operand
    /// position for [`ChunkBuilder::patch_jump`].
    pub fn jump(&mut self, op: OpCode) -> usize {
        self.op(op).u16(0xFFFF);
        self.offset() - 2
    }

    /// Point the jump operand at `at` to the current offset.
    pub fn patch_jump(&mut self, at: usize) -> &mut Self {
        let distance = self.offset().saturating_sub(at + 2);
        match u16::try_from(distance) {
            Ok(d) => {
                self.chunk.code[at] = (d >> 8) as u8;
                self.chunk.code[at + 1] = (d & 0xFF) as u8;
            }
            Err(_) => self.fail(BuildError::JumpTooFar(distance)),
        }
        self
    }

    /// Jump backward to `start`.
    pub fn emit_loop(&mut self, start: usize) -> &mut Self {
        self.op(OpCode::Loop);
        let distance = self.offset() + 2 - start;
        match u16::try_from(distance) {
            Ok(d) => self.u16(d),
            Err(_) => {
                self.fail(BuildError::JumpTooFar(distance));
                self.u16(0)
            }
        }
    }

    // ------------------------------------------------------------------
    // Calls and closures
    // ------------------------------------------------------------------

    pub fn call(&mut self, argc: u8) -> &mut Self {
        self.op_u8(OpCode::Call, argc)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(OpCode::Return)
    }

    pub fn closure(&mut self, function: Chunk, captures: &[Capture]) -> &mut Self {
        let idx = self.add_constant(function);
        let count = self.count_operand(captures.len());
        if let Ok(b) = u8::try_from(idx) {
            self.op_u8(OpCode::Closure, b);
        } else if let Ok(w) = u16::try_from(idx) {
            self.op(OpCode::Closure16).u16(w);
        } else {
            self.fail(BuildError::ConstantOverflow(idx));
            return self;
        }
        self.byte(count);
        for capture in captures {
            match *capture {
                Capture::Local(slot) => self.byte(1).byte(slot),
                Capture::Upvalue(idx) => self.byte(0).byte(idx),
            };
        }
        self
    }

    pub fn invoke(&mut self, method: &str, argc: u8) -> &mut Self {
        let m = self.name(method);
        let m = self.byte_operand(m);
        self.op_u8(OpCode::Invoke, m).byte(argc)
    }

    pub fn invoke_local(&mut self, slot: u8, method: &str, argc: u8) -> &mut Self {
        let m = self.name(method);
        let m = self.byte_operand(m);
        self.op_u8(OpCode::InvokeLocal, slot).byte(m).byte(argc)
    }

    pub fn invoke_global(&mut self, global: &str, method: &str, argc: u8) -> &mut Self {
        let g = self.name(global);
        let g = self.byte_operand(g);
        let m = self.name(method);
        let m = self.byte_operand(m);
        self.op_u8(OpCode::InvokeGlobal, g).byte(m).byte(argc)
    }

    /// Emit an operand that names a string constant (field, phase target).
    pub fn named(&mut self, op: OpCode, name: &str) -> &mut Self {
        let idx = self.name(name);
        let idx = self.byte_operand(idx);
        self.op_u8(op, idx)
    }

    pub fn build_struct(&mut self, name: &str, fields: &[&str]) -> &mut Self {
        // Field names must follow the struct name in the pool, so they are
        // appended without de-duplication.
        let name_idx = self.add_constant(name);
        for field in fields {
            self.add_constant(*field);
        }
        let name_idx = self.byte_operand(name_idx);
        let count = self.count_operand(fields.len());
        self.op_u8(OpCode::BuildStruct, name_idx).byte(count)
    }

    pub fn build_enum(&mut self, enum_name: &str, variant: &str, payload: u8) -> &mut Self {
        let e = self.name(enum_name);
        let e = self.byte_operand(e);
        let v = self.name(variant);
        let v = self.byte_operand(v);
        self.op_u8(OpCode::BuildEnum, e).byte(v).byte(payload)
    }

    // ------------------------------------------------------------------
    // Exceptions and defer
    // ------------------------------------------------------------------

    /// Emit `DEFER_PUSH depth` followed by the body produced by `body`,
    /// terminated with `UNIT; RETURN`.
    pub fn defer(&mut self, depth: u8, body: impl FnOnce(&mut Self)) -> &mut Self {
        self.op_u8(OpCode::DeferPush, depth).u16(0xFFFF);
        let at = self.offset() - 2;
        body(self);
        self.op(OpCode::Unit).op(OpCode::Return);
        self.patch_jump(at)
    }

    // ------------------------------------------------------------------
    // Phase system
    // ------------------------------------------------------------------

    pub fn phase_var(
        &mut self,
        op: OpCode,
        name: &str,
        location: VarLocation,
        slot: u8,
        consume_seeds: bool,
    ) -> &mut Self {
        let idx = self.name(name);
        let idx = self.byte_operand(idx);
        self.op_u8(op, idx)
            .byte(location.encode(consume_seeds))
            .byte(slot)
    }

    // ------------------------------------------------------------------
    // Concurrency
    // ------------------------------------------------------------------

    fn sub_body(&mut self, chunk: Chunk) -> u8 {
        let idx = self.add_constant(chunk);
        if idx >= NO_INDEX as usize {
            self.fail(BuildError::ConstantOverflow(idx));
            return 0;
        }
        idx as u8
    }

    pub fn scope(&mut self, sync: Option<Chunk>, spawns: Vec<Chunk>) -> &mut Self {
        let sync_idx = match sync {
            Some(chunk) => self.sub_body(chunk),
            None => NO_INDEX,
        };
        let spawn_idx: Vec<u8> = spawns.into_iter().map(|c| self.sub_body(c)).collect();
        let count = self.count_operand(spawn_idx.len());
        self.op_u8(OpCode::Scope, count).byte(sync_idx);
        for idx in spawn_idx {
            self.byte(idx);
        }
        self
    }

    pub fn select(&mut self, arms: Vec<SelectArm>) -> &mut Self {
        let mut encoded = Vec::with_capacity(arms.len());
        for arm in arms {
            let mut flags = 0u8;
            let chan_idx = match arm.kind {
                ArmKind::Default => {
                    flags |= ARM_DEFAULT;
                    NO_INDEX
                }
                ArmKind::Timeout(chunk) => {
                    flags |= ARM_TIMEOUT;
                    self.sub_body(chunk)
                }
                ArmKind::Channel(chunk) => self.sub_body(chunk),
            };
            let body_idx = self.sub_body(arm.body);
            let binding_idx = match arm.binding {
                Some(name) => {
                    flags |= ARM_BINDING;
                    let idx = self.name(&name);
                    self.byte_operand(idx)
                }
                None => NO_INDEX,
            };
            encoded.push([flags, chan_idx, body_idx, binding_idx]);
        }
        let count = self.count_operand(encoded.len());
        self.op_u8(OpCode::Select, count);
        for arm in encoded {
            for b in arm {
                self.byte(b);
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_jump_is_patched_relative_to_operand_end() {
        let mut b = ChunkBuilder::script();
        b.op(OpCode::True);
        let at = b.jump(OpCode::JumpIfFalse);
        b.op(OpCode::Pop).op(OpCode::Nil);
        b.patch_jump(at);
        let chunk = b.build().unwrap();
        assert_eq!(&chunk.code[2..4], &[0, 2]);
    }

    #[test]
    fn loop_offset_lands_on_start() {
        let mut b = ChunkBuilder::script();
        let start = b.offset();
        b.op(OpCode::Nil).op(OpCode::Pop);
        b.emit_loop(start);
        let chunk = b.build().unwrap();
        let distance = u16::from_be_bytes([chunk.code[3], chunk.code[4]]) as usize;
        assert_eq!(chunk.code.len() - distance, start);
    }

    #[test]
    fn small_ints_use_inline_operand() {
        let mut b = ChunkBuilder::script();
        b.int(-3).int(1000);
        let chunk = b.build().unwrap();
        assert_eq!(chunk.code[0], OpCode::LoadInt8 as u8);
        assert_eq!(chunk.code[1] as i8, -3);
        assert_eq!(chunk.code[2], OpCode::Constant as u8);
        assert_eq!(chunk.constants[0], Constant::Int(1000));
    }

    #[test]
    fn wide_constant_form_past_255() {
        let mut b = ChunkBuilder::script();
        for i in 0..300 {
            b.add_constant(i as i64);
        }
        b.constant(7i64);
        let chunk = b.build().unwrap();
        let at = chunk.code.len() - 3;
        assert_eq!(chunk.code[at], OpCode::Constant16 as u8);
        assert_eq!(u16::from_be_bytes([chunk.code[at + 1], chunk.code[at + 2]]), 300);
    }

    #[test]
    fn function_builder_names_parameter_slots() {
        let b = ChunkBuilder::function("add", &["a", "b"]);
        let chunk = b.build().unwrap();
        assert_eq!(chunk.arity(), 2);
        assert_eq!(chunk.local_name(1), Some("a"));
        assert_eq!(chunk.local_name(2), Some("b"));
        assert_eq!(chunk.local_name(0), None);
    }

    #[test]
    fn select_encodes_arm_flags() {
        let mut b = ChunkBuilder::script();
        b.select(vec![
            SelectArm::recv(Chunk::new(None), Some("v"), Chunk::new(None)),
            SelectArm::default_arm(Chunk::new(None)),
        ]);
        let chunk = b.build().unwrap();
        let at = chunk.code.len() - 10;
        assert_eq!(chunk.code[at], OpCode::Select as u8);
        assert_eq!(chunk.code[at + 1], 2);
        assert_eq!(chunk.code[at + 2], ARM_BINDING);
        assert_eq!(chunk.code[at + 6], ARM_DEFAULT);
        assert_eq!(chunk.code[at + 7], NO_INDEX);
        assert_eq!(chunk.instruction_len(at), Some(10));
    }
}
