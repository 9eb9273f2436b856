//! Compiled bytecode unit: code, constant pool, and debug tables.

use crate::opcode::OpCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Constant pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Nil,
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Nested compiled function, or a scope/select sub-body.
    Function(Arc<Chunk>),
}

impl Constant {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Arc<Chunk>> {
        match self {
            Constant::Function(chunk) => Some(chunk),
            _ => None,
        }
    }
}

impl From<i64> for Constant {
    fn from(v: i64) -> Self {
        Constant::Int(v)
    }
}

impl From<f64> for Constant {
    fn from(v: f64) -> Self {
        Constant::Float(v)
    }
}

impl From<bool> for Constant {
    fn from(v: bool) -> Self {
        Constant::Bool(v)
    }
}

impl From<&str> for Constant {
    fn from(v: &str) -> Self {
        Constant::String(v.to_string())
    }
}

impl From<String> for Constant {
    fn from(v: String) -> Self {
        Constant::String(v)
    }
}

impl From<Chunk> for Constant {
    fn from(v: Chunk) -> Self {
        Constant::Function(Arc::new(v))
    }
}

/// A compiled function body.
///
/// `lines` runs parallel to `code` (one entry per byte). `local_names`
/// maps stack slots (relative to the frame base) to source identifiers;
/// the phase system uses it to find variables by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub name: Option<String>,
    pub param_names: Vec<String>,
    pub code: Vec<u8>,
    pub constants: Vec<Constant>,
    pub lines: Vec<u32>,
    pub local_names: Vec<Option<String>>,
}

impl Chunk {
    pub fn new(name: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn arity(&self) -> usize {
        self.param_names.len()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<script>")
    }

    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn add_constant(&mut self, constant: Constant) -> usize {
        self.constants.push(constant);
        self.constants.len() - 1
    }

    /// Add a string constant, reusing an existing identical entry.
    pub fn add_name(&mut self, name: &str) -> usize {
        if let Some(idx) = self
            .constants
            .iter()
            .position(|c| c.as_str() == Some(name))
        {
            return idx;
        }
        self.add_constant(Constant::String(name.to_string()))
    }

    pub fn set_local_name(&mut self, slot: usize, name: &str) {
        if self.local_names.len() <= slot {
            self.local_names.resize(slot + 1, None);
        }
        self.local_names[slot] = Some(name.to_string());
    }

    pub fn local_name(&self, slot: usize) -> Option<&str> {
        self.local_names.get(slot).and_then(|n| n.as_deref())
    }

    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    pub fn constant_str(&self, idx: usize) -> Option<&str> {
        self.constants.get(idx).and_then(Constant::as_str)
    }

    /// Total length in bytes of the instruction starting at `offset`,
    /// including the opcode byte. `None` if the opcode is unknown or its
    /// operands run past the end of the code.
    pub fn instruction_len(&self, offset: usize) -> Option<usize> {
        let op = OpCode::decode(*self.code.get(offset)?)?;
        let operands = match op.fixed_operand_len() {
            Some(n) => n,
            None => {
                let at = |i: usize| self.code.get(offset + i).copied().map(usize::from);
                match op {
                    OpCode::Closure => 2 + 2 * at(2)?,
                    OpCode::Closure16 => 3 + 2 * at(3)?,
                    OpCode::Scope => 2 + at(1)?,
                    OpCode::Select => 1 + 4 * at(1)?,
                    _ => return None,
                }
            }
        };
        let len = 1 + operands;
        (offset + len <= self.code.len()).then_some(len)
    }

    /// Operand reader positioned just after the opcode at `offset`.
    pub fn operands(&self, offset: usize) -> OperandReader<'_> {
        OperandReader {
            code: &self.code,
            pos: offset + 1,
        }
    }
}

/// Sequential decoder over instruction operands.
///
/// Callers validate the instruction with [`Chunk::instruction_len`] first;
/// reads past the end yield zero.
#[derive(Debug)]
pub struct OperandReader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl OperandReader<'_> {
    pub fn u8(&mut self) -> u8 {
        let b = self.code.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        b
    }

    pub fn i8(&mut self) -> i8 {
        self.u8() as i8
    }

    pub fn u16(&mut self) -> u16 {
        let hi = self.u8() as u16;
        let lo = self.u8() as u16;
        (hi << 8) | lo
    }

    pub fn index(&mut self) -> usize {
        self.u8() as usize
    }

    pub fn wide_index(&mut self) -> usize {
        self.u16() as usize
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_len_covers_variable_forms() {
        let mut chunk = Chunk::new(Some("t"));
        // CLOSURE fn=0, 2 upvalues
        for b in [OpCode::Closure as u8, 0, 2, 1, 0, 0, 1] {
            chunk.write(b, 1);
        }
        // SELECT with one arm
        for b in [OpCode::Select as u8, 1, 0x01, 0xFF, 3, 0xFF] {
            chunk.write(b, 2);
        }
        assert_eq!(chunk.instruction_len(0), Some(7));
        assert_eq!(chunk.instruction_len(7), Some(6));
        assert_eq!(chunk.line_at(8), 2);
    }

    #[test]
    fn truncated_instruction_is_rejected() {
        let mut chunk = Chunk::new(None);
        chunk.write(OpCode::Jump as u8, 1);
        chunk.write(0, 1);
        assert_eq!(chunk.instruction_len(0), None);
    }

    #[test]
    fn add_name_deduplicates() {
        let mut chunk = Chunk::new(None);
        let a = chunk.add_name("x");
        chunk.add_constant(Constant::Int(3));
        let b = chunk.add_name("x");
        assert_eq!(a, b);
        assert_eq!(chunk.constants.len(), 2);
    }
}
