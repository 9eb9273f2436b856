//! Lattice Core
//!
//! Bytecode definitions shared by the compiler front end and the runtime:
//! opcodes, chunks, the chunk builder, the disassembler, and the serialized
//! bytecode format.

pub mod builder;
pub mod chunk;
pub mod disasm;
pub mod opcode;
pub mod serialize;

pub use builder::{ArmKind, BuildError, Capture, ChunkBuilder, SelectArm};
pub use chunk::{Chunk, Constant, OperandReader};
pub use opcode::{OpCode, VarLocation};
