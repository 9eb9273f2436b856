//! Lattice RT: the phase-aware bytecode virtual machine.
//!
//! Provides the value model, the stack VM with its inline method cache,
//! the phase subsystem (freeze/thaw, bonds, seeds, reactions, pressure,
//! history), the dual-heap collector, and scope/select concurrency over
//! channels.

pub mod bridge;
pub mod channel;
pub mod config;
mod env;
pub mod gc;
pub mod heap;
pub mod natives;
pub mod phase;
pub mod pic;
pub mod values;
pub mod vm;

pub use bridge::{ExtensionBridge, ExtensionHandle, ModuleLoader};
pub use channel::Channel;
pub use config::VmConfig;
pub use heap::GcStats;
pub use natives::{NativeContext, NativeFn};
pub use phase::{BondStrategy, PressureMode, Snapshot};
pub use values::{Phase, Value};
pub use vm::{Vm, VmError};

// Bytecode types, so embedders only need one dependency.
pub use lattice_core::{Chunk, ChunkBuilder, OpCode};
