//! Hooks for host-provided functionality: extension calls and imports.

use crate::values::Value;

/// Opaque handle naming one function exported by a loaded extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtensionHandle {
    pub extension: u32,
    pub function: u32,
}

/// Routes calls on extension closures to the host.
pub trait ExtensionBridge: Send + Sync {
    fn call(&self, handle: ExtensionHandle, args: &[Value]) -> Result<Value, String>;
}

/// Resolves `IMPORT` paths to a module value (typically a map of exports).
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &str) -> Result<Value, String>;
}
