//! `INVOKE*` dispatch through the polymorphic inline cache.
//!
//! A call site resolves `(receiver type, method)` to a builtin handler id
//! once and caches it. Anything that is not a builtin falls through to a
//! callable field on the receiver, then to a global `Type::method`, and
//! finally yields Nil.

use super::intrinsics::{builtin_handler, CALLBACK_BASE};
use super::{Vm, VmError};
use crate::pic::{djb2, NOT_BUILTIN};
use crate::values::{Data, Value};
use lattice_core::Chunk;
use std::sync::Arc;

impl Vm {
    fn resolve_handler(&mut self, chunk: &Arc<Chunk>, offset: usize, type_tag: u8, method: &str) -> u8 {
        let hash = djb2(method);
        if let Some(handler) = self.pic.lookup(chunk, offset, type_tag, hash) {
            return handler;
        }
        let handler = builtin_handler(type_tag, method);
        tracing::trace!(offset, type_tag, method, handler, "inline cache miss");
        self.pic.update(chunk, offset, type_tag, hash, handler);
        handler
    }

    /// Run `f` with `recv` rooted, for lookups that call back into the VM.
    pub(super) fn with_rooted(
        &mut self,
        recv: Value,
        f: impl FnOnce(&mut Vm, Value) -> Result<Value, VmError>,
    ) -> Result<Value, VmError> {
        let depth = self.shadow_roots.len();
        self.shadow_roots.push(recv.clone());
        let result = f(self, recv);
        self.shadow_roots.truncate(depth);
        result
    }

    fn call_rooted(&mut self, handler: u8, recv: Value, args: Vec<Value>) -> Result<Value, VmError> {
        self.with_rooted(recv, |vm, mut recv| vm.call_builtin(handler, &mut recv, args, None))
    }

    fn push_result(&mut self, result: Value) {
        if result.home == crate::values::Home::None && result.is_heap_backed() {
            self.alloc_push(result);
        } else {
            self.push(result);
        }
    }

    /// `INVOKE name argc`: receiver sits below its arguments.
    pub(crate) fn op_invoke(
        &mut self,
        chunk: &Arc<Chunk>,
        offset: usize,
        method: &str,
        argc: usize,
    ) -> Result<(), VmError> {
        let args = self.pop_n(argc)?;
        let mut recv = self.pop()?;
        let handler = self.resolve_handler(chunk, offset, recv.type_tag(), method);
        let result = match handler {
            NOT_BUILTIN => self.invoke_method(recv, method, args)?,
            h if h >= CALLBACK_BASE => self.call_rooted(h, recv, args)?,
            h => self.call_builtin(h, &mut recv, args, None)?,
        };
        self.push_result(result);
        Ok(())
    }

    /// `INVOKE_LOCAL slot name argc`: mutating builtins update the local in
    /// place, subject to the pressure on its name.
    pub(crate) fn op_invoke_local(
        &mut self,
        chunk: &Arc<Chunk>,
        offset: usize,
        slot: usize,
        method: &str,
        argc: usize,
    ) -> Result<(), VmError> {
        let args = self.pop_n(argc)?;
        let idx = self.local_index(slot)?;
        let handler = self.resolve_handler(chunk, offset, self.stack[idx].type_tag(), method);
        let result = match handler {
            NOT_BUILTIN => {
                let recv = self.stack[idx].clone();
                self.invoke_method(recv, method, args)?
            }
            h if h >= CALLBACK_BASE => {
                let recv = self.stack[idx].clone();
                self.call_rooted(h, recv, args)?
            }
            h => {
                let mut recv = std::mem::take(&mut self.stack[idx]);
                let result = self.call_builtin(h, &mut recv, args, chunk.local_name(slot));
                self.stack[idx] = recv;
                result?
            }
        };
        self.push_result(result);
        Ok(())
    }

    /// `INVOKE_GLOBAL global name argc`: the receiver is written back to
    /// the global after a builtin runs.
    pub(crate) fn op_invoke_global(
        &mut self,
        chunk: &Arc<Chunk>,
        offset: usize,
        global: &str,
        method: &str,
        argc: usize,
    ) -> Result<(), VmError> {
        let args = self.pop_n(argc)?;
        let mut recv = self
            .env
            .get(global)
            .cloned()
            .ok_or_else(|| VmError::UndefinedVariable(global.to_string()))?;
        let handler = self.resolve_handler(chunk, offset, recv.type_tag(), method);
        let result = match handler {
            NOT_BUILTIN => self.invoke_method(recv, method, args)?,
            h if h >= CALLBACK_BASE => self.call_rooted(h, recv, args)?,
            h => {
                let result = self.call_builtin(h, &mut recv, args, Some(global))?;
                self.env.assign(global, recv);
                result
            }
        };
        self.push_result(result);
        Ok(())
    }

    fn invoke_method(&mut self, recv: Value, method: &str, args: Vec<Value>) -> Result<Value, VmError> {
        self.with_rooted(recv, |vm, recv| vm.invoke_fallback(recv, method, args))
    }

    fn invoke_fallback(&mut self, recv: Value, method: &str, mut args: Vec<Value>) -> Result<Value, VmError> {
        let field = match &recv.data {
            Data::Struct(s) => s.get(method).cloned(),
            Data::Map(m) => m.get(method).cloned(),
            _ => None,
        };
        if let Some(f) = field.filter(|f| f.as_closure().is_some()) {
            let wants_self = matches!(recv.data, Data::Struct(_))
                && f.as_closure().map(|c| c.arity()) == Some(args.len() + 1);
            if wants_self {
                args.insert(0, recv);
            }
            return self.call_closure(&f, args);
        }

        let type_name = match &recv.data {
            Data::Struct(s) => s.name.clone(),
            Data::Enum(e) => e.enum_name.clone(),
            _ => recv.type_name().to_string(),
        };
        let qualified = format!("{type_name}::{method}");
        match self.env.get(&qualified).cloned() {
            Some(f) if f.as_closure().is_some() => {
                args.insert(0, recv);
                self.call_closure(&f, args)
            }
            _ => Ok(Value::nil()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::pic::PicStats;
    use lattice_core::{ChunkBuilder, OpCode};

    fn vm() -> Vm {
        Vm::with_config(VmConfig::default())
    }

    #[test]
    fn invoke_local_push_mutates_the_local() {
        let mut b = ChunkBuilder::script();
        b.local(1, "xs");
        b.int(1);
        b.int(2);
        b.op_u8(OpCode::BuildArray, 2);
        b.int(3);
        b.invoke_local(1, "push", 1);
        b.op(OpCode::Pop);
        b.get_local(1);
        b.invoke("len", 0);
        b.ret();
        assert_eq!(vm().run(b.build().unwrap()).unwrap(), Value::int(3));
    }

    #[test]
    fn repeated_call_site_hits_the_cache() {
        let mut b = ChunkBuilder::script();
        b.string("abc");
        b.define_global("s");
        b.invoke_global("s", "len", 0);
        b.ret();
        let chunk = Arc::new(b.build().unwrap());
        let mut vm = vm();
        assert_eq!(vm.run_arc(Arc::clone(&chunk)).unwrap(), Value::int(3));
        assert_eq!(vm.run_arc(chunk).unwrap(), Value::int(3));
        assert_eq!(vm.pic_stats(), PicStats { hits: 1, misses: 1 });
    }

    #[test]
    fn struct_field_closure_gets_self_when_arity_allows() {
        let mut get_x = ChunkBuilder::function("get_x", &["self"]);
        get_x.get_local(1);
        get_x.named(OpCode::GetField, "x");
        get_x.ret();

        let mut b = ChunkBuilder::script();
        b.int(7);
        b.closure(get_x.build().unwrap(), &[]);
        b.build_struct("Point", &["x", "get"]);
        b.invoke("get", 0);
        b.ret();
        assert_eq!(vm().run(b.build().unwrap()).unwrap(), Value::int(7));
    }

    #[test]
    fn unknown_method_falls_back_to_type_function_then_nil() {
        let mut describe = ChunkBuilder::function("Int::describe", &["self"]);
        describe.string("an int");
        describe.ret();

        let mut b = ChunkBuilder::script();
        b.closure(describe.build().unwrap(), &[]);
        b.define_global("Int::describe");
        b.int(1);
        b.invoke("describe", 0);
        b.op(OpCode::Pop);
        b.int(1);
        b.invoke("missing", 0);
        b.ret();
        assert_eq!(vm().run(b.build().unwrap()).unwrap(), Value::nil());
    }
}
