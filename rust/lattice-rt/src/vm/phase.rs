//! Phase transitions on named variables.
//!
//! `FREEZE_VAR`, `THAW_VAR` and `SUBLIMATE_VAR` run in a fixed order:
//! seed contracts, the transition itself, the bond cascade (freeze only),
//! write-back to the variable's storage, history, then reactions. A failure
//! before write-back leaves the variable's phase as it was.

use super::{Vm, VmError};
use crate::natives::{expect_args, int_arg, str_arg, NativeContext, NativeFn};
use crate::phase::{BondEntry, BondStrategy, PressureMode, Snapshot};
use crate::values::{Home, Phase, Value};
use lattice_core::{OpCode, VarLocation};
use std::collections::BTreeMap;

/// Where a variable found by name lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VarRef {
    /// Absolute operand stack index of a live local.
    Slot(usize),
    Global,
}

impl Vm {
    // ------------------------------------------------------------------
    // Value transitions
    // ------------------------------------------------------------------

    /// Crystal deep copy placed in a fresh region.
    pub(crate) fn freeze_value(&mut self, v: Value) -> Result<Value, VmError> {
        if v.is_channel() {
            return Err(VmError::Phase("cannot freeze a channel".into()));
        }
        let home = if v.is_heap_backed() {
            Home::Region(self.regions.create())
        } else {
            Home::None
        };
        Ok(v.deep_with_phase(Phase::Crystal, home))
    }

    /// Fluid deep copy registered in the fluid heap.
    pub(crate) fn thaw_value(&mut self, v: &Value) -> Value {
        let mut thawed = v.deep_with_phase(Phase::Fluid, Home::None);
        self.register(&mut thawed);
        thawed
    }

    // ------------------------------------------------------------------
    // Variable lookup by name
    // ------------------------------------------------------------------

    /// Innermost live local named `name`, else a global. A frame's locals
    /// end where the next frame's window begins.
    pub(crate) fn find_var(&self, name: &str) -> Option<VarRef> {
        for (i, frame) in self.frames.iter().enumerate().rev() {
            let limit = self
                .frames
                .get(i + 1)
                .map(|next| next.base)
                .unwrap_or(self.stack.len());
            let found = frame
                .chunk
                .local_names
                .iter()
                .enumerate()
                .rev()
                .find(|(slot, n)| n.as_deref() == Some(name) && frame.base + slot < limit);
            if let Some((slot, _)) = found {
                return Some(VarRef::Slot(frame.base + slot));
            }
        }
        self.env.contains(name).then_some(VarRef::Global)
    }

    pub(crate) fn read_var(&self, name: &str, at: VarRef) -> Value {
        match at {
            VarRef::Slot(idx) => self.stack.get(idx).cloned().unwrap_or_default(),
            VarRef::Global => self.env.get(name).cloned().unwrap_or_default(),
        }
    }

    pub(crate) fn write_var(&mut self, name: &str, at: VarRef, value: Value) {
        match at {
            VarRef::Slot(idx) => {
                if let Some(slot) = self.stack.get_mut(idx) {
                    *slot = value;
                }
            }
            VarRef::Global => {
                self.env.assign(name, value);
            }
        }
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    fn record_history(&mut self, name: &str, value: &Value) {
        if !self.phases.is_tracked(name) {
            return;
        }
        let snapshot = Snapshot {
            phase: value.phase,
            value: value.deep_clone(),
            line: self.current_line(),
            function: self.current_function(),
        };
        self.phases.record(name, snapshot);
    }

    /// History hook for `SET_LOCAL`.
    pub(crate) fn note_write(&mut self, name: &str, idx: usize) {
        if self.phases.is_tracked(name) {
            if let Some(v) = self.stack.get(idx).cloned() {
                self.record_history(name, &v);
            }
        }
    }

    /// History hook for `SET_GLOBAL` and `DEFINE_GLOBAL`.
    pub(crate) fn note_global_write(&mut self, name: &str, value: &Value) {
        self.record_history(name, value);
    }

    // ------------------------------------------------------------------
    // Seeds and reactions
    // ------------------------------------------------------------------

    fn validate_seeds(
        &mut self,
        name: &str,
        value: &Value,
        consume: bool,
        context: &str,
    ) -> Result<(), VmError> {
        let contracts = self.phases.seeds(name);
        for contract in &contracts {
            let verdict = self
                .call_closure(contract, vec![value.deep_clone()])
                .map_err(|e| {
                    VmError::Phase(format!("{context}seed contract failed: {}", e.message()))
                })?;
            if !verdict.is_truthy() {
                return Err(VmError::Phase(format!("{context}seed contract returned false")));
            }
        }
        if consume && !contracts.is_empty() {
            self.phases.remove_seeds(name);
        }
        Ok(())
    }

    fn fire_reactions(&mut self, name: &str, phase: Phase, value: &Value) -> Result<(), VmError> {
        for callback in self.phases.reactions(name) {
            self.call_closure(&callback, vec![Value::string(phase.as_str()), value.clone()])
                .map_err(|e| VmError::Phase(format!("reaction error: {}", e.message())))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cascade
    // ------------------------------------------------------------------

    /// Fire and consume the bond on `target`. Entries from the failing one
    /// onward stay registered.
    fn cascade(&mut self, target: &str) -> Result<(), VmError> {
        let Some(entries) = self.phases.take_bond(target) else {
            return Ok(());
        };
        for (i, entry) in entries.iter().enumerate() {
            if let Err(err) = self.cascade_entry(target, entry) {
                self.phases.restore_bond(target, entries[i..].to_vec());
                return Err(err);
            }
        }
        Ok(())
    }

    fn cascade_entry(&mut self, target: &str, entry: &BondEntry) -> Result<(), VmError> {
        let dep = entry.dependent.as_str();
        let Some(at) = self.find_var(dep) else {
            tracing::trace!(target, dep, "bond dependent no longer defined");
            return Ok(());
        };
        let current = self.read_var(dep, at);
        if current.is_channel() {
            return Ok(());
        }
        match entry.strategy {
            BondStrategy::Mirror => {
                if current.is_crystal() {
                    return Ok(());
                }
                let frozen = self.freeze_value(current)?;
                tracing::debug!(target, dep, "mirror bond freezes dependent");
                self.write_var(dep, at, frozen.clone());
                self.record_history(dep, &frozen);
                self.fire_reactions(dep, Phase::Crystal, &frozen)?;
                self.cascade(dep)
            }
            BondStrategy::Inverse => {
                if !matches!(current.phase, Phase::Crystal | Phase::Sublimated) {
                    return Ok(());
                }
                let thawed = self.thaw_value(&current);
                tracing::debug!(target, dep, "inverse bond thaws dependent");
                self.write_var(dep, at, thawed.clone());
                self.record_history(dep, &thawed);
                self.fire_reactions(dep, Phase::Fluid, &thawed)
            }
            BondStrategy::Gate => {
                if current.is_crystal() {
                    Ok(())
                } else {
                    Err(VmError::Phase(format!(
                        "gate bond: '{dep}' must be crystal before '{target}' can freeze"
                    )))
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------

    /// `FREEZE_VAR` / `THAW_VAR` / `SUBLIMATE_VAR`: the variable's current
    /// value is on the stack; the transitioned value replaces it.
    pub(crate) fn op_phase_var(
        &mut self,
        op: OpCode,
        name: &str,
        location: u8,
        slot: usize,
    ) -> Result<(), VmError> {
        let (location, consume) = VarLocation::decode(location).ok_or_else(|| {
            VmError::Runtime(format!("invalid variable location {location:#04x}"))
        })?;
        let value = self.pop()?;
        self.validate_seeds(name, &value, consume, "")?;
        let (result, phase) = match op {
            OpCode::FreezeVar => (self.freeze_value(value)?, Phase::Crystal),
            OpCode::ThawVar => (self.thaw_value(&value), Phase::Fluid),
            _ => (value.with_phase(Phase::Sublimated), Phase::Sublimated),
        };
        self.with_rooted(result, |vm, result| {
            if phase == Phase::Crystal {
                vm.cascade(name)?;
            }
            match location {
                VarLocation::Local => {
                    let idx = vm.local_index(slot)?;
                    vm.stack[idx] = result.clone();
                }
                VarLocation::Upvalue => vm.write_upvalue(slot, result.clone())?,
                VarLocation::Global => {
                    if !vm.env.assign(name, result.clone()) {
                        vm.env.define(name, result.clone());
                    }
                }
            }
            vm.record_history(name, &result);
            vm.fire_reactions(name, phase, &result)?;
            Ok(result)
        })
        .map(|result| self.push(result))
    }

    /// `BOND target`: pops the strategy, then the dependent's name.
    pub(crate) fn op_bond(&mut self, target: &str) -> Result<(), VmError> {
        let strategy = self.pop()?;
        let dependent = self.pop()?;
        let strategy = match strategy.as_str() {
            Some(s) => BondStrategy::parse(s)
                .ok_or_else(|| VmError::Phase(format!("bond: unknown strategy '{s}'")))?,
            None => BondStrategy::Mirror,
        };
        let Some(dep) = dependent.as_str() else {
            return Err(VmError::Type(format!(
                "bond: dependent must be a variable name, got {}",
                dependent.type_name()
            )));
        };
        if let Some(at) = self.find_var(target) {
            if self.read_var(target, at).is_crystal() {
                return Err(VmError::Phase(format!(
                    "bond: variable '{target}' is already frozen"
                )));
            }
        }
        if self.find_var(dep).is_none() {
            return Err(VmError::Phase(format!("bond: undefined variable '{dep}'")));
        }
        self.phases.add_bond(target, dep, strategy);
        self.push(Value::unit());
        Ok(())
    }

    /// `REACT name`: pops the callback; non-closures are ignored.
    pub(crate) fn op_react(&mut self, name: &str) -> Result<(), VmError> {
        let callback = self.pop()?;
        if callback.as_closure().is_some() {
            self.phases.add_reaction(name, callback);
        }
        self.push(Value::unit());
        Ok(())
    }

    /// `SEED name`: pops the contract; non-closures are ignored.
    pub(crate) fn op_seed(&mut self, name: &str) -> Result<(), VmError> {
        let contract = self.pop()?;
        if contract.as_closure().is_some() {
            self.phases.add_seed(name, contract);
        }
        self.push(Value::unit());
        Ok(())
    }

    /// `grow(name)`: consume the seeds, then freeze the variable in place.
    fn grow(&mut self, name: &str) -> Result<Value, VmError> {
        let at = self
            .find_var(name)
            .ok_or_else(|| VmError::UndefinedVariable(name.to_string()))?;
        let current = self.read_var(name, at);
        self.validate_seeds(name, &current, true, "grow() ")?;
        let frozen = self.freeze_value(current)?;
        self.with_rooted(frozen, |vm, frozen| {
            vm.cascade(name)?;
            vm.write_var(name, at, frozen.clone());
            vm.record_history(name, &frozen);
            vm.fire_reactions(name, Phase::Crystal, &frozen)?;
            Ok(frozen)
        })
    }
}

// ---------------------------------------------------------------------------
// Natives
// ---------------------------------------------------------------------------

pub(crate) fn phase_natives() -> Vec<(&'static str, NativeFn)> {
    vec![
        ("track", native_track),
        ("phases", native_phases),
        ("history", native_history),
        ("rewind", native_rewind),
        ("pressurize", native_pressurize),
        ("depressurize", native_depressurize),
        ("pressure_of", native_pressure_of),
        ("grow", native_grow),
    ]
}

fn native_track(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("track", args, 1)?;
    let name = str_arg("track", args, 0)?;
    let vm = &mut *ctx.vm;
    vm.phases.track(name);
    if let Some(at) = vm.find_var(name) {
        let current = vm.read_var(name, at);
        vm.record_history(name, &current);
    }
    Ok(Value::unit())
}

fn native_phases(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("phases", args, 1)?;
    let name = str_arg("phases", args, 0)?;
    Ok(Value::array(
        ctx.vm
            .phases
            .history(name)
            .iter()
            .map(|s| Value::string(s.phase.as_str()))
            .collect(),
    ))
}

fn native_history(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("history", args, 1)?;
    let name = str_arg("history", args, 0)?;
    let entries = ctx
        .vm
        .phases
        .history(name)
        .iter()
        .map(|s| {
            let mut m = BTreeMap::new();
            m.insert("phase".to_string(), Value::string(s.phase.as_str()));
            m.insert("value".to_string(), s.value.clone());
            m.insert("line".to_string(), Value::int(s.line as i64));
            m.insert("fn".to_string(), Value::string(s.function.as_str()));
            Value::map(m)
        })
        .collect();
    Ok(Value::array(entries))
}

fn native_rewind(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("rewind", args, 2)?;
    let name = str_arg("rewind", args, 0)?;
    let steps = int_arg("rewind", args, 1)?;
    let history = ctx.vm.phases.history(name);
    let value = usize::try_from(steps)
        .ok()
        .and_then(|n| history.len().checked_sub(n + 1))
        .map(|i| history[i].value.clone());
    Ok(value.unwrap_or_default())
}

fn native_pressurize(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("pressurize", args, 2)?;
    let name = str_arg("pressurize", args, 0)?;
    let mode = str_arg("pressurize", args, 1)?;
    let mode = PressureMode::parse(mode).ok_or_else(|| {
        format!(
            "pressurize: invalid mode '{mode}' (expected no_grow, no_shrink, no_resize, read_heavy)"
        )
    })?;
    ctx.vm.phases.set_pressure(name, mode);
    Ok(Value::unit())
}

fn native_depressurize(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("depressurize", args, 1)?;
    ctx.vm.phases.clear_pressure(str_arg("depressurize", args, 0)?);
    Ok(Value::unit())
}

fn native_pressure_of(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("pressure_of", args, 1)?;
    let name = str_arg("pressure_of", args, 0)?;
    Ok(match ctx.vm.phases.pressure(name) {
        Some(mode) => Value::string(mode.as_ref()),
        None => Value::nil(),
    })
}

fn native_grow(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("grow", args, 1)?;
    let name = str_arg("grow", args, 0)?;
    ctx.vm.grow(name).map_err(|e| e.message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use lattice_core::{Chunk, ChunkBuilder};

    fn vm() -> Vm {
        Vm::with_config(VmConfig::default())
    }

    fn globals(b: &mut ChunkBuilder, names: &[(&str, i64)]) {
        for (name, v) in names {
            b.int(*v);
            b.define_global(name);
        }
    }

    fn freeze_global(b: &mut ChunkBuilder, name: &str) {
        b.get_global(name);
        b.phase_var(OpCode::FreezeVar, name, VarLocation::Global, 0, false);
        b.op(OpCode::Pop);
    }

    fn bond(b: &mut ChunkBuilder, target: &str, dep: &str, strategy: &str) {
        b.string(dep);
        b.string(strategy);
        b.named(OpCode::Bond, target);
        b.op(OpCode::Pop);
    }

    fn constant_fn(name: &str, params: &[&str], result: OpCode) -> Chunk {
        let mut f = ChunkBuilder::function(name, params);
        f.op(result);
        f.ret();
        f.build().unwrap()
    }

    #[test]
    fn mirror_bond_freezes_dependent_once() {
        let mut b = ChunkBuilder::script();
        globals(&mut b, &[("a", 1), ("b", 2)]);
        bond(&mut b, "a", "b", "mirror");
        freeze_global(&mut b, "a");
        b.op(OpCode::Unit);
        b.ret();
        let mut vm = vm();
        vm.run(b.build().unwrap()).unwrap();
        assert_eq!(vm.get_global("a").unwrap().phase, Phase::Crystal);
        assert_eq!(vm.get_global("b").unwrap().phase, Phase::Crystal);
        assert!(!vm.phases().has_bond("a"));
    }

    #[test]
    fn gate_failure_keeps_target_phase_and_bond() {
        let mut b = ChunkBuilder::script();
        globals(&mut b, &[("a", 1), ("b", 2)]);
        bond(&mut b, "a", "b", "gate");
        freeze_global(&mut b, "a");
        b.op(OpCode::Unit);
        b.ret();
        let mut vm = vm();
        let err = vm.run(b.build().unwrap()).unwrap_err();
        assert!(err.message_contains("gate bond: 'b' must be crystal before 'a' can freeze"));
        assert_eq!(vm.get_global("a").unwrap().phase, Phase::Unphased);
        assert!(vm.phases().has_bond("a"));
    }

    #[test]
    fn inverse_bond_thaws_crystal_dependent() {
        let mut b = ChunkBuilder::script();
        globals(&mut b, &[("a", 1), ("b", 2)]);
        freeze_global(&mut b, "b");
        bond(&mut b, "a", "b", "inverse");
        freeze_global(&mut b, "a");
        b.op(OpCode::Unit);
        b.ret();
        let mut vm = vm();
        vm.run(b.build().unwrap()).unwrap();
        assert_eq!(vm.get_global("b").unwrap().phase, Phase::Fluid);
    }

    #[test]
    fn falsy_seed_blocks_freeze() {
        let mut b = ChunkBuilder::script();
        globals(&mut b, &[("a", 1)]);
        b.closure(constant_fn("never", &["v"], OpCode::False), &[]);
        b.named(OpCode::Seed, "a");
        b.op(OpCode::Pop);
        freeze_global(&mut b, "a");
        b.op(OpCode::Unit);
        b.ret();
        let mut vm = vm();
        let err = vm.run(b.build().unwrap()).unwrap_err();
        assert!(err.message_contains("seed contract returned false"));
        assert_eq!(vm.get_global("a").unwrap().phase, Phase::Unphased);
        assert_eq!(vm.phases().seeds("a").len(), 1);
    }

    #[test]
    fn reactions_see_phase_name() {
        let mut on_change = ChunkBuilder::function("on_change", &["phase", "value"]);
        on_change.get_local(1);
        on_change.set_global("seen");
        on_change.ret();

        let mut b = ChunkBuilder::script();
        b.op(OpCode::Nil);
        b.define_global("seen");
        globals(&mut b, &[("a", 1)]);
        b.closure(on_change.build().unwrap(), &[]);
        b.named(OpCode::React, "a");
        b.op(OpCode::Pop);
        freeze_global(&mut b, "a");
        b.get_global("seen");
        b.ret();
        assert_eq!(vm().run(b.build().unwrap()).unwrap(), Value::string("crystal"));
    }

    #[test]
    fn tracked_local_records_each_transition() {
        let mut b = ChunkBuilder::script();
        b.local(1, "x");
        b.int(5);
        b.get_global("track");
        b.string("x");
        b.call(1);
        b.op(OpCode::Pop);
        b.get_local(1);
        b.phase_var(OpCode::FreezeVar, "x", VarLocation::Local, 1, false);
        b.op(OpCode::Pop);
        b.get_local(1);
        b.phase_var(OpCode::ThawVar, "x", VarLocation::Local, 1, false);
        b.op(OpCode::Pop);
        b.get_global("phases");
        b.string("x");
        b.call(1);
        b.ret();
        let phases = vm().run(b.build().unwrap()).unwrap();
        assert_eq!(
            phases,
            Value::array(vec![
                Value::string("unphased"),
                Value::string("crystal"),
                Value::string("fluid"),
            ])
        );
    }

    #[test]
    fn grow_consumes_seeds() {
        let mut b = ChunkBuilder::script();
        globals(&mut b, &[("a", 1)]);
        b.closure(constant_fn("always", &["v"], OpCode::True), &[]);
        b.named(OpCode::Seed, "a");
        b.op(OpCode::Pop);
        b.get_global("grow");
        b.string("a");
        b.call(1);
        b.ret();
        let mut vm = vm();
        let grown = vm.run(b.build().unwrap()).unwrap();
        assert!(grown.is_crystal());
        assert!(vm.phases().seeds("a").is_empty());
    }

    #[test]
    fn bond_rejects_frozen_target_and_unknown_strategy() {
        let mut b = ChunkBuilder::script();
        globals(&mut b, &[("a", 1), ("b", 2)]);
        bond(&mut b, "a", "b", "sideways");
        b.ret();
        let err = vm().run(b.build().unwrap()).unwrap_err();
        assert!(err.message_contains("bond: unknown strategy 'sideways'"));

        let mut b = ChunkBuilder::script();
        globals(&mut b, &[("a", 1), ("b", 2)]);
        freeze_global(&mut b, "a");
        bond(&mut b, "a", "b", "mirror");
        b.ret();
        let err = vm().run(b.build().unwrap()).unwrap_err();
        assert!(err.message_contains("bond: variable 'a' is already frozen"));
    }

    #[test]
    fn pressurize_rejects_unknown_mode() {
        let mut b = ChunkBuilder::script();
        b.get_global("pressurize");
        b.string("xs");
        b.string("tight");
        b.call(2);
        b.ret();
        let err = vm().run(b.build().unwrap()).unwrap_err();
        assert!(err.message_contains(
            "pressurize: invalid mode 'tight' (expected no_grow, no_shrink, no_resize, read_heavy)"
        ));
    }
}
