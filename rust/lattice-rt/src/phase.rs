//! Phase registry: reactions, bonds, seeds, pressures, and tracking.
//!
//! Pure bookkeeping keyed by variable name. The VM drives the freeze/thaw
//! cascade and invokes callbacks; see `vm::phase`.

use crate::values::{Phase, Value};
use std::collections::HashMap;
use std::str::FromStr;
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum BondStrategy {
    /// Freeze the dependent along with the target.
    Mirror,
    /// Thaw the dependent when the target freezes.
    Inverse,
    /// Require the dependent to be crystal before the target may freeze.
    Gate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum PressureMode {
    NoGrow,
    NoShrink,
    NoResize,
    ReadHeavy,
}

impl PressureMode {
    pub fn blocks_growth(self) -> bool {
        matches!(self, PressureMode::NoGrow | PressureMode::NoResize)
    }

    pub fn blocks_shrink(self) -> bool {
        matches!(self, PressureMode::NoShrink | PressureMode::NoResize)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondEntry {
    pub dependent: String,
    pub strategy: BondStrategy,
}

/// One entry of a tracked variable's history.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub phase: Phase,
    pub value: Value,
    pub line: u32,
    pub function: String,
}

#[derive(Debug, Default)]
pub struct PhaseRegistry {
    reactions: HashMap<String, Vec<Value>>,
    bonds: HashMap<String, Vec<BondEntry>>,
    seeds: HashMap<String, Vec<Value>>,
    pressures: HashMap<String, PressureMode>,
    tracked: HashMap<String, Vec<Snapshot>>,
}

impl PhaseRegistry {
    // ---- reactions ----

    pub fn add_reaction(&mut self, name: &str, callback: Value) {
        self.reactions
            .entry(name.to_string())
            .or_default()
            .push(callback);
    }

    pub fn remove_reactions(&mut self, name: &str) {
        self.reactions.remove(name);
    }

    pub fn reactions(&self, name: &str) -> Vec<Value> {
        self.reactions.get(name).cloned().unwrap_or_default()
    }

    // ---- bonds ----

    pub fn add_bond(&mut self, target: &str, dependent: &str, strategy: BondStrategy) {
        self.bonds
            .entry(target.to_string())
            .or_default()
            .push(BondEntry {
                dependent: dependent.to_string(),
                strategy,
            });
    }

    /// Remove one dependent from `target`'s bond, dropping the bond when
    /// it becomes empty.
    pub fn remove_bond(&mut self, target: &str, dependent: &str) {
        if let Some(entries) = self.bonds.get_mut(target) {
            entries.retain(|e| e.dependent != dependent);
            if entries.is_empty() {
                self.bonds.remove(target);
            }
        }
    }

    pub fn bonds(&self, target: &str) -> Vec<BondEntry> {
        self.bonds.get(target).cloned().unwrap_or_default()
    }

    pub fn has_bond(&self, target: &str) -> bool {
        self.bonds.contains_key(target)
    }

    /// Detach the bond on `target` for a cascade.
    pub fn take_bond(&mut self, target: &str) -> Option<Vec<BondEntry>> {
        self.bonds.remove(target)
    }

    /// Put back a bond detached by [`PhaseRegistry::take_bond`] after a
    /// failed cascade. Entries added meanwhile stay after the restored ones.
    pub fn restore_bond(&mut self, target: &str, mut entries: Vec<BondEntry>) {
        if let Some(added) = self.bonds.remove(target) {
            entries.extend(added);
        }
        if !entries.is_empty() {
            self.bonds.insert(target.to_string(), entries);
        }
    }

    // ---- seeds ----

    pub fn add_seed(&mut self, name: &str, contract: Value) {
        self.seeds.entry(name.to_string()).or_default().push(contract);
    }

    pub fn remove_seeds(&mut self, name: &str) {
        self.seeds.remove(name);
    }

    pub fn seeds(&self, name: &str) -> Vec<Value> {
        self.seeds.get(name).cloned().unwrap_or_default()
    }

    // ---- pressures ----

    pub fn set_pressure(&mut self, name: &str, mode: PressureMode) {
        self.pressures.insert(name.to_string(), mode);
    }

    pub fn clear_pressure(&mut self, name: &str) {
        self.pressures.remove(name);
    }

    pub fn pressure(&self, name: &str) -> Option<PressureMode> {
        self.pressures.get(name).copied()
    }

    // ---- tracking ----

    pub fn track(&mut self, name: &str) {
        self.tracked.entry(name.to_string()).or_default();
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        !self.tracked.is_empty() && self.tracked.contains_key(name)
    }

    pub fn record(&mut self, name: &str, snapshot: Snapshot) {
        if let Some(history) = self.tracked.get_mut(name) {
            history.push(snapshot);
        }
    }

    pub fn history(&self, name: &str) -> &[Snapshot] {
        self.tracked.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every value the registry keeps alive, for GC root marking.
    pub fn roots(&self) -> impl Iterator<Item = &Value> {
        self.reactions
            .values()
            .chain(self.seeds.values())
            .flatten()
            .chain(self.tracked.values().flatten().map(|s| &s.value))
    }
}

impl BondStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        Self::from_str(s).ok()
    }
}

impl PressureMode {
    pub fn parse(s: &str) -> Option<Self> {
        Self::from_str(s).ok()
    }
}
