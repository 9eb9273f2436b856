//! Collection driver for the dual heap.

use super::Vm;
use crate::heap::{GcStats, Marker};

impl Vm {
    /// Run a cycle when the fluid heap has crossed its threshold.
    pub(crate) fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Mark from every root, sweep the fluid ledger and drop unreachable
    /// crystal regions. Returns the number of fluid allocations freed.
    pub(crate) fn collect_garbage(&mut self) -> usize {
        let mut marker = Marker::new(&mut self.heap);
        for v in &self.stack {
            marker.mark_value(v);
        }
        for v in self.env.values() {
            marker.mark_value(v);
        }
        for frame in &self.frames {
            for uv in frame.upvalues.iter() {
                marker.mark_upvalue(uv);
            }
        }
        for (_, uv) in &self.open_upvalues {
            marker.mark_upvalue(uv);
        }
        for v in self.phases.roots() {
            marker.mark_value(v);
        }
        for v in &self.shadow_roots {
            marker.mark_value(v);
        }
        let reachable = marker.finish();

        let (freed, bytes) = self.heap.sweep();
        let regions = self.regions.collect(&reachable);
        tracing::debug!(
            freed,
            bytes,
            regions_freed = regions,
            live = self.heap.live_allocations(),
            threshold = self.heap.threshold(),
            "gc cycle"
        );
        freed
    }

    pub fn gc_stats(&self) -> GcStats {
        GcStats {
            live_allocations: self.heap.live_allocations(),
            live_bytes: self.heap.live_bytes(),
            peak_bytes: self.heap.peak_bytes(),
            regions: self.regions.len(),
            cycles: self.heap.cycles(),
            freed_total: self.heap.freed_total(),
            regions_collected: self.regions.collected(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::values::Value;
    use lattice_core::{ChunkBuilder, OpCode, VarLocation};

    fn vm() -> Vm {
        Vm::with_config(VmConfig::default())
    }

    #[test]
    fn unreachable_fluid_arrays_are_swept() {
        let mut vm = vm();
        let mut b = ChunkBuilder::script();
        b.int(1);
        b.op_u8(OpCode::BuildArray, 1);
        b.op(OpCode::Pop);
        b.int(2);
        b.op_u8(OpCode::BuildArray, 1);
        b.define_global("kept");
        b.op(OpCode::Unit);
        b.ret();
        vm.run(b.build().unwrap()).unwrap();
        assert_eq!(vm.gc_stats().live_allocations, 2);
        assert_eq!(vm.collect_garbage(), 1);
        let stats = vm.gc_stats();
        assert_eq!(stats.live_allocations, 1);
        assert_eq!(stats.cycles, 1);
    }

    #[test]
    fn dropped_crystal_region_is_collected() {
        let mut vm = vm();
        let mut b = ChunkBuilder::script();
        b.int(1);
        b.op_u8(OpCode::BuildArray, 1);
        b.define_global("xs");
        b.get_global("xs");
        b.phase_var(OpCode::FreezeVar, "xs", VarLocation::Global, 0, false);
        b.op(OpCode::Pop);
        b.op(OpCode::Unit);
        b.ret();
        vm.run(b.build().unwrap()).unwrap();
        assert_eq!(vm.gc_stats().regions, 1);
        vm.collect_garbage();
        assert_eq!(vm.gc_stats().regions, 1);

        vm.define_global("xs", Value::nil());
        vm.collect_garbage();
        let stats = vm.gc_stats();
        assert_eq!(stats.regions, 0);
        assert_eq!(stats.regions_collected, 1);
    }
}
