//! Dual heap: the fluid mark-sweep ledger and the crystal region table.
//!
//! Storage is owned by the values themselves; the ledger records one
//! [`GcHeader`] per fluid allocation so that a cycle can tell which
//! allocations are still reachable and account live bytes. Crystal values
//! carry a region id instead and are reclaimed a region at a time.

use crate::gc::{GcHeader, TypeTag};
use crate::values::{AllocId, ClosureKind, Data, Home, RegionId, UpvalueCell, UpvalueRef, Value};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Snapshot reported by `Vm::gc_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub live_allocations: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub regions: usize,
    pub cycles: u64,
    pub freed_total: u64,
    pub regions_collected: u64,
}

// ---------------------------------------------------------------------------
// Fluid heap
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FluidHeap {
    headers: HashMap<AllocId, GcHeader>,
    next_id: AllocId,
    live_bytes: usize,
    peak_bytes: usize,
    threshold: usize,
    min_threshold: usize,
    growth_factor: usize,
    stress: bool,
    cycles: u64,
    freed_total: u64,
}

impl FluidHeap {
    pub fn new(threshold: usize, growth_factor: usize, stress: bool) -> Self {
        Self {
            headers: HashMap::new(),
            next_id: 1,
            live_bytes: 0,
            peak_bytes: 0,
            threshold,
            min_threshold: threshold,
            growth_factor: growth_factor.max(1),
            stress,
            cycles: 0,
            freed_total: 0,
        }
    }

    /// Record a new allocation and return its ledger id.
    pub fn alloc(&mut self, tag: TypeTag, size: usize) -> AllocId {
        let id = self.next_id;
        self.next_id += 1;
        let header = GcHeader::new(tag, u32::try_from(size).unwrap_or(u32::MAX));
        self.live_bytes += header.total_size();
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);
        self.headers.insert(id, header);
        id
    }

    pub fn should_collect(&self) -> bool {
        self.stress || self.live_bytes >= self.threshold
    }

    pub fn contains(&self, id: AllocId) -> bool {
        self.headers.contains_key(&id)
    }

    pub fn is_marked(&self, id: AllocId) -> bool {
        self.headers.get(&id).is_some_and(GcHeader::is_marked)
    }

    pub fn unmark_all(&mut self) {
        for header in self.headers.values_mut() {
            header.unmark();
        }
    }

    /// Mark `id`; returns `true` if it was not yet marked.
    pub fn mark(&mut self, id: AllocId) -> bool {
        match self.headers.get_mut(&id) {
            Some(h) if !h.is_marked() => {
                h.mark();
                true
            }
            _ => false,
        }
    }

    /// Drop every unmarked entry. Returns `(count, bytes)` freed.
    pub fn sweep(&mut self) -> (usize, usize) {
        let mut freed = 0;
        let mut bytes = 0;
        self.headers.retain(|_, h| {
            if h.is_marked() {
                true
            } else {
                freed += 1;
                bytes += h.total_size();
                false
            }
        });
        self.live_bytes -= bytes;
        self.cycles += 1;
        self.freed_total += freed as u64;
        self.threshold = self
            .min_threshold
            .max(self.live_bytes.saturating_mul(self.growth_factor));
        (freed, bytes)
    }

    pub fn live_allocations(&self) -> usize {
        self.headers.len()
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn freed_total(&self) -> u64 {
        self.freed_total
    }
}

// ---------------------------------------------------------------------------
// Crystal regions
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RegionTable {
    live: HashSet<RegionId>,
    next_id: RegionId,
    epoch: u64,
    collected: u64,
}

impl RegionTable {
    pub fn create(&mut self) -> RegionId {
        self.next_id += 1;
        self.live.insert(self.next_id);
        self.next_id
    }

    /// Reclaim every region absent from `reachable`, then advance the epoch.
    pub fn collect(&mut self, reachable: &HashSet<RegionId>) -> usize {
        let before = self.live.len();
        self.live.retain(|id| reachable.contains(id));
        let freed = before - self.live.len();
        self.collected += freed as u64;
        self.epoch += 1;
        freed
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn contains(&self, id: RegionId) -> bool {
        self.live.contains(&id)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn collected(&self) -> u64 {
        self.collected
    }
}

// ---------------------------------------------------------------------------
// Marking
// ---------------------------------------------------------------------------

/// Shared cells discovered while scanning, traced after the current value.
enum Pending {
    Cell(Arc<Mutex<Value>>),
    Upvalue(UpvalueRef),
}

/// Worklist marker. Shared cells (refs, upvalue cells, closures) are
/// visited once per cycle, so cyclic graphs terminate.
pub struct Marker<'h> {
    heap: &'h mut FluidHeap,
    regions: HashSet<RegionId>,
    visited: HashSet<usize>,
    pending: Vec<Pending>,
}

impl<'h> Marker<'h> {
    pub fn new(heap: &'h mut FluidHeap) -> Self {
        heap.unmark_all();
        Self {
            heap,
            regions: HashSet::new(),
            visited: HashSet::new(),
            pending: Vec::new(),
        }
    }

    pub fn mark_value(&mut self, root: &Value) {
        self.scan(root);
        self.drain();
    }

    pub fn mark_upvalue(&mut self, uv: &UpvalueRef) {
        if self.visited.insert(uv.addr()) {
            self.pending.push(Pending::Upvalue(uv.clone()));
        }
        self.drain();
    }

    /// Region ids reached so far.
    pub fn finish(self) -> HashSet<RegionId> {
        self.regions
    }

    fn drain(&mut self) {
        while let Some(next) = self.pending.pop() {
            match next {
                Pending::Cell(cell) => {
                    let guard = cell.lock();
                    self.scan(&guard);
                }
                Pending::Upvalue(uv) => {
                    let guard = uv.cell().lock();
                    if let UpvalueCell::Closed(v) = &*guard {
                        self.scan(v);
                    }
                }
            }
        }
    }

    fn scan(&mut self, root: &Value) {
        let mut stack = vec![root];
        while let Some(v) = stack.pop() {
            match v.home {
                Home::Fluid(id) => {
                    self.heap.mark(id);
                }
                Home::Region(r) => {
                    self.regions.insert(r);
                }
                Home::None => {}
            }
            match &v.data {
                Data::Array(items) | Data::Tuple(items) => stack.extend(items.iter()),
                Data::Map(m) | Data::Set(m) => stack.extend(m.values()),
                Data::Struct(s) => stack.extend(s.fields.iter().map(|(_, f)| f)),
                Data::Enum(e) => stack.extend(e.payload.iter()),
                Data::Ref(cell) => {
                    if self.visited.insert(Arc::as_ptr(cell) as usize) {
                        self.pending.push(Pending::Cell(Arc::clone(cell)));
                    }
                }
                Data::Closure(c) => {
                    if !self.visited.insert(Arc::as_ptr(c) as usize) {
                        continue;
                    }
                    if let ClosureKind::Compiled { upvalues, .. } = &c.kind {
                        for uv in upvalues.iter() {
                            if self.visited.insert(uv.addr()) {
                                self.pending.push(Pending::Upvalue(uv.clone()));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
}
