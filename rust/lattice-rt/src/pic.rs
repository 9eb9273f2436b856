//! Polymorphic inline cache for method dispatch.
//!
//! One lazily-allocated table per chunk, direct-mapped by instruction
//! offset into 64 slots. Each slot holds up to 4 entries keyed by
//! (receiver type tag, djb2 hash of the method name) with FIFO eviction.

use lattice_core::Chunk;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

pub const PIC_SLOTS: usize = 64;
pub const PIC_WAYS: usize = 4;
/// Cached "not a builtin" result: skip straight to field/impl lookup.
pub const NOT_BUILTIN: u8 = 255;

/// djb2 string hash.
pub fn djb2(s: &str) -> u32 {
    s.bytes()
        .fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(b as u32))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PicEntry {
    type_tag: u8,
    method_hash: u32,
    handler: u8,
}

#[derive(Debug, Clone, Copy, Default)]
struct PicSlot {
    entries: [PicEntry; PIC_WAYS],
    len: u8,
    /// Next entry to evict once full.
    next: u8,
}

impl PicSlot {
    fn lookup(&self, type_tag: u8, method_hash: u32) -> Option<u8> {
        self.entries[..self.len as usize]
            .iter()
            .find(|e| e.type_tag == type_tag && e.method_hash == method_hash)
            .map(|e| e.handler)
    }

    fn update(&mut self, type_tag: u8, method_hash: u32, handler: u8) {
        let live = &mut self.entries[..self.len as usize];
        if let Some(e) = live
            .iter_mut()
            .find(|e| e.type_tag == type_tag && e.method_hash == method_hash)
        {
            e.handler = handler;
            return;
        }
        let entry = PicEntry {
            type_tag,
            method_hash,
            handler,
        };
        if (self.len as usize) < PIC_WAYS {
            self.entries[self.len as usize] = entry;
            self.len += 1;
        } else {
            self.entries[self.next as usize] = entry;
            self.next = (self.next + 1) % PIC_WAYS as u8;
        }
    }
}

#[derive(Debug, Clone)]
pub struct PicTable {
    slots: Vec<PicSlot>,
}

impl Default for PicTable {
    fn default() -> Self {
        Self {
            slots: vec![PicSlot::default(); PIC_SLOTS],
        }
    }
}

impl PicTable {
    pub fn lookup(&self, offset: usize, type_tag: u8, method_hash: u32) -> Option<u8> {
        self.slots[offset % PIC_SLOTS].lookup(type_tag, method_hash)
    }

    pub fn update(&mut self, offset: usize, type_tag: u8, method_hash: u32, handler: u8) {
        self.slots[offset % PIC_SLOTS].update(type_tag, method_hash, handler);
    }

    /// Number of cached entries in the slot for `offset`.
    pub fn slot_len(&self, offset: usize) -> usize {
        self.slots[offset % PIC_SLOTS].len as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PicStats {
    pub hits: u64,
    pub misses: u64,
}

/// Per-chunk tables, keyed by chunk address. Each table holds a weak
/// handle to its chunk; a table whose chunk has been dropped is stale and
/// never answers for a new chunk allocated at the same address.
#[derive(Debug, Default)]
pub struct PicCache {
    tables: HashMap<usize, (Weak<Chunk>, PicTable)>,
    stats: PicStats,
}

impl PicCache {
    fn key(chunk: &Arc<Chunk>) -> usize {
        Arc::as_ptr(chunk) as usize
    }

    pub fn lookup(
        &mut self,
        chunk: &Arc<Chunk>,
        offset: usize,
        type_tag: u8,
        method_hash: u32,
    ) -> Option<u8> {
        let hit = self
            .table(chunk)
            .and_then(|t| t.lookup(offset, type_tag, method_hash));
        match hit {
            Some(_) => self.stats.hits += 1,
            None => self.stats.misses += 1,
        }
        hit
    }

    pub fn update(
        &mut self,
        chunk: &Arc<Chunk>,
        offset: usize,
        type_tag: u8,
        method_hash: u32,
        handler: u8,
    ) {
        let key = Self::key(chunk);
        let live = self
            .tables
            .get(&key)
            .is_some_and(|(owner, _)| owner.strong_count() > 0);
        if !live {
            self.tables.retain(|_, (owner, _)| owner.strong_count() > 0);
            self.tables
                .insert(key, (Arc::downgrade(chunk), PicTable::default()));
        }
        if let Some((_, table)) = self.tables.get_mut(&key) {
            table.update(offset, type_tag, method_hash, handler);
        }
    }

    pub fn table(&self, chunk: &Arc<Chunk>) -> Option<&PicTable> {
        self.tables
            .get(&Self::key(chunk))
            .filter(|(owner, _)| owner.strong_count() > 0)
            .map(|(_, table)| table)
    }

    /// Number of tables held, stale ones included until the next insert.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn stats(&self) -> PicStats {
        self.stats
    }
}
