//! Slabs and the page map.
//!
//! A slab is split in two. The `Slab` descriptor is immutable apart from
//! its atomic per-slot tags. It is shared through the page map so any CPU
//! can resolve an address to its slab without locks beyond a shard read.
//! `SlabState` holds the free-slot stack and `in_use` count. It lives
//! inside the owning node list and is only touched under that list's lock.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::cache::Cache;
use crate::cpu::{CpuId, NodeId};
use crate::page_source::order_bytes;
use crate::size_class::PAGE_SHIFT;

pub(crate) type CacheId = u64;

/// Slot sits on its slab's free stack.
const TAG_FREE: u8 = 0;
/// Slot is parked on a CPU list or remote queue.
const TAG_CACHED: u8 = 1;
/// Slot is held by a caller.
const TAG_LIVE: u8 = 2;

/// Owner value for objects that return straight to their node list.
pub(crate) const NODE_OWNED: CpuId = CpuId::MAX;

/// Where a slab handed to the allocation path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlabOrigin {
    /// Just formatted from fresh pages; the constructor has not run yet.
    Fresh,
    /// Taken from the partial set; objects were constructed before.
    Partial,
}

/// Immutable slab descriptor.
#[derive(Debug)]
pub(crate) struct Slab {
    pub(crate) base: usize,
    pub(crate) order: u32,
    pub(crate) node: NodeId,
    pub(crate) cache_id: CacheId,
    /// Owning cache, so a bare address resolves to its cache without a
    /// registry lookup.
    cache: Weak<Cache>,
    pub(crate) size: usize,
    pub(crate) objects: u32,
    /// Per-slot state tags. Empty when tag checking is off.
    tags: Box<[AtomicU8]>,
    /// CPU that allocated each slot, or `NODE_OWNED`.
    owners: Box<[AtomicU32]>,
}

impl Slab {
    pub(crate) fn new(
        base: usize,
        order: u32,
        node: NodeId,
        cache_id: CacheId,
        size: usize,
        objects: u32,
        tagged: bool,
    ) -> Self {
        let tag_count = if tagged { objects as usize } else { 0 };
        Self {
            base,
            order,
            node,
            cache_id,
            cache: Weak::new(),
            size,
            objects,
            tags: (0..tag_count).map(|_| AtomicU8::new(TAG_FREE)).collect(),
            owners: (0..objects).map(|_| AtomicU32::new(NODE_OWNED)).collect(),
        }
    }

    pub(crate) fn owned_by(mut self, cache: Weak<Cache>) -> Self {
        self.cache = cache;
        self
    }

    /// The owning cache, while it is alive.
    pub(crate) fn cache(&self) -> Option<Arc<Cache>> {
        self.cache.upgrade()
    }

    pub(crate) fn bytes(&self) -> usize {
        order_bytes(self.order)
    }

    /// Slot index of an object start address. Interior pointers and
    /// addresses in the slab's tail waste yield `None`.
    pub(crate) fn slot_of(&self, addr: usize) -> Option<u32> {
        let offset = addr.checked_sub(self.base)?;
        if offset % self.size != 0 {
            return None;
        }
        let slot = offset / self.size;
        (slot < self.objects as usize).then_some(slot as u32)
    }

    pub(crate) fn addr_of(&self, slot: u32) -> usize {
        self.base + slot as usize * self.size
    }

    pub(crate) fn owner(&self, slot: u32) -> CpuId {
        self.owners[slot as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn set_owner(&self, slot: u32, owner: CpuId) {
        self.owners[slot as usize].store(owner, Ordering::Relaxed);
    }

    fn set_tag(&self, slot: u32, tag: u8) {
        if let Some(t) = self.tags.get(slot as usize) {
            t.store(tag, Ordering::Release);
        }
    }

    fn swap_tag(&self, slot: u32, from: u8, to: u8) -> bool {
        match self.tags.get(slot as usize) {
            Some(t) => t
                .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            None => true,
        }
    }

    /// Marks a parked slot as handed to a caller.
    pub(crate) fn mark_live(&self, slot: u32) {
        self.set_tag(slot, TAG_LIVE);
    }

    /// Claims a live slot for freeing. Fails if the slot is not live,
    /// which under tag checking means a double free.
    pub(crate) fn claim_free(&self, slot: u32) -> bool {
        self.swap_tag(slot, TAG_LIVE, TAG_CACHED)
    }

    /// Number of slots currently held by callers. Zero when untagged.
    pub(crate) fn live_slots(&self) -> usize {
        self.tags
            .iter()
            .filter(|t| t.load(Ordering::Acquire) == TAG_LIVE)
            .count()
    }
}

/// A single object slot, carried by CPU lists and remote queues.
#[derive(Debug, Clone)]
pub(crate) struct ObjRef {
    pub(crate) slab: Arc<Slab>,
    pub(crate) slot: u32,
}

impl ObjRef {
    pub(crate) fn addr(&self) -> usize {
        self.slab.addr_of(self.slot)
    }
}

/// Mutable slab bookkeeping, owned by a node list.
#[derive(Debug)]
pub(crate) struct SlabState {
    pub(crate) slab: Arc<Slab>,
    /// Stack of free slot indices.
    free: Vec<u32>,
    /// Slots not on the free stack (parked on CPU lists or live).
    in_use: u32,
    /// Position in the node's partial vector, if linked.
    pub(crate) partial_pos: Option<usize>,
}

impl SlabState {
    /// Formats a freshly obtained slab with every slot free.
    pub(crate) fn format(slab: Arc<Slab>) -> Self {
        let free = (0..slab.objects).rev().collect();
        Self {
            slab,
            free,
            in_use: 0,
            partial_pos: None,
        }
    }

    pub(crate) fn in_use(&self) -> u32 {
        self.in_use
    }

    pub(crate) fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// Pops up to `max` slots, appending them to `out`.
    pub(crate) fn take(&mut self, max: usize, out: &mut Vec<ObjRef>) -> usize {
        let n = max.min(self.free.len());
        for _ in 0..n {
            if let Some(slot) = self.free.pop() {
                self.slab.set_tag(slot, TAG_CACHED);
                out.push(ObjRef {
                    slab: Arc::clone(&self.slab),
                    slot,
                });
            }
        }
        self.in_use += n as u32;
        n
    }

    /// Returns one slot to the free stack.
    pub(crate) fn put(&mut self, slot: u32) {
        self.slab.set_tag(slot, TAG_FREE);
        self.slab.set_owner(slot, NODE_OWNED);
        self.free.push(slot);
        self.in_use = self.in_use.saturating_sub(1);
    }
}

const NUM_SHARDS: usize = 64;

/// Page-number to slab map, sharded to keep lookups off a single lock.
pub(crate) struct PageMap {
    shards: Box<[RwLock<HashMap<usize, Arc<Slab>>>]>,
}

impl PageMap {
    pub(crate) fn new() -> Self {
        let shards: Vec<_> = (0..NUM_SHARDS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    fn shard_for(&self, page: usize) -> &RwLock<HashMap<usize, Arc<Slab>>> {
        &self.shards[page % NUM_SHARDS]
    }

    fn pages(slab: &Slab) -> std::ops::Range<usize> {
        let first = slab.base >> PAGE_SHIFT;
        first..first + (1usize << slab.order)
    }

    pub(crate) fn insert(&self, slab: &Arc<Slab>) {
        for page in Self::pages(slab) {
            self.shard_for(page).write().insert(page, Arc::clone(slab));
        }
    }

    pub(crate) fn remove(&self, slab: &Slab) {
        for page in Self::pages(slab) {
            self.shard_for(page).write().remove(&page);
        }
    }

    /// Slab containing `addr`, if any.
    pub(crate) fn lookup(&self, addr: usize) -> Option<Arc<Slab>> {
        let page = addr >> PAGE_SHIFT;
        self.shard_for(page).read().get(&page).cloned()
    }
}
