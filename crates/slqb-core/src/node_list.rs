//! Per-node slab lists.
//!
//! The slow but correct tier. Each (node, cache) pair owns every slab
//! formatted for it, split into a partial set (some slots free, some in use)
//! and a small buffer of empty slabs kept to absorb alloc/free thrashing.
//! Full slabs are tracked but not linked anywhere. Everything is guarded by
//! one lock per node.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cpu::NodeId;
use crate::slab::{ObjRef, Slab, SlabState};

/// Slab counts for one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCounts {
    pub nr_slabs: usize,
    pub nr_partial: usize,
    pub nr_empty: usize,
    /// Slots not on any slab free stack.
    pub objects_in_use: usize,
}

#[derive(Default)]
struct NodeInner {
    slabs: HashMap<usize, SlabState>,
    /// Bases of partial slabs; each state records its position here.
    partial: Vec<usize>,
    /// Bases of retained empty slabs, oldest first.
    empty: VecDeque<usize>,
}

impl NodeInner {
    fn link_partial(&mut self, base: usize) {
        if let Some(state) = self.slabs.get_mut(&base) {
            if state.partial_pos.is_none() {
                state.partial_pos = Some(self.partial.len());
                self.partial.push(base);
            }
        }
    }

    fn unlink_partial(&mut self, base: usize) {
        let Some(pos) = self.slabs.get_mut(&base).and_then(|s| s.partial_pos.take()) else {
            return;
        };
        self.partial.swap_remove(pos);
        if let Some(&moved) = self.partial.get(pos) {
            if let Some(state) = self.slabs.get_mut(&moved) {
                state.partial_pos = Some(pos);
            }
        }
    }

    fn take_from(&mut self, base: usize, max: usize, out: &mut Vec<ObjRef>) -> usize {
        let Some(state) = self.slabs.get_mut(&base) else {
            return 0;
        };
        let taken = state.take(max, out);
        let full = state.is_full();
        if full {
            self.unlink_partial(base);
        } else {
            self.link_partial(base);
        }
        taken
    }

    fn trim_empty(&mut self, keep: usize, released: &mut Vec<Arc<Slab>>) {
        while self.empty.len() > keep {
            let Some(base) = self.empty.pop_front() else {
                break;
            };
            if let Some(state) = self.slabs.remove(&base) {
                released.push(state.slab);
            }
        }
    }
}

/// Partial-slab pool for one (node, cache) pair.
pub(crate) struct NodeList {
    node: NodeId,
    inner: Mutex<NodeInner>,
}

impl NodeList {
    pub(crate) fn new(node: NodeId) -> Self {
        Self {
            node,
            inner: Mutex::new(NodeInner::default()),
        }
    }

    pub(crate) fn node(&self) -> NodeId {
        self.node
    }

    /// Moves up to `max` free objects out of partial slabs, falling back to
    /// one retained empty slab. Returns how many were appended to `out`.
    pub(crate) fn refill(&self, max: usize, out: &mut Vec<ObjRef>) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut taken = 0;
        while taken < max {
            let Some(&base) = inner.partial.last() else {
                break;
            };
            let got = inner.take_from(base, max - taken, out);
            if got == 0 {
                break;
            }
            taken += got;
        }
        if taken == 0 {
            if let Some(base) = inner.empty.pop_back() {
                taken += inner.take_from(base, max, out);
            }
        }
        taken
    }

    /// Links a slab formatted outside the lock. Objects may already have
    /// been taken from it.
    pub(crate) fn insert_fresh(&self, state: SlabState) {
        let base = state.slab.base;
        let empty = state.is_empty();
        let full = state.is_full();
        let mut inner = self.inner.lock();
        inner.slabs.insert(base, state);
        if empty {
            inner.empty.push_back(base);
        } else if !full {
            inner.link_partial(base);
        }
    }

    /// Returns objects to their slabs. Slabs that become empty join the
    /// buffer, which is then trimmed to `keep_empty`. The evicted slabs are
    /// returned for the caller to unmap and release once the lock is gone.
    pub(crate) fn put_objects(&self, objs: &[ObjRef], keep_empty: usize) -> Vec<Arc<Slab>> {
        let mut released = Vec::new();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        for obj in objs {
            let base = obj.slab.base;
            let Some(state) = inner.slabs.get_mut(&base) else {
                debug_assert!(false, "slab {base:#x} is not on node {}", self.node);
                continue;
            };
            let was_full = state.is_full();
            state.put(obj.slot);
            if state.is_empty() {
                inner.unlink_partial(base);
                inner.empty.push_back(base);
            } else if was_full {
                inner.link_partial(base);
            }
        }
        inner.trim_empty(keep_empty, &mut released);
        released
    }

    /// Releases retained empty slabs beyond `keep`.
    pub(crate) fn trim(&self, keep: usize) -> Vec<Arc<Slab>> {
        let mut released = Vec::new();
        self.inner.lock().trim_empty(keep, &mut released);
        released
    }

    /// Unlinks every slab. Returns them with the number of slots that were
    /// still off their free stacks.
    pub(crate) fn drain_all(&self) -> (Vec<Arc<Slab>>, usize) {
        let mut inner = self.inner.lock();
        inner.partial.clear();
        inner.empty.clear();
        let mut in_use = 0;
        let slabs = inner
            .slabs
            .drain()
            .map(|(_, state)| {
                in_use += state.in_use() as usize;
                state.slab
            })
            .collect();
        (slabs, in_use)
    }

    pub(crate) fn counts(&self) -> NodeCounts {
        let inner = self.inner.lock();
        NodeCounts {
            nr_slabs: inner.slabs.len(),
            nr_partial: inner.partial.len(),
            nr_empty: inner.empty.len(),
            objects_in_use: inner.slabs.values().map(|s| s.in_use() as usize).sum(),
        }
    }
}
