//! Per-CPU statistics counters.
//!
//! All counters use relaxed ordering. They are diagnostic only and never
//! used for synchronisation.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Events counted per (CPU, cache).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatItem {
    /// Allocation served from the local free list.
    AllocLocal,
    /// Allocation served from a node other than the CPU's home node.
    AllocOffnode,
    /// Allocation failed because the page source was exhausted.
    AllocFailed,
    /// Allocation formatted a new slab.
    AllocNewpage,
    /// Allocation drained the remote-free queue.
    AllocProcessRfree,
    /// A slab was released while serving an allocation.
    AllocFreepage,
    /// Free pushed onto the owning CPU's local list.
    FreeLocal,
    /// Free queued for another CPU or returned to a foreign node.
    FreeRemote,
    /// A remote-free queue overflowed and was flushed to the node lists.
    FreeFlushRcache,
    /// A slab was released on the free path.
    FreeFreepage,
}

/// Number of stat items.
pub const NR_STAT_ITEMS: usize = 10;

impl StatItem {
    pub const fn all() -> [StatItem; NR_STAT_ITEMS] {
        [
            StatItem::AllocLocal,
            StatItem::AllocOffnode,
            StatItem::AllocFailed,
            StatItem::AllocNewpage,
            StatItem::AllocProcessRfree,
            StatItem::AllocFreepage,
            StatItem::FreeLocal,
            StatItem::FreeRemote,
            StatItem::FreeFlushRcache,
            StatItem::FreeFreepage,
        ]
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            StatItem::AllocLocal => "alloc_local",
            StatItem::AllocOffnode => "alloc_offnode",
            StatItem::AllocFailed => "alloc_failed",
            StatItem::AllocNewpage => "alloc_newpage",
            StatItem::AllocProcessRfree => "alloc_process_rfree",
            StatItem::AllocFreepage => "alloc_freepage",
            StatItem::FreeLocal => "free_local",
            StatItem::FreeRemote => "free_remote",
            StatItem::FreeFlushRcache => "free_flush_rcache",
            StatItem::FreeFreepage => "free_freepage",
        }
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

/// Counters for one (CPU, cache) pair.
#[derive(Debug)]
pub struct CpuStats {
    counters: [AtomicU64; NR_STAT_ITEMS],
}

impl CpuStats {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counters: [const { AtomicU64::new(0) }; NR_STAT_ITEMS],
        }
    }

    pub fn add(&self, item: StatItem, n: u64) {
        self.counters[item.slot()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc(&self, item: StatItem) {
        self.add(item, 1);
    }

    #[must_use]
    pub fn get(&self, item: StatItem) -> u64 {
        self.counters[item.slot()].load(Ordering::Relaxed)
    }

    /// Adds every counter of `self` into `into`.
    pub fn fold_into(&self, into: &CpuStats) {
        for item in StatItem::all() {
            into.add(item, self.get(item));
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snap = StatsSnapshot::default();
        snap.accumulate(self);
        snap
    }
}

impl Default for CpuStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time totals for a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub alloc_local: u64,
    pub alloc_offnode: u64,
    pub alloc_failed: u64,
    pub alloc_newpage: u64,
    pub alloc_process_rfree: u64,
    pub alloc_freepage: u64,
    pub free_local: u64,
    pub free_remote: u64,
    pub free_flush_rcache: u64,
    pub free_freepage: u64,
}

impl StatsSnapshot {
    #[must_use]
    pub fn get(&self, item: StatItem) -> u64 {
        match item {
            StatItem::AllocLocal => self.alloc_local,
            StatItem::AllocOffnode => self.alloc_offnode,
            StatItem::AllocFailed => self.alloc_failed,
            StatItem::AllocNewpage => self.alloc_newpage,
            StatItem::AllocProcessRfree => self.alloc_process_rfree,
            StatItem::AllocFreepage => self.alloc_freepage,
            StatItem::FreeLocal => self.free_local,
            StatItem::FreeRemote => self.free_remote,
            StatItem::FreeFlushRcache => self.free_flush_rcache,
            StatItem::FreeFreepage => self.free_freepage,
        }
    }

    fn slot_mut(&mut self, item: StatItem) -> &mut u64 {
        match item {
            StatItem::AllocLocal => &mut self.alloc_local,
            StatItem::AllocOffnode => &mut self.alloc_offnode,
            StatItem::AllocFailed => &mut self.alloc_failed,
            StatItem::AllocNewpage => &mut self.alloc_newpage,
            StatItem::AllocProcessRfree => &mut self.alloc_process_rfree,
            StatItem::AllocFreepage => &mut self.alloc_freepage,
            StatItem::FreeLocal => &mut self.free_local,
            StatItem::FreeRemote => &mut self.free_remote,
            StatItem::FreeFlushRcache => &mut self.free_flush_rcache,
            StatItem::FreeFreepage => &mut self.free_freepage,
        }
    }

    /// Adds another snapshot's counters into this one.
    pub fn merge(&mut self, other: &StatsSnapshot) {
        for item in StatItem::all() {
            *self.slot_mut(item) += other.get(item);
        }
    }

    pub(crate) fn accumulate(&mut self, stats: &CpuStats) {
        for item in StatItem::all() {
            *self.slot_mut(item) += stats.get(item);
        }
    }
}
