//! Per-CPU object lists.
//!
//! Each (cache, CPU) pair owns a local free list and a remote queue. The
//! local list is touched only by its CPU on the hot path; its mutex is
//! therefore uncontended and exists so hotplug and shrink can drain the list
//! from another thread. Objects this CPU frees on behalf of another owner
//! are staged next to the local list and handed over a batch at a time, so
//! the owner's remote queue lock is taken once per batch rather than once
//! per free. The owner drains its remote queue on its next allocation miss.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::cpu::{CpuId, NodeId};
use crate::slab::{CacheId, ObjRef};
use crate::stats::CpuStats;

/// Objects freed here for another CPU, waiting to be handed over.
#[derive(Debug, Default)]
struct RemoteStage {
    owner: CpuId,
    objects: Vec<ObjRef>,
}

/// A staged batch ready for its owner's remote queue.
pub(crate) type StagedBatch = (CpuId, Vec<ObjRef>);

/// LIFO list of parked objects. The back is hot, the front is cold.
#[derive(Debug, Default)]
pub(crate) struct LocalList {
    objects: VecDeque<ObjRef>,
    staged: RemoteStage,
    retired: bool,
}

impl LocalList {
    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }

    pub(crate) fn pop(&mut self) -> Option<ObjRef> {
        self.objects.pop_back()
    }

    pub(crate) fn push(&mut self, obj: ObjRef) {
        self.objects.push_back(obj);
    }

    /// Parks a refill batch so that its first element is popped first.
    pub(crate) fn park_batch(&mut self, batch: Vec<ObjRef>) {
        self.objects.extend(batch.into_iter().rev());
    }

    /// Removes up to `n` of the least recently freed objects.
    pub(crate) fn take_cold(&mut self, n: usize) -> Vec<ObjRef> {
        let n = n.min(self.objects.len());
        self.objects.drain(..n).collect()
    }

    /// Stages an object freed for `owner`. Returns the batches that must
    /// now be handed over: the previous owner's objects when the owner
    /// changes, and the current stage once it holds `batch` objects.
    pub(crate) fn stage(&mut self, owner: CpuId, obj: ObjRef, batch: usize) -> Vec<StagedBatch> {
        let mut ready = Vec::new();
        if self.staged.owner != owner {
            ready.extend(self.take_staged());
            self.staged.owner = owner;
        }
        self.staged.objects.push(obj);
        if self.staged.objects.len() >= batch {
            ready.extend(self.take_staged());
        }
        ready
    }

    /// Empties the stage.
    pub(crate) fn take_staged(&mut self) -> Option<StagedBatch> {
        if self.staged.objects.is_empty() {
            return None;
        }
        Some((self.staged.owner, std::mem::take(&mut self.staged.objects)))
    }

    pub(crate) fn staged_len(&self) -> usize {
        self.staged.objects.len()
    }

    fn take_all(&mut self) -> Vec<ObjRef> {
        let mut objs: Vec<ObjRef> = self.objects.drain(..).collect();
        objs.append(&mut self.staged.objects);
        objs
    }
}

#[derive(Debug, Default)]
struct RemoteQueue {
    objects: Vec<ObjRef>,
    retired: bool,
}

/// Fast-path state of one CPU for one cache.
#[derive(Debug)]
pub(crate) struct CpuList {
    cpu: CpuId,
    home: NodeId,
    local: Mutex<LocalList>,
    remote: Mutex<RemoteQueue>,
    /// Set when the remote queue may be non-empty; checked without the lock.
    remote_pending: AtomicBool,
    /// Mirrors the retired flags for lock-free checks.
    retired: AtomicBool,
    /// Allocations minus frees performed by this CPU.
    live_delta: AtomicI64,
    pub(crate) stats: CpuStats,
}

impl CpuList {
    pub(crate) fn new(cpu: CpuId, home: NodeId) -> Self {
        Self {
            cpu,
            home,
            local: Mutex::new(LocalList::default()),
            remote: Mutex::new(RemoteQueue::default()),
            remote_pending: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            live_delta: AtomicI64::new(0),
            stats: CpuStats::new(),
        }
    }

    pub(crate) fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub(crate) fn home(&self) -> NodeId {
        self.home
    }

    pub(crate) fn lock_local(&self) -> MutexGuard<'_, LocalList> {
        self.local.lock()
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Queues a batch freed by another CPU under one lock acquisition.
    /// Returns the queue length, or hands the batch back if this list has
    /// been retired.
    pub(crate) fn push_remote(&self, mut objs: Vec<ObjRef>) -> Result<usize, Vec<ObjRef>> {
        let mut remote = self.remote.lock();
        if remote.retired {
            return Err(objs);
        }
        remote.objects.append(&mut objs);
        self.remote_pending.store(true, Ordering::Release);
        Ok(remote.objects.len())
    }

    /// Takes up to `max` remotely freed objects.
    pub(crate) fn take_remote(&self, max: usize) -> Vec<ObjRef> {
        if !self.remote_pending.load(Ordering::Acquire) {
            return Vec::new();
        }
        let mut remote = self.remote.lock();
        let n = max.min(remote.objects.len());
        let start = remote.objects.len() - n;
        let taken = remote.objects.split_off(start);
        if remote.objects.is_empty() {
            self.remote_pending.store(false, Ordering::Release);
        }
        taken
    }

    /// Empties the remote queue.
    pub(crate) fn take_all_remote(&self) -> Vec<ObjRef> {
        self.take_remote(usize::MAX)
    }

    /// Drains both lists and the stage without retiring. Used by shrink.
    pub(crate) fn drain(&self) -> Vec<ObjRef> {
        let mut objs = self.local.lock().take_all();
        objs.extend(self.take_all_remote());
        objs
    }

    /// Marks both lists retired and returns everything they held. Later
    /// pushes are refused and later allocations must look the list up again.
    pub(crate) fn retire(&self) -> Vec<ObjRef> {
        let mut local = self.local.lock();
        local.retired = true;
        self.retired.store(true, Ordering::Release);
        let mut objs = local.take_all();
        let mut remote = self.remote.lock();
        remote.retired = true;
        objs.append(&mut remote.objects);
        self.remote_pending.store(false, Ordering::Release);
        objs
    }

    pub(crate) fn note_alloc(&self) {
        self.live_delta.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_free(&self) {
        self.live_delta.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn live_delta(&self) -> i64 {
        self.live_delta.load(Ordering::Relaxed)
    }
}

thread_local! {
    /// The calling thread's most recent list per cache.
    static RECENT_LISTS: RefCell<HashMap<CacheId, Weak<CpuList>>> = RefCell::new(HashMap::new());
}

/// Dead entries are pruned once the map grows past this.
const RECENT_LISTS_PRUNE: usize = 128;

/// The calling thread's remembered list for `cache`, if it still belongs
/// to `cpu` and has not been retired.
pub(crate) fn recent_list(cache: CacheId, cpu: CpuId) -> Option<Arc<CpuList>> {
    RECENT_LISTS.with(|lists| {
        let list = lists.borrow().get(&cache)?.upgrade()?;
        (list.cpu() == cpu && !list.is_retired()).then_some(list)
    })
}

pub(crate) fn remember_list(cache: CacheId, list: &Arc<CpuList>) {
    RECENT_LISTS.with(|lists| {
        let mut lists = lists.borrow_mut();
        if lists.len() >= RECENT_LISTS_PRUNE {
            lists.retain(|_, list| list.strong_count() > 0);
        }
        lists.insert(cache, Arc::downgrade(list));
    });
}
