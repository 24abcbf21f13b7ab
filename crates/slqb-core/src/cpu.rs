//! CPU identity and topology.
//!
//! A "CPU" is any worker that owns a fast-path list. Threads get a CPU id
//! on first use (or bind one explicitly with `bind_current_cpu`); tests and
//! simulators can also name CPUs directly through the `*_on` cache methods.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

pub type CpuId = u32;
pub type NodeId = u32;

static NEXT_THREAD_CPU: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static CURRENT_CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
}

/// CPU id of the calling thread, assigning the next free id on first use.
#[must_use]
pub fn current_cpu() -> CpuId {
    CURRENT_CPU.with(|cell| match cell.get() {
        Some(cpu) => cpu,
        None => {
            let cpu = NEXT_THREAD_CPU.fetch_add(1, Ordering::Relaxed);
            cell.set(Some(cpu));
            cpu
        }
    })
}

/// Pins the calling thread to `cpu` for all subsequent implicit-CPU calls.
pub fn bind_current_cpu(cpu: CpuId) {
    CURRENT_CPU.with(|cell| cell.set(Some(cpu)));
}

/// CPU to home-node mapping for one allocator instance.
pub(crate) struct Topology {
    nodes: Vec<NodeId>,
    homes: RwLock<HashMap<CpuId, NodeId>>,
}

impl Topology {
    pub(crate) fn new(mut nodes: Vec<NodeId>) -> Self {
        nodes.sort_unstable();
        nodes.dedup();
        Self {
            nodes,
            homes: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub(crate) fn has_node(&self, node: NodeId) -> bool {
        self.nodes.binary_search(&node).is_ok()
    }

    /// Home node of `cpu`. CPUs never brought online explicitly are spread
    /// round-robin across the present nodes.
    pub(crate) fn home_node(&self, cpu: CpuId) -> NodeId {
        if let Some(&node) = self.homes.read().get(&cpu) {
            return node;
        }
        match self.nodes.len() {
            0 => 0,
            n => self.nodes[cpu as usize % n],
        }
    }

    pub(crate) fn set_home(&self, cpu: CpuId, node: NodeId) {
        self.homes.write().insert(cpu, node);
    }

    pub(crate) fn clear_home(&self, cpu: CpuId) {
        self.homes.write().remove(&cpu);
    }
}
