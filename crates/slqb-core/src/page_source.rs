//! Page source boundary.
//!
//! The allocator never manages physical pages itself. It asks a
//! `PageSource` for naturally aligned blocks of `2^order` pages and hands
//! them back once a slab is evacuated. `SimulatedPageSource` backs the
//! allocator with logical addresses, which is what the tests and the
//! harness use; `HeapPageSource` (see `heap_pages`) hands out real memory.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::cpu::NodeId;
use crate::flags::GfpFlags;
use crate::size_class::PAGE_SIZE;

/// Provider of page-order memory blocks.
pub trait PageSource: Send + Sync {
    /// NUMA nodes that have memory.
    fn nodes(&self) -> Vec<NodeId>;

    /// Obtains `2^order` contiguous pages aligned to their own size.
    fn request_pages(&self, order: u32, flags: GfpFlags, node: NodeId) -> Option<usize>;

    /// Returns a block previously obtained from `request_pages`.
    fn release_pages(&self, base: usize, order: u32);
}

/// Bytes in a block of `2^order` pages.
#[must_use]
pub const fn order_bytes(order: u32) -> usize {
    PAGE_SIZE << order
}

/// Rounds `addr` up to a multiple of `align` (a power of two).
const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Start of the simulated DMA zone.
pub const DMA_ZONE_BASE: usize = 0x10_0000;

/// Every DMA block lies below this address.
pub const DMA_ZONE_LIMIT: usize = 0x100_0000;

const NORMAL_BASE: usize = 0x1_0000_0000;
const NODE_SPAN: usize = 0x10_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ZoneKey {
    Dma,
    Normal(NodeId),
}

#[derive(Debug)]
struct Zone {
    next: usize,
    end: usize,
    budget_pages: usize,
    outstanding_pages: usize,
    /// Released blocks by order, reused before bumping `next`.
    free_blocks: HashMap<u32, Vec<usize>>,
}

impl Zone {
    fn new(base: usize, end: usize, budget_pages: usize) -> Self {
        Self {
            next: base,
            end,
            budget_pages,
            outstanding_pages: 0,
            free_blocks: HashMap::new(),
        }
    }

    fn take(&mut self, order: u32) -> Option<usize> {
        let pages = 1usize << order;
        if self.outstanding_pages + pages > self.budget_pages {
            return None;
        }
        let base = match self.free_blocks.get_mut(&order).and_then(Vec::pop) {
            Some(base) => base,
            None => {
                let bytes = order_bytes(order);
                let base = align_up(self.next, bytes);
                let next = base.checked_add(bytes)?;
                if next > self.end {
                    return None;
                }
                self.next = next;
                base
            }
        };
        self.outstanding_pages += pages;
        Some(base)
    }

    fn give_back(&mut self, base: usize, order: u32) {
        self.outstanding_pages -= 1usize << order;
        self.free_blocks.entry(order).or_default().push(base);
    }
}

#[derive(Debug, Default)]
struct SimState {
    zones: HashMap<ZoneKey, Zone>,
    /// Outstanding block base -> (zone, order).
    blocks: HashMap<usize, (ZoneKey, u32)>,
    requests: u64,
    releases: u64,
    failures: u64,
}

/// Page source over simulated address space.
///
/// Each node owns a disjoint address range with its own page budget; node
/// 0's DMA zone sits below `DMA_ZONE_LIMIT`. Requests beyond the budget
/// fail, which is how tests drive the out-of-memory path.
#[derive(Debug)]
pub struct SimulatedPageSource {
    nodes: Vec<NodeId>,
    state: Mutex<SimState>,
}

impl SimulatedPageSource {
    /// `nr_nodes` nodes with `pages_per_node` pages of normal memory each.
    #[must_use]
    pub fn new(nr_nodes: u32, pages_per_node: usize) -> Self {
        let nr_nodes = nr_nodes.max(1);
        let mut zones = HashMap::new();
        for node in 0..nr_nodes {
            let base = NORMAL_BASE + node as usize * NODE_SPAN;
            zones.insert(
                ZoneKey::Normal(node),
                Zone::new(base, base + NODE_SPAN, pages_per_node),
            );
        }
        let dma_pages = (DMA_ZONE_LIMIT - DMA_ZONE_BASE) / PAGE_SIZE;
        zones.insert(
            ZoneKey::Dma,
            Zone::new(DMA_ZONE_BASE, DMA_ZONE_LIMIT, dma_pages),
        );
        Self {
            nodes: (0..nr_nodes).collect(),
            state: Mutex::new(SimState {
                zones,
                ..SimState::default()
            }),
        }
    }

    /// One node with an effectively unlimited budget.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(1, NODE_SPAN / PAGE_SIZE)
    }

    /// Changes a node's normal-zone budget. Lowering it below the
    /// outstanding page count makes every further request fail.
    pub fn set_budget(&self, node: NodeId, pages: usize) {
        if let Some(zone) = self.state.lock().zones.get_mut(&ZoneKey::Normal(node)) {
            zone.budget_pages = pages;
        }
    }

    /// Pages currently handed out across all zones.
    #[must_use]
    pub fn outstanding_pages(&self) -> usize {
        self.state.lock().zones.values().map(|z| z.outstanding_pages).sum()
    }

    /// Blocks currently handed out.
    #[must_use]
    pub fn outstanding_blocks(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Successful `request_pages` calls.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.state.lock().requests
    }

    /// `release_pages` calls that returned a known block.
    #[must_use]
    pub fn releases(&self) -> u64 {
        self.state.lock().releases
    }

    /// `request_pages` calls that failed.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.state.lock().failures
    }

    /// Node whose address range contains `addr`.
    #[must_use]
    pub fn node_of(&self, addr: usize) -> Option<NodeId> {
        let state = self.state.lock();
        state.zones.iter().find_map(|(key, zone)| match key {
            ZoneKey::Normal(node) if addr >= zone.end - NODE_SPAN && addr < zone.end => {
                Some(*node)
            }
            ZoneKey::Dma if (DMA_ZONE_BASE..DMA_ZONE_LIMIT).contains(&addr) => Some(0),
            _ => None,
        })
    }
}

impl PageSource for SimulatedPageSource {
    fn nodes(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }

    fn request_pages(&self, order: u32, flags: GfpFlags, node: NodeId) -> Option<usize> {
        let key = if flags.contains(GfpFlags::DMA) {
            ZoneKey::Dma
        } else {
            ZoneKey::Normal(node)
        };
        let mut state = self.state.lock();
        let taken = state.zones.get_mut(&key).and_then(|zone| zone.take(order));
        match taken {
            Some(base) => {
                state.requests += 1;
                state.blocks.insert(base, (key, order));
                Some(base)
            }
            None => {
                state.failures += 1;
                None
            }
        }
    }

    fn release_pages(&self, base: usize, order: u32) {
        let mut state = self.state.lock();
        let Some((key, recorded_order)) = state.blocks.remove(&base) else {
            return;
        };
        debug_assert_eq!(recorded_order, order, "block released with a different order");
        if let Some(zone) = state.zones.get_mut(&key) {
            zone.give_back(base, recorded_order);
        }
        state.releases += 1;
    }
}
