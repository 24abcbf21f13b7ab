//! Page source backed by the process heap.
//!
//! Blocks come from the global allocator with alignment equal to their
//! size, so slab addresses handed out by a cache are real, writable memory.
//! Node affinity is accepted but not honoured.

use std::alloc::Layout;
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::cpu::NodeId;
use crate::flags::GfpFlags;
use crate::page_source::{PageSource, order_bytes};

/// Heap-backed page source.
pub struct HeapPageSource {
    nr_nodes: u32,
    /// Pages this source may have outstanding at once.
    limit_pages: usize,
    blocks: Mutex<HashMap<usize, Layout>>,
}

impl HeapPageSource {
    #[must_use]
    pub fn new(nr_nodes: u32, limit_pages: usize) -> Self {
        Self {
            nr_nodes: nr_nodes.max(1),
            limit_pages,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Pages currently allocated from the heap.
    #[must_use]
    pub fn outstanding_pages(&self) -> usize {
        self.blocks
            .lock()
            .values()
            .map(|layout| layout.size() / order_bytes(0))
            .sum()
    }
}

impl PageSource for HeapPageSource {
    fn nodes(&self) -> Vec<NodeId> {
        (0..self.nr_nodes).collect()
    }

    fn request_pages(&self, order: u32, _flags: GfpFlags, node: NodeId) -> Option<usize> {
        if node >= self.nr_nodes {
            return None;
        }
        let bytes = order_bytes(order);
        let mut blocks = self.blocks.lock();
        let outstanding: usize = blocks.values().map(|l| l.size() / order_bytes(0)).sum();
        if outstanding + (1usize << order) > self.limit_pages {
            return None;
        }
        let layout = Layout::from_size_align(bytes, bytes).ok()?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return None;
        }
        blocks.insert(ptr as usize, layout);
        Some(ptr as usize)
    }

    fn release_pages(&self, base: usize, _order: u32) {
        let Some(layout) = self.blocks.lock().remove(&base) else {
            return;
        };
        // SAFETY: base was returned by `alloc` with this layout and is removed
        // from the table, so it is deallocated exactly once.
        unsafe { std::alloc::dealloc(base as *mut u8, layout) };
    }
}

impl Drop for HeapPageSource {
    fn drop(&mut self) {
        for (base, layout) in self.blocks.get_mut().drain() {
            // SAFETY: every table entry is a live allocation with its layout.
            unsafe { std::alloc::dealloc(base as *mut u8, layout) };
        }
    }
}
