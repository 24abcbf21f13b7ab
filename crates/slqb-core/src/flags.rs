//! Allocation and cache flags.

use bitflags::bitflags;

bitflags! {
    /// Per-request allocation flags, passed through to the page source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GfpFlags: u32 {
        /// Memory must come from the DMA zone.
        const DMA = 1 << 0;
        /// Do not log allocation failures.
        const NOWARN = 1 << 1;
    }
}

bitflags! {
    /// Cache creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CacheFlags: u32 {
        /// Align objects to the hardware cache line.
        const HWCACHE_ALIGN = 1 << 0;
        /// Back every slab with DMA-zone pages.
        const DMA = 1 << 1;
    }
}

impl CacheFlags {
    /// Flags handed to the page source for every slab of a cache.
    #[must_use]
    pub fn alloc_flags(self) -> GfpFlags {
        if self.contains(Self::DMA) {
            GfpFlags::DMA
        } else {
            GfpFlags::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_cache_requests_dma_pages() {
        assert_eq!(CacheFlags::DMA.alloc_flags(), GfpFlags::DMA);
        assert_eq!(CacheFlags::HWCACHE_ALIGN.alloc_flags(), GfpFlags::empty());
    }
}
