//! General-purpose kmalloc front-end and the process-wide instance.
//!
//! Requests are classified into the power-of-two (plus 192-byte) size
//! classes and served from the matching `kmalloc-N` cache, or from
//! `kmalloc_dma-N` when the caller asks for DMA memory. All allocation
//! entry points return `None` on failure, for a zero size, and for sizes
//! above `MAX_CLASS_SIZE`.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::allocator::Slqb;
use crate::cache::Cache;
use crate::config::SlqbConfig;
use crate::cpu::{NodeId, current_cpu};
use crate::error::SlqbError;
use crate::flags::GfpFlags;
use crate::page_source::PageSource;
use crate::size_class::{SizeClass, classify};

impl Slqb {
    /// Cache serving `class` for the given flags.
    #[must_use]
    pub fn kmalloc_cache(&self, class: SizeClass, flags: GfpFlags) -> Option<&Arc<Cache>> {
        let table = if flags.contains(GfpFlags::DMA) {
            &self.kmalloc_dma_caches
        } else {
            &self.kmalloc_caches
        };
        table.get(class.index() as usize)?.as_ref()
    }

    /// Cache serving a `size`-byte request.
    #[must_use]
    pub fn kmalloc_slab(&self, size: usize, flags: GfpFlags) -> Option<&Arc<Cache>> {
        self.kmalloc_cache(classify(size)?, flags)
    }

    #[must_use]
    pub fn kmalloc(&self, size: usize, flags: GfpFlags) -> Option<usize> {
        self.kmalloc_slab(size, flags)?.allocate(flags).ok()
    }

    #[must_use]
    pub fn kmalloc_node(&self, size: usize, flags: GfpFlags, node: NodeId) -> Option<usize> {
        self.kmalloc_slab(size, flags)?
            .allocate_node(flags, node)
            .ok()
    }

    /// `kmalloc` for a size known at compile time. The class lookup folds
    /// to a constant.
    #[must_use]
    pub fn kmalloc_const<const SIZE: usize>(&self, flags: GfpFlags) -> Option<usize> {
        let class = const { classify(SIZE) }?;
        self.kmalloc_cache(class, flags)?.allocate(flags).ok()
    }

    /// Frees an object from any cache of this allocator. Address 0 is a
    /// no-op. The owning cache comes from the slab itself, so frees never
    /// wait on cache creation or destruction elsewhere.
    pub fn kfree(&self, addr: usize) -> Result<(), SlqbError> {
        if addr == 0 {
            return Ok(());
        }
        let slab = self
            .ctx
            .page_map
            .lookup(addr)
            .ok_or(SlqbError::ForeignPointer { addr })?;
        let cache = slab
            .cache()
            .filter(|cache| !cache.is_destroyed())
            .ok_or(SlqbError::ForeignPointer { addr })?;
        cache.free_in(current_cpu(), slab, addr)
    }

    /// Usable size of the object at `addr`.
    #[must_use]
    pub fn ksize(&self, addr: usize) -> Option<usize> {
        let slab = self.ctx.page_map.lookup(addr)?;
        slab.slot_of(addr)?;
        Some(slab.size)
    }
}

static GLOBAL: RwLock<Option<Arc<Slqb>>> = RwLock::new(None);

/// Creates the process-wide allocator.
pub fn init(config: SlqbConfig, pages: Arc<dyn PageSource>) -> Result<Arc<Slqb>, SlqbError> {
    let mut global = GLOBAL.write();
    if global.is_some() {
        return Err(SlqbError::AlreadyInitialized);
    }
    let slqb = Arc::new(Slqb::new(config, pages)?);
    *global = Some(Arc::clone(&slqb));
    Ok(slqb)
}

/// The process-wide allocator, if initialized.
#[must_use]
pub fn global() -> Option<Arc<Slqb>> {
    GLOBAL.read().clone()
}

/// Destroys every cache of the process-wide allocator and uninstalls it.
/// Fails, leaving it installed, while objects are live.
pub fn teardown() -> Result<(), SlqbError> {
    let mut global = GLOBAL.write();
    let slqb = global.as_ref().ok_or(SlqbError::NotInitialized)?;
    slqb.shutdown()?;
    *global = None;
    Ok(())
}

#[must_use]
pub fn kmalloc(size: usize, flags: GfpFlags) -> Option<usize> {
    global()?.kmalloc(size, flags)
}

#[must_use]
pub fn kmalloc_node(size: usize, flags: GfpFlags, node: NodeId) -> Option<usize> {
    global()?.kmalloc_node(size, flags, node)
}

#[must_use]
pub fn kmalloc_const<const SIZE: usize>(flags: GfpFlags) -> Option<usize> {
    global()?.kmalloc_const::<SIZE>(flags)
}

pub fn kfree(addr: usize) -> Result<(), SlqbError> {
    if addr == 0 {
        return Ok(());
    }
    global().ok_or(SlqbError::NotInitialized)?.kfree(addr)
}

#[must_use]
pub fn ksize(addr: usize) -> Option<usize> {
    global()?.ksize(addr)
}
