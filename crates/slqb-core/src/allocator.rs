//! Allocator instance.
//!
//! `Slqb` owns everything shared by its caches: the page source, the page
//! map, the CPU topology and the lifecycle log. It builds the two kmalloc
//! tables up front and keeps a registry of every live cache so that
//! `kfree` can route an address to its owner.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::{Cache, Constructor, SlabContext, SlabInfo};
use crate::config::SlqbConfig;
use crate::cpu::{CpuId, NodeId};
use crate::error::SlqbError;
use crate::flags::CacheFlags;
use crate::log::{LogEvent, LogLevel, LogRecord};
use crate::page_source::PageSource;
use crate::size_class::{KMALLOC_TABLE_LEN, active_classes};
use crate::slab::CacheId;

pub(crate) type CacheTable = Vec<Option<Arc<Cache>>>;

/// An SLQB allocator over one page source.
pub struct Slqb {
    pub(crate) ctx: Arc<SlabContext>,
    pub(crate) caches: RwLock<HashMap<CacheId, Arc<Cache>>>,
    pub(crate) kmalloc_caches: CacheTable,
    pub(crate) kmalloc_dma_caches: CacheTable,
}

impl Slqb {
    /// Creates an allocator and its kmalloc tables.
    pub fn new(config: SlqbConfig, pages: Arc<dyn PageSource>) -> Result<Self, SlqbError> {
        let mut slqb = Self {
            ctx: Arc::new(SlabContext::new(config, pages)),
            caches: RwLock::new(HashMap::new()),
            kmalloc_caches: vec![None; KMALLOC_TABLE_LEN],
            kmalloc_dma_caches: vec![None; KMALLOC_TABLE_LEN],
        };
        for class in active_classes() {
            let index = class.index() as usize;
            let size = class.size();
            let normal = slqb.register(&format!("kmalloc-{size}"), size, 0, CacheFlags::empty(), None)?;
            slqb.kmalloc_caches[index] = Some(normal);
            let dma = slqb.register(&format!("kmalloc_dma-{size}"), size, 0, CacheFlags::DMA, None)?;
            slqb.kmalloc_dma_caches[index] = Some(dma);
        }
        slqb.ctx.log.record(
            LogLevel::Info,
            LogEvent {
                cache: "slqb",
                event: "init",
                outcome: "ok",
                ..LogEvent::default()
            },
            format!(
                "nodes={:?} caches={} check={:?}",
                slqb.ctx.topology.nodes(),
                slqb.caches.read().len(),
                slqb.ctx.config.check_mode
            ),
        );
        Ok(slqb)
    }

    fn register(
        &self,
        name: &str,
        object_size: usize,
        align: usize,
        flags: CacheFlags,
        ctor: Option<Constructor>,
    ) -> Result<Arc<Cache>, SlqbError> {
        let cache = Cache::new(name, object_size, align, flags, ctor, Arc::clone(&self.ctx))?
            .into_shared();
        self.caches.write().insert(cache.id(), Arc::clone(&cache));
        Ok(cache)
    }

    #[must_use]
    pub fn config(&self) -> &SlqbConfig {
        &self.ctx.config
    }

    /// Nodes reported by the page source.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeId> {
        self.ctx.topology.nodes().to_vec()
    }

    /// Creates a cache of `object_size`-byte objects. An `align` of 0 asks
    /// for the minimum alignment.
    pub fn cache_create(
        &self,
        name: &str,
        object_size: usize,
        align: usize,
        flags: CacheFlags,
        ctor: Option<Constructor>,
    ) -> Result<Arc<Cache>, SlqbError> {
        let cache = self.register(name, object_size, align, flags, ctor);
        let (outcome, details) = match &cache {
            Ok(cache) => (
                "ok",
                format!(
                    "size={} align={} order={} objects={}",
                    cache.size(),
                    cache.align(),
                    cache.order(),
                    cache.objects()
                ),
            ),
            Err(err) => (err.label(), err.to_string()),
        };
        self.ctx.log.record(
            LogLevel::Info,
            LogEvent {
                cache: name,
                event: "cache_create",
                outcome,
                size: Some(object_size),
                ..LogEvent::default()
            },
            details,
        );
        cache
    }

    /// Destroys a cache with no live objects, releasing all its slabs.
    pub fn cache_destroy(&self, cache: &Arc<Cache>) -> Result<(), SlqbError> {
        let registered = self
            .caches
            .read()
            .get(&cache.id())
            .is_some_and(|known| Arc::ptr_eq(known, cache));
        if !registered {
            return Err(SlqbError::CacheDestroyed {
                name: cache.name().to_string(),
            });
        }
        cache.destroy()?;
        self.caches.write().remove(&cache.id());
        Ok(())
    }

    /// Every registered cache, in creation order.
    #[must_use]
    pub fn caches(&self) -> Vec<Arc<Cache>> {
        let mut caches: Vec<Arc<Cache>> = self.caches.read().values().cloned().collect();
        caches.sort_by_key(|cache| cache.id());
        caches
    }

    #[must_use]
    pub fn find_cache(&self, name: &str) -> Option<Arc<Cache>> {
        self.caches
            .read()
            .values()
            .find(|cache| cache.name() == name)
            .cloned()
    }

    /// Brings `cpu` online with home node `node`. A CPU moving to another
    /// node gives up its old lists first.
    pub fn cpu_online(&self, cpu: CpuId, node: NodeId) -> Result<(), SlqbError> {
        if !self.ctx.topology.has_node(node) {
            return Err(SlqbError::UnknownNode { node });
        }
        self.ctx.topology.set_home(cpu, node);
        let mut moved = 0;
        for cache in self.caches() {
            if cache.cpu_home(cpu).is_some_and(|home| home != node) {
                moved += cache.retire_cpu(cpu);
            }
        }
        self.ctx.log.record(
            LogLevel::Info,
            LogEvent {
                cache: "slqb",
                event: "cpu_online",
                outcome: "ok",
                cpu: Some(cpu),
                node: Some(node),
                ..LogEvent::default()
            },
            format!("returned={moved}"),
        );
        Ok(())
    }

    /// Takes `cpu` offline: every cache drains and retires its lists.
    pub fn cpu_offline(&self, cpu: CpuId) {
        let returned: usize = self.caches().iter().map(|cache| cache.retire_cpu(cpu)).sum();
        self.ctx.topology.clear_home(cpu);
        self.ctx.log.record(
            LogLevel::Info,
            LogEvent {
                cache: "slqb",
                event: "cpu_offline",
                outcome: "ok",
                cpu: Some(cpu),
                ..LogEvent::default()
            },
            format!("returned={returned}"),
        );
    }

    /// Runs a reclaim pass over every cache. Returns slabs released.
    pub fn shrink_all(&self) -> usize {
        self.caches().iter().map(|cache| cache.shrink()).sum()
    }

    /// One row per cache, in creation order.
    #[must_use]
    pub fn slabinfo(&self) -> Vec<SlabInfo> {
        self.caches().iter().map(|cache| cache.slab_info()).collect()
    }

    /// Objects held by callers across all caches.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.caches().iter().map(|cache| cache.live_objects()).sum()
    }

    #[must_use]
    pub fn lifecycle_logs(&self) -> Vec<LogRecord> {
        self.ctx.log.snapshot()
    }

    pub fn drain_lifecycle_logs(&self) -> Vec<LogRecord> {
        self.ctx.log.drain()
    }

    /// Destroys every cache. Fails without destroying anything while any
    /// cache still has live objects.
    pub fn shutdown(&self) -> Result<(), SlqbError> {
        let caches = self.caches();
        if let Some(busy) = caches.iter().find(|cache| cache.live_objects() > 0) {
            return Err(SlqbError::CacheBusy {
                name: busy.name().to_string(),
                live: busy.live_objects(),
            });
        }
        for cache in &caches {
            match cache.destroy() {
                Ok(()) | Err(SlqbError::CacheDestroyed { .. }) => {}
                Err(err) => return Err(err),
            }
            self.caches.write().remove(&cache.id());
        }
        Ok(())
    }
}
