//! # slqb-core
//!
//! An SLQB-style slab allocator: fixed-size object caches backed by
//! page-order blocks, with per-CPU free lists, remote-free queues and
//! per-node partial slab lists, plus a kmalloc front-end over a table of
//! size-class caches.
//!
//! Objects are plain addresses handed out by a [`PageSource`]. The
//! allocator never dereferences them, so everything outside
//! [`heap_pages`] is safe code.

#![deny(unsafe_code)]

pub mod allocator;
pub mod cache;
pub mod config;
pub mod cpu;
mod cpu_list;
pub mod error;
pub mod flags;
#[allow(unsafe_code)]
pub mod heap_pages;
pub mod kmalloc;
pub mod log;
pub mod node_list;
pub mod page_source;
pub mod size_class;
mod slab;
pub mod stats;

pub use allocator::Slqb;
pub use cache::{Cache, Constructor, SlabInfo};
pub use config::{CheckMode, SlqbConfig};
pub use cpu::{CpuId, NodeId, bind_current_cpu, current_cpu};
pub use error::SlqbError;
pub use flags::{CacheFlags, GfpFlags};
pub use heap_pages::HeapPageSource;
pub use kmalloc::{global, init, kfree, kmalloc, kmalloc_const, kmalloc_node, ksize, teardown};
pub use log::{LogLevel, LogRecord};
pub use node_list::NodeCounts;
pub use page_source::{PageSource, SimulatedPageSource};
pub use size_class::{MAX_CLASS_SIZE, PAGE_SIZE, SizeClass, classify};
pub use stats::{StatItem, StatsSnapshot};
