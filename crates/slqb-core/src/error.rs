//! Allocator error type.

use thiserror::Error;

use crate::cpu::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlqbError {
    #[error("cache {cache}: page source could not supply an order-{order} block")]
    OutOfMemory { cache: String, order: u32 },
    #[error("invalid object size {size}")]
    InvalidSize { size: usize },
    #[error("alignment {align} is not a power of two")]
    InvalidAlignment { align: usize },
    #[error("node {node} is not present")]
    UnknownNode { node: NodeId },
    #[error("address {addr:#x} does not belong to this cache")]
    ForeignPointer { addr: usize },
    #[error("address {addr:#x} freed twice")]
    DoubleFree { addr: usize },
    #[error("cache {name} still has {live} live objects")]
    CacheBusy { name: String, live: usize },
    #[error("cache {name} has been destroyed")]
    CacheDestroyed { name: String },
    #[error("allocator already initialized")]
    AlreadyInitialized,
    #[error("allocator not initialized")]
    NotInitialized,
}

impl SlqbError {
    /// Stable label used in lifecycle log records.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::OutOfMemory { .. } => "oom",
            Self::InvalidSize { .. } => "invalid_size",
            Self::InvalidAlignment { .. } => "invalid_alignment",
            Self::UnknownNode { .. } => "unknown_node",
            Self::ForeignPointer { .. } => "foreign_pointer",
            Self::DoubleFree { .. } => "double_free",
            Self::CacheBusy { .. } => "cache_busy",
            Self::CacheDestroyed { .. } => "cache_destroyed",
            Self::AlreadyInitialized => "already_initialized",
            Self::NotInitialized => "not_initialized",
        }
    }
}
