//! Allocator configuration.
//!
//! Defaults suit production use. `SlqbConfig::from_env` lets a process
//! override the two switches that matter most at run time:
//! - `SLQB_CHECK`: `checked` (default) keeps a state tag per object and
//!   rejects double frees; `fast` trusts the caller like the kernel does.
//! - `SLQB_STATS`: `on` (default) or `off` for the per-CPU stat counters.

use crate::log::LogLevel;

/// How much misuse detection the free path performs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckMode {
    /// Every object slot carries an atomic state tag. Double frees are
    /// reported as errors instead of corrupting the free lists.
    #[default]
    Checked,
    /// No per-object tag checks. A double free silently corrupts state.
    Fast,
}

impl CheckMode {
    /// Parse from string (case-insensitive). Unknown values fall back to `Checked`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "fast" | "unchecked" | "off" | "trust" => Self::Fast,
            _ => Self::Checked,
        }
    }

    #[must_use]
    pub const fn tags_enabled(self) -> bool {
        matches!(self, Self::Checked)
    }
}

fn parse_switch(raw: &str, default: bool) -> bool {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "on" | "yes" | "true" | "enabled" => true,
        "0" | "off" | "no" | "false" | "disabled" => false,
        _ => default,
    }
}

/// Tunables shared by every cache of one allocator instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlqbConfig {
    pub check_mode: CheckMode,
    /// Record per-CPU stat counters.
    pub stats_enabled: bool,
    /// Empty slabs each node list keeps before releasing pages.
    pub empty_slab_buffer: usize,
    /// Local free list high-water mark, in refill batches.
    pub hiwater_batches: usize,
    /// Highest slab order tried when sizing a cache for low waste.
    pub max_order: u32,
    /// Lifecycle records below this level are dropped.
    pub log_level: LogLevel,
    /// Lifecycle records kept before the oldest are discarded.
    pub log_capacity: usize,
}

impl Default for SlqbConfig {
    fn default() -> Self {
        Self {
            check_mode: CheckMode::Checked,
            stats_enabled: true,
            empty_slab_buffer: 2,
            hiwater_batches: 4,
            max_order: 3,
            log_level: LogLevel::Info,
            log_capacity: 4096,
        }
    }
}

impl SlqbConfig {
    /// Defaults with `SLQB_CHECK` / `SLQB_STATS` applied.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup("SLQB_CHECK") {
            config.check_mode = CheckMode::from_str_loose(&raw);
        }
        if let Some(raw) = lookup("SLQB_STATS") {
            config.stats_enabled = parse_switch(&raw, config.stats_enabled);
        }
        config
    }
}
