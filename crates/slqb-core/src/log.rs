//! Structured allocator lifecycle log.
//!
//! Slow-path events (slab creation and release, allocation failure, misuse,
//! CPU hotplug, shrink, destroy) are recorded as `LogRecord`s in a bounded
//! buffer owned by the allocator instance. The per-CPU fast paths never log.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::cpu::{CpuId, NodeId};

/// Lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this record.
    pub trace_id: String,
    pub level: LogLevel,
    /// Cache the event concerns (empty for subsystem-wide events).
    pub cache: String,
    /// Event kind (`slab_new`, `slab_release`, `alloc_failed`, ...).
    pub event: &'static str,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    pub cpu: Option<CpuId>,
    pub node: Option<NodeId>,
    /// Slab base or object address involved in the event.
    pub addr: Option<usize>,
    pub size: Option<usize>,
    /// Free-form details for debugging.
    pub details: String,
}

/// Fields of a record before it is stamped with ids.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogEvent<'a> {
    pub cache: &'a str,
    pub event: &'static str,
    pub outcome: &'static str,
    pub cpu: Option<CpuId>,
    pub node: Option<NodeId>,
    pub addr: Option<usize>,
    pub size: Option<usize>,
}

/// Bounded lifecycle record buffer.
pub(crate) struct LifecycleLog {
    threshold: LogLevel,
    capacity: usize,
    next_decision_id: AtomicU64,
    records: Mutex<VecDeque<LogRecord>>,
}

impl LifecycleLog {
    pub(crate) fn new(threshold: LogLevel, capacity: usize) -> Self {
        Self {
            threshold,
            capacity,
            next_decision_id: AtomicU64::new(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn enabled(&self, level: LogLevel) -> bool {
        level >= self.threshold && self.capacity > 0
    }

    pub(crate) fn record(&self, level: LogLevel, event: LogEvent<'_>, details: impl Into<String>) {
        if !self.enabled(level) {
            return;
        }
        let decision_id = self.next_decision_id.fetch_add(1, Ordering::Relaxed);
        let trace_id = format!("slqb::{}::{}::{:016x}", event.cache, event.event, decision_id);
        let record = LogRecord {
            decision_id,
            trace_id,
            level,
            cache: event.cache.to_string(),
            event: event.event,
            outcome: event.outcome,
            cpu: event.cpu,
            node: event.node,
            addr: event.addr,
            size: event.size,
            details: details.into(),
        };
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub(crate) fn snapshot(&self) -> Vec<LogRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub(crate) fn drain(&self) -> Vec<LogRecord> {
        self.records.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &'static str) -> LogEvent<'static> {
        LogEvent {
            cache: "kmalloc-64",
            event: name,
            outcome: "success",
            ..LogEvent::default()
        }
    }

    #[test]
    fn records_below_threshold_are_dropped() {
        let log = LifecycleLog::new(LogLevel::Info, 16);
        log.record(LogLevel::Debug, event("slab_new"), "");
        log.record(LogLevel::Warn, event("alloc_failed"), "order=0");
        let records = log.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, "alloc_failed");
        assert_eq!(records[0].level, LogLevel::Warn);
        assert!(records[0].trace_id.starts_with("slqb::kmalloc-64::alloc_failed::"));
    }

    #[test]
    fn buffer_keeps_newest_records() {
        let log = LifecycleLog::new(LogLevel::Trace, 3);
        for _ in 0..5 {
            log.record(LogLevel::Info, event("slab_new"), "");
        }
        let ids: Vec<u64> = log.snapshot().iter().map(|r| r.decision_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(log.drain().len(), 3);
        assert!(log.snapshot().is_empty());
    }

    #[test]
    fn zero_capacity_disables_logging() {
        let log = LifecycleLog::new(LogLevel::Trace, 0);
        assert!(!log.enabled(LogLevel::Error));
        log.record(LogLevel::Error, event("double_free"), "");
        assert!(log.snapshot().is_empty());
    }
}
