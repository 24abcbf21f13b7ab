//! Concurrent allocation storms.
//!
//! Each storm runs a fixed number of kmalloc/kfree operations per thread
//! against a fresh allocator over a simulated page source, with every
//! thread bound to its own CPU. A shared live set catches any address
//! handed to two holders at once. After the run every object is freed,
//! the allocator must report zero live objects, and a reclaim pass must
//! bring retained memory back under the empty-slab bound.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use slqb_core::{
    CheckMode, GfpFlags, SimulatedPageSource, SlabInfo, SlqbConfig, SlqbError, Slqb,
    StatsSnapshot, bind_current_cpu,
};
use thiserror::Error;

/// Largest request a storm makes.
const MAX_STORM_SIZE: usize = 64 * 1024;

/// Objects a sawtooth thread accumulates before freeing them all.
const SAWTOOTH_PEAK: usize = 256;

#[derive(Debug, Error)]
pub enum StormError {
    #[error("unknown storm '{0}', expected sawtooth|random_churn|cross_cpu|size_class_thrash|all")]
    UnknownStorm(String),
    #[error("invalid storm configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Allocator(#[from] SlqbError),
    #[error("integrity violation: {0}")]
    Integrity(String),
}

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StormType {
    Sawtooth,
    RandomChurn,
    CrossCpu,
    SizeClassThrash,
}

impl StormType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StormType::Sawtooth => "sawtooth",
            StormType::RandomChurn => "random_churn",
            StormType::CrossCpu => "cross_cpu",
            StormType::SizeClassThrash => "size_class_thrash",
        }
    }

    #[must_use]
    pub fn all() -> [StormType; 4] {
        [
            StormType::Sawtooth,
            StormType::RandomChurn,
            StormType::CrossCpu,
            StormType::SizeClassThrash,
        ]
    }

    /// Parses a storm name; `all` expands to every storm.
    pub fn parse_list(raw: &str) -> Result<Vec<StormType>, StormError> {
        let raw = raw.trim().to_ascii_lowercase();
        if raw == "all" {
            return Ok(Self::all().to_vec());
        }
        Self::all()
            .into_iter()
            .find(|storm| storm.as_str() == raw)
            .map(|storm| vec![storm])
            .ok_or(StormError::UnknownStorm(raw))
    }
}

#[derive(Debug, Clone)]
pub struct StormConfig {
    pub storm: StormType,
    pub threads: usize,
    pub ops_per_thread: usize,
    pub seed: u64,
    pub nodes: u32,
    pub pages_per_node: usize,
    pub check_mode: CheckMode,
}

impl Default for StormConfig {
    fn default() -> Self {
        Self {
            storm: StormType::RandomChurn,
            threads: 4,
            ops_per_thread: 20_000,
            seed: 0x5EED,
            nodes: 2,
            pages_per_node: 1 << 18,
            check_mode: CheckMode::Checked,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StormReport {
    pub storm: &'static str,
    pub threads: usize,
    pub seed: u64,
    pub check_mode: String,
    pub ops: usize,
    pub allocations: usize,
    pub frees: usize,
    pub failed_allocs: usize,
    pub peak_live: usize,
    pub live_after_run: usize,
    pub page_requests: u64,
    pub page_releases: u64,
    pub slabs_released_by_shrink: usize,
    pub outstanding_blocks_after_shrink: usize,
    pub stats: StatsSnapshot,
    /// Caches that formatted at least one slab.
    pub slabinfo: Vec<SlabInfo>,
    pub elapsed_ms: u128,
    pub integrity_ok: bool,
}

#[derive(Debug, Default)]
struct Tally {
    ops: usize,
    allocations: usize,
    frees: usize,
    failed_allocs: usize,
}

struct Shared<'a> {
    slqb: &'a Slqb,
    live: Mutex<HashSet<usize>>,
    live_count: AtomicUsize,
    peak_live: AtomicUsize,
    mailbox: Mutex<Vec<usize>>,
}

impl Shared<'_> {
    fn alloc(&self, size: usize, tally: &mut Tally) -> Result<Option<usize>, StormError> {
        tally.ops += 1;
        let Some(addr) = self.slqb.kmalloc(size, GfpFlags::NOWARN) else {
            tally.failed_allocs += 1;
            return Ok(None);
        };
        let usable = self.slqb.ksize(addr).unwrap_or(0);
        if usable < size {
            return Err(StormError::Integrity(format!(
                "{addr:#x}: ksize {usable} below request {size}"
            )));
        }
        if !self.live.lock().insert(addr) {
            return Err(StormError::Integrity(format!("{addr:#x} handed out twice")));
        }
        let now = self.live_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_live.fetch_max(now, Ordering::Relaxed);
        tally.allocations += 1;
        Ok(Some(addr))
    }

    fn free(&self, addr: usize, tally: &mut Tally) -> Result<(), StormError> {
        tally.ops += 1;
        if !self.live.lock().remove(&addr) {
            return Err(StormError::Integrity(format!("{addr:#x} freed while not live")));
        }
        self.live_count.fetch_sub(1, Ordering::Relaxed);
        self.slqb.kfree(addr)?;
        tally.frees += 1;
        Ok(())
    }
}

fn run_thread(
    shared: &Shared<'_>,
    storm: StormType,
    ops: usize,
    mut rng: XorShift64,
) -> Result<Tally, StormError> {
    let mut tally = Tally::default();
    let mut held: Vec<usize> = Vec::new();
    let mut class_cursor = 0usize;
    let thrash_sizes: Vec<usize> = slqb_core::size_class::active_classes()
        .into_iter()
        .map(|class| class.size())
        .filter(|&size| size <= MAX_STORM_SIZE)
        .collect();

    while tally.ops < ops {
        match storm {
            StormType::Sawtooth => {
                if held.len() < SAWTOOTH_PEAK {
                    let size = rng.gen_range(1, 512);
                    if let Some(addr) = shared.alloc(size, &mut tally)? {
                        held.push(addr);
                    }
                } else {
                    for addr in held.drain(..) {
                        shared.free(addr, &mut tally)?;
                    }
                }
            }
            StormType::RandomChurn => {
                if held.is_empty() || rng.next_u64() % 2 == 0 {
                    let size = rng.gen_range(1, 4096);
                    if let Some(addr) = shared.alloc(size, &mut tally)? {
                        held.push(addr);
                    }
                } else {
                    let idx = rng.gen_range(0, held.len() - 1);
                    let addr = held.swap_remove(idx);
                    shared.free(addr, &mut tally)?;
                }
            }
            StormType::CrossCpu => {
                if rng.next_u64() % 2 == 0 {
                    let size = rng.gen_range(1, 1024);
                    if let Some(addr) = shared.alloc(size, &mut tally)? {
                        shared.mailbox.lock().push(addr);
                    }
                } else {
                    let popped = shared.mailbox.lock().pop();
                    match popped {
                        Some(addr) => shared.free(addr, &mut tally)?,
                        None => tally.ops += 1,
                    }
                }
            }
            StormType::SizeClassThrash => {
                if held.len() < thrash_sizes.len() {
                    let size = thrash_sizes[class_cursor % thrash_sizes.len()];
                    class_cursor += 1;
                    if let Some(addr) = shared.alloc(size, &mut tally)? {
                        held.push(addr);
                    }
                } else {
                    let idx = rng.gen_range(0, held.len() - 1);
                    let addr = held.swap_remove(idx);
                    shared.free(addr, &mut tally)?;
                }
            }
        }
    }

    for addr in held {
        shared.free(addr, &mut tally)?;
    }
    Ok(tally)
}

/// Runs one storm on a fresh allocator.
pub fn run_storm(config: &StormConfig) -> Result<StormReport, StormError> {
    if config.threads == 0 {
        return Err(StormError::InvalidConfig("threads must be at least 1".into()));
    }
    let pages = Arc::new(SimulatedPageSource::new(config.nodes, config.pages_per_node));
    let slqb_config = SlqbConfig {
        check_mode: config.check_mode,
        ..SlqbConfig::default()
    };
    let slqb = Slqb::new(slqb_config, pages.clone())?;
    let shared = Shared {
        slqb: &slqb,
        live: Mutex::new(HashSet::new()),
        live_count: AtomicUsize::new(0),
        peak_live: AtomicUsize::new(0),
        mailbox: Mutex::new(Vec::new()),
    };

    let start = Instant::now();
    let results: Vec<Result<Tally, StormError>> = thread::scope(|s| {
        let handles: Vec<_> = (0..config.threads)
            .map(|t| {
                let shared = &shared;
                let rng = XorShift64::new(config.seed ^ (t as u64).wrapping_mul(0x9E37_79B9));
                s.spawn(move || {
                    bind_current_cpu(t as u32);
                    run_thread(shared, config.storm, config.ops_per_thread, rng)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(StormError::Integrity("storm thread panicked".into())))
            })
            .collect()
    });

    let mut total = Tally::default();
    for result in results {
        let tally = result?;
        total.ops += tally.ops;
        total.allocations += tally.allocations;
        total.frees += tally.frees;
        total.failed_allocs += tally.failed_allocs;
    }
    let leftovers: Vec<usize> = std::mem::take(&mut *shared.mailbox.lock());
    for addr in leftovers {
        shared.free(addr, &mut total)?;
    }
    let elapsed_ms = start.elapsed().as_millis();

    let live_after_run = slqb.live_objects();
    let stats = slqb
        .caches()
        .iter()
        .fold(StatsSnapshot::default(), |mut acc, cache| {
            acc.merge(&cache.stats());
            acc
        });
    let slabs_released_by_shrink = slqb.shrink_all();
    let slabinfo: Vec<SlabInfo> = slqb
        .slabinfo()
        .into_iter()
        .filter(|row| row.num_slabs > 0)
        .collect();
    let retained_bound = slqb.config().empty_slab_buffer * slabinfo.len() * slqb.nodes().len();
    let outstanding_blocks_after_shrink = pages.outstanding_blocks();
    let integrity_ok = live_after_run == 0
        && total.allocations == total.frees
        && outstanding_blocks_after_shrink <= retained_bound;

    Ok(StormReport {
        storm: config.storm.as_str(),
        threads: config.threads,
        seed: config.seed,
        check_mode: format!("{:?}", config.check_mode).to_ascii_lowercase(),
        ops: total.ops,
        allocations: total.allocations,
        frees: total.frees,
        failed_allocs: total.failed_allocs,
        peak_live: shared.peak_live.load(Ordering::Relaxed),
        live_after_run,
        page_requests: pages.requests(),
        page_releases: pages.releases(),
        slabs_released_by_shrink,
        outstanding_blocks_after_shrink,
        stats,
        slabinfo,
        elapsed_ms,
        integrity_ok,
    })
}
