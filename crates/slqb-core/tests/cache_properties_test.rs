//! End-to-end properties of the allocator over a simulated page source.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use slqb_core::{
    CacheFlags, GfpFlags, SimulatedPageSource, SlqbConfig, SlqbError, Slqb, bind_current_cpu,
};

fn instance(nodes: u32, pages_per_node: usize) -> (Arc<SimulatedPageSource>, Slqb) {
    let pages = Arc::new(SimulatedPageSource::new(nodes, pages_per_node));
    let slqb = Slqb::new(SlqbConfig::default(), pages.clone()).expect("init");
    (pages, slqb)
}

#[derive(Clone, Copy, Debug)]
struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.state >> 33
    }
}

#[test]
fn sixty_four_byte_cache_scenario() {
    let (pages, slqb) = instance(1, 1 << 20);
    let cache = slqb
        .cache_create("test-64", 64, 8, CacheFlags::empty(), None)
        .expect("create");
    assert_eq!(cache.objects(), 64);

    let mut seen = HashSet::new();
    for _ in 0..1000 {
        let addr = cache.allocate_on(0, GfpFlags::empty(), None).expect("alloc");
        assert_eq!(addr % 64, 0, "{addr:#x} misaligned");
        assert!(seen.insert(addr), "{addr:#x} handed out twice");
    }
    assert_eq!(cache.stats().alloc_newpage, 16);
    assert_eq!(pages.requests(), 16);
    assert_eq!(cache.live_objects(), 1000);
}

#[test]
fn alloc_free_pairs_use_one_slab() {
    let (pages, slqb) = instance(1, 1 << 20);
    let cache = slqb
        .cache_create("pairs", 256, 0, CacheFlags::empty(), None)
        .expect("create");
    for _ in 0..5000 {
        let addr = cache.allocate_on(0, GfpFlags::empty(), None).expect("alloc");
        cache.free_on(0, addr).expect("free");
    }
    assert_eq!(pages.requests(), 1);
    assert_eq!(cache.live_objects(), 0);
}

#[test]
fn remote_free_is_visible_on_next_allocation() {
    let (_, slqb) = instance(1, 1 << 20);
    let cache = slqb
        .cache_create("remote", 1024, 0, CacheFlags::empty(), None)
        .expect("create");
    // four objects per slab; one batch empties cpu 0's local list
    let held: Vec<usize> = (0..cache.batch())
        .map(|_| cache.allocate_on(0, GfpFlags::empty(), None).expect("alloc"))
        .collect();
    for addr in &held {
        cache.free_on(1, *addr).expect("remote free");
    }
    let next = cache.allocate_on(0, GfpFlags::empty(), None).expect("next");
    assert!(held.contains(&next));
    let stats = cache.stats();
    assert_eq!(stats.free_remote, 16);
    assert_eq!(stats.free_flush_rcache, 1);
    assert_eq!(stats.alloc_process_rfree, 1);
    assert_eq!(stats.alloc_newpage, 4);
}

#[test]
fn double_free_is_detected_across_cpus() {
    let (_, slqb) = instance(1, 1 << 20);
    let cache = slqb.find_cache("kmalloc-128").expect("kmalloc-128");
    let addr = cache.allocate_on(0, GfpFlags::empty(), None).expect("alloc");
    cache.free_on(1, addr).expect("first free");
    assert_eq!(cache.free_on(2, addr), Err(SlqbError::DoubleFree { addr }));
    assert_eq!(cache.free_on(0, addr), Err(SlqbError::DoubleFree { addr }));
    let other = slqb.find_cache("kmalloc-256").expect("kmalloc-256");
    let foreign = other.allocate_on(0, GfpFlags::empty(), None).expect("alloc");
    assert_eq!(
        cache.free_on(0, foreign),
        Err(SlqbError::ForeignPointer { addr: foreign })
    );
    assert!(
        slqb.lifecycle_logs()
            .iter()
            .any(|r| r.event == "free" && r.outcome == "double_free")
    );
}

#[test]
fn out_of_memory_at_budget() {
    let (pages, slqb) = instance(1, 4);
    let cache = slqb
        .cache_create("pages", 4096, 0, CacheFlags::empty(), None)
        .expect("create");
    assert_eq!((cache.order(), cache.objects()), (0, 1));
    let held: Vec<usize> = (0..4)
        .map(|_| cache.allocate_on(0, GfpFlags::empty(), None).expect("alloc"))
        .collect();
    assert!(matches!(
        cache.allocate_on(0, GfpFlags::empty(), None),
        Err(SlqbError::OutOfMemory { order: 0, .. })
    ));
    assert_eq!(cache.stats().alloc_failed, 1);
    assert_eq!(pages.failures(), 1);

    cache.free_on(0, held[0]).expect("free");
    assert_eq!(cache.allocate_on(0, GfpFlags::empty(), None), Ok(held[0]));
}

#[test]
fn shrink_bounds_retained_slabs() {
    let (pages, slqb) = instance(2, 1 << 20);
    let cache = slqb
        .cache_create("reclaim", 512, 0, CacheFlags::empty(), None)
        .expect("create");
    let mut held = Vec::new();
    for cpu in 0..4 {
        for _ in 0..100 {
            held.push(cache.allocate_on(cpu, GfpFlags::empty(), None).expect("alloc"));
        }
    }
    for (i, addr) in held.iter().enumerate() {
        cache.free_on((i % 5) as u32, *addr).expect("free");
    }
    cache.shrink();

    let keep = slqb.config().empty_slab_buffer;
    for (node, counts) in cache.node_counts() {
        assert!(counts.nr_empty <= keep, "node {node} kept {}", counts.nr_empty);
        assert_eq!(counts.objects_in_use, 0);
        assert_eq!(counts.nr_slabs, counts.nr_empty);
    }
    assert!(pages.outstanding_blocks() <= keep * 2);
    assert_eq!(cache.live_objects(), 0);
}

#[test]
fn threads_never_share_live_objects() {
    const THREADS: usize = 8;
    const PAIRS: usize = 4000;
    const KEEP: usize = 16;

    let (_, slqb) = instance(2, 1 << 20);
    let cache = slqb
        .cache_create("storm", 96, 0, CacheFlags::HWCACHE_ALIGN, None)
        .expect("create");
    let live = Mutex::new(HashSet::new());

    thread::scope(|s| {
        for t in 0..THREADS {
            let cache = &cache;
            let live = &live;
            s.spawn(move || {
                bind_current_cpu(t as u32);
                let mut held = std::collections::VecDeque::new();
                for _ in 0..PAIRS {
                    let addr = cache.allocate(GfpFlags::empty()).expect("alloc");
                    assert!(live.lock().insert(addr), "{addr:#x} live twice");
                    held.push_back(addr);
                    if held.len() > KEEP {
                        let old = held.pop_front().unwrap();
                        assert!(live.lock().remove(&old));
                        cache.free(old).expect("free");
                    }
                }
            });
        }
    });

    assert_eq!(live.lock().len(), THREADS * KEEP);
    assert_eq!(cache.live_objects(), THREADS * KEEP);
}

#[test]
fn cross_thread_frees_keep_exact_count() {
    const THREADS: usize = 6;
    const OPS: usize = 5000;

    let (_, slqb) = instance(1, 1 << 20);
    let cache = slqb.find_cache("kmalloc-32").expect("kmalloc-32");
    let live = Mutex::new(HashSet::new());
    let mailbox = Mutex::new(Vec::new());

    thread::scope(|s| {
        for t in 0..THREADS {
            let cache = &cache;
            let live = &live;
            let mailbox = &mailbox;
            s.spawn(move || {
                bind_current_cpu(100 + t as u32);
                let mut rng = Lcg::new(t as u64 + 1);
                for _ in 0..OPS {
                    if rng.next() % 2 == 0 {
                        let addr = cache.allocate(GfpFlags::empty()).expect("alloc");
                        assert!(live.lock().insert(addr));
                        mailbox.lock().push(addr);
                    } else {
                        let Some(addr) = mailbox.lock().pop() else {
                            continue;
                        };
                        assert!(live.lock().remove(&addr));
                        cache.free(addr).expect("free");
                    }
                }
            });
        }
    });

    let leftover = mailbox.into_inner();
    assert_eq!(cache.live_objects(), leftover.len());
    for addr in leftover {
        cache.free(addr).expect("free leftover");
    }
    assert_eq!(cache.live_objects(), 0);
    assert!(cache.stats().free_remote > 0);
}

fn replay(seed: u64) -> Vec<(bool, usize)> {
    let (_, slqb) = instance(1, 1 << 20);
    let cache = slqb
        .cache_create("trace", 48, 0, CacheFlags::empty(), None)
        .expect("create");
    let mut rng = Lcg::new(seed);
    let mut held: Vec<usize> = Vec::new();
    let mut trace = Vec::new();
    for _ in 0..3000 {
        let cpu = (rng.next() % 4) as u32;
        if held.is_empty() || rng.next() % 3 != 0 {
            let addr = cache.allocate_on(cpu, GfpFlags::empty(), None).expect("alloc");
            trace.push((true, addr));
            held.push(addr);
        } else {
            let idx = rng.next() as usize % held.len();
            let addr = held.swap_remove(idx);
            cache.free_on(cpu, addr).expect("free");
            trace.push((false, addr));
        }
    }
    assert_eq!(cache.live_objects(), held.len());
    trace
}

#[test]
fn lcg_trace_is_deterministic() {
    assert_eq!(replay(0x5EED), replay(0x5EED));
    assert_ne!(replay(1), replay(2));
}

#[test]
fn offline_cpu_returns_everything() {
    let (_, slqb) = instance(2, 1 << 20);
    slqb.cpu_online(7, 1).expect("online");
    let cache = slqb
        .cache_create("hotplug", 200, 0, CacheFlags::empty(), None)
        .expect("create");
    let held: Vec<usize> = (0..50)
        .map(|_| cache.allocate_on(7, GfpFlags::empty(), None).expect("alloc"))
        .collect();
    for addr in &held[..25] {
        cache.free_on(7, *addr).expect("free");
    }
    // fewer than a batch, so cpu 8 still holds them for cpu 7
    for addr in &held[25..] {
        cache.free_on(8, *addr).expect("remote free");
    }
    let before = cache.stats();
    assert_eq!(before.free_flush_rcache, 0);
    slqb.cpu_offline(7);
    assert_eq!(cache.cpu_stats(7), None);
    assert_eq!(cache.stats().alloc_newpage, before.alloc_newpage);
    assert_eq!(cache.slab_info().active_objs, 25);
    cache.shrink();
    assert_eq!(cache.slab_info().active_objs, 0);
    assert_eq!(cache.live_objects(), 0);
    assert!(
        slqb.lifecycle_logs()
            .iter()
            .any(|r| r.event == "cpu_offline" && r.cpu == Some(7))
    );
}
