//! Prefetcher Tests.
//!
//! Verifies the DCU, stride, and global stream models on hand-built block streams, and the
//! arbiter's queueing, delay, cancellation, repeat filtering, and per-PC scoring.

use std::collections::BTreeMap;

use pretty_assertions::assert_eq;
use rda_stacks::config::{PrefetchConfig, PrefetcherKind};
use rda_stacks::prefetch::arbiter::REPEAT_WINDOW;
use rda_stacks::prefetch::dcu::REQUEST_PROXIMITY;
use rda_stacks::prefetch::stream::STREAM_TABLE_SIZE;
use rda_stacks::prefetch::stride::TABLE_SIZE;
use rda_stacks::prefetch::{
    DcuPrefetcher, GlobalStreamPrefetcher, PrefetchArbiter, Prefetcher, PrefetcherStats,
    StridePrefetcher,
};
use rda_stacks::Distance;

const MISS: Distance = Distance::ColdMiss;
const HIT: Distance = Distance::Finite(0);
const PC: u64 = 0x400;

/// Proposes a fixed block for each listed block.
#[derive(Debug, Default)]
struct Scripted {
    proposals: BTreeMap<u64, u64>,
}

impl Scripted {
    fn boxed(pairs: &[(u64, u64)]) -> Box<dyn Prefetcher> {
        Box::new(Self {
            proposals: pairs.iter().copied().collect(),
        })
    }
}

impl Prefetcher for Scripted {
    fn observe(&mut self, block: u64, _pc: u64, _distance: Distance, _is_write: bool) -> Option<u64> {
        self.proposals.get(&block).copied()
    }

    fn stats(&self) -> PrefetcherStats {
        PrefetcherStats {
            name: "scripted",
            ..PrefetcherStats::default()
        }
    }
}

fn observe_misses(model: &mut dyn Prefetcher, blocks: &[u64]) -> Vec<Option<u64>> {
    blocks.iter().map(|&b| model.observe(b, PC, MISS, false)).collect()
}

// ══════════════════════════════════════════════════════════
// 1. DCU
// ══════════════════════════════════════════════════════════

/// Distinct blocks never trigger a request.
#[test]
fn dcu_ignores_sequential_blocks() {
    let mut dcu = DcuPrefetcher::new();
    let blocks: Vec<u64> = (0..20).collect();
    assert!(observe_misses(&mut dcu, &blocks).iter().all(Option::is_none));
    assert_eq!(dcu.stats().prefetches, 0);
}

/// A block touched again inside the window requests the next block.
#[test]
fn dcu_repeat_requests_next_block() {
    let mut dcu = DcuPrefetcher::new();
    assert_eq!(observe_misses(&mut dcu, &[5, 6, 5]), vec![None, None, Some(6)]);
    assert_eq!(dcu.stats().prefetches, 1);
    assert_eq!(dcu.stats().name, "DCU");
}

/// The window holds the last few blocks only.
#[test]
fn dcu_window_expires() {
    let mut dcu = DcuPrefetcher::new();
    let _ = dcu.observe(5, PC, MISS, false);
    for b in 100..100 + REQUEST_PROXIMITY as u64 - 1 {
        let _ = dcu.observe(b, PC, MISS, false);
    }
    assert_eq!(dcu.observe(5, PC, HIT, false), Some(6));

    let mut dcu = DcuPrefetcher::new();
    let _ = dcu.observe(5, PC, MISS, false);
    for b in 100..100 + REQUEST_PROXIMITY as u64 {
        let _ = dcu.observe(b, PC, MISS, false);
    }
    assert_eq!(dcu.observe(5, PC, HIT, false), None);
}

// ══════════════════════════════════════════════════════════
// 2. Stride
// ══════════════════════════════════════════════════════════

/// A stride repeated once locks on and keeps issuing through hits on its own requests.
#[test]
fn stride_locks_on() {
    let mut stride = StridePrefetcher::new();
    assert_eq!(
        observe_misses(&mut stride, &[1000, 1003, 1006]),
        vec![None, None, Some(1009)]
    );
    assert_eq!(stride.observe(1009, PC, HIT, false), Some(1012));

    let stats = stride.stats();
    assert_eq!(stats.name, "IP stride");
    assert_eq!(stats.prefetches, 2);
    assert_eq!(stats.miss_triggers, 3);
    assert_eq!(stats.prefetch_hit_triggers, 1);
}

/// Negative strides are followed too.
#[test]
fn stride_negative() {
    let mut stride = StridePrefetcher::new();
    assert_eq!(
        observe_misses(&mut stride, &[100, 98, 96]),
        vec![None, None, Some(94)]
    );
}

/// Hits on blocks the model did not request leave the table alone.
#[test]
fn stride_skips_plain_hits() {
    let mut stride = StridePrefetcher::new();
    for b in [10, 11, 12] {
        assert_eq!(stride.observe(b, PC, HIT, false), None);
    }
    assert_eq!(stride.tracked_pcs(), 0);
    assert_eq!(stride.stats().miss_triggers, 0);
}

/// Short reuse distances are hits, long ones are misses.
#[test]
fn stride_short_distances_do_not_train() {
    let mut stride = StridePrefetcher::new();
    for b in [0, 2, 4] {
        assert_eq!(stride.observe(b, PC, Distance::Finite(3), false), None);
    }
    assert_eq!(stride.tracked_pcs(), 0);
    let far = Distance::Finite(1 << 20);
    assert_eq!(
        [0, 2, 4].map(|b| stride.observe(b, PC, far, false)),
        [None, None, Some(6)]
    );
}

/// A zero stride never issues.
#[test]
fn stride_zero_stride() {
    let mut stride = StridePrefetcher::new();
    assert!(observe_misses(&mut stride, &[50; 6]).iter().all(Option::is_none));
    assert_eq!(stride.tracked_pcs(), 1);
}

/// Each instruction has its own entry, up to the table size.
#[test]
fn stride_table_is_bounded() {
    let mut stride = StridePrefetcher::new();
    for pc in 0..TABLE_SIZE as u64 + 44 {
        assert_eq!(stride.observe(pc * 7, pc, MISS, false), None);
    }
    assert_eq!(stride.tracked_pcs(), TABLE_SIZE);
}

/// Interleaved instructions keep separate strides.
#[test]
fn stride_separates_instructions() {
    let mut stride = StridePrefetcher::new();
    let mut issued = Vec::new();
    for i in 0..3 {
        issued.push(stride.observe(1000 + 2 * i, 0x10, MISS, false));
        issued.push(stride.observe(5000 + 9 * i, 0x20, MISS, false));
    }
    assert_eq!(issued, vec![None, None, None, None, Some(1006), Some(5027)]);
}

// ══════════════════════════════════════════════════════════
// 3. Global Stream
// ══════════════════════════════════════════════════════════

/// A constant stride inside the proximity window issues from the third miss on.
#[test]
fn stream_follows_stride() {
    let mut stream = GlobalStreamPrefetcher::new();
    assert_eq!(
        observe_misses(&mut stream, &[1000, 1003, 1006]),
        vec![None, None, Some(1009)]
    );
    assert_eq!(stream.observe(1009, 0x99, HIT, false), Some(1012));
    assert_eq!(stream.stream_count(), 1);
    assert_eq!(stream.stats().name, "global stream");
}

/// Strides that alternate between two values lock on as well.
#[test]
fn stream_follows_alternating_strides() {
    let mut stream = GlobalStreamPrefetcher::new();
    assert_eq!(observe_misses(&mut stream, &[0, 1, 3]), vec![None, None, None]);
    assert_eq!(stream.observe(4, PC, MISS, false), Some(6));
    assert_eq!(stream.observe(6, PC, HIT, false), Some(7));
    assert_eq!(stream.observe(7, PC, HIT, false), Some(9));
    assert_eq!(stream.observe(9, PC, HIT, false), Some(10));
}

/// Misses too far apart each start a new stream and never issue.
#[test]
fn stream_needs_proximity() {
    let mut stream = GlobalStreamPrefetcher::new();
    let blocks: Vec<u64> = (0..5).map(|i| i * 100).collect();
    assert!(observe_misses(&mut stream, &blocks).iter().all(Option::is_none));
    assert_eq!(stream.stream_count(), 5);
}

/// The stream table replaces a stream once it is full.
#[test]
fn stream_table_is_bounded() {
    let mut stream = GlobalStreamPrefetcher::new();
    let blocks: Vec<u64> = (0..STREAM_TABLE_SIZE as u64 + 3).map(|i| i * 1000).collect();
    let _ = observe_misses(&mut stream, &blocks);
    assert_eq!(stream.stream_count(), STREAM_TABLE_SIZE);
}

/// Two streams interleaved by different instructions are both followed.
#[test]
fn stream_interleaved() {
    let mut stream = GlobalStreamPrefetcher::new();
    let mut issued = Vec::new();
    for i in 0..3 {
        issued.push(stream.observe(100 + i, 0x10, MISS, false));
        issued.push(stream.observe(900 + 2 * i, 0x20, MISS, false));
    }
    assert_eq!(issued, vec![None, None, None, None, Some(103), Some(906)]);
    assert_eq!(stream.stream_count(), 2);
}

/// Stores never train a stream.
#[test]
fn stream_ignores_writes() {
    let mut stream = GlobalStreamPrefetcher::new();
    for b in 0..6 {
        assert_eq!(stream.observe(b, PC, MISS, true), None);
    }
    assert_eq!(stream.stream_count(), 0);
    assert_eq!(stream.stats().miss_triggers, 0);
}

// ══════════════════════════════════════════════════════════
// 4. Arbiter
// ══════════════════════════════════════════════════════════

/// Without delay a request is issued by the observation that made it.
#[test]
fn arbiter_issues_immediately() {
    let mut arbiter = PrefetchArbiter::new(0);
    arbiter.add_prefetcher(Scripted::boxed(&[(1, 5)]));
    assert_eq!(arbiter.observe(1, PC, MISS, false), Some(5));
    assert_eq!(arbiter.observe(2, PC, MISS, false), None);

    let report = arbiter.report();
    assert_eq!(report.prefetches, 1);
    assert_eq!(report.pcs.len(), 1);
    assert_eq!(report.pcs[0].pc, PC);
    assert_eq!(report.pcs[0].requests, 1);
}

/// A block requested recently is not requested again until the window passes.
#[test]
fn arbiter_filters_repeats() {
    let mut arbiter = PrefetchArbiter::new(0);
    arbiter.add_prefetcher(Scripted::boxed(&[(1, 5)]));
    assert_eq!(arbiter.observe(1, PC, MISS, false), Some(5));
    for _ in 0..REPEAT_WINDOW - 2 {
        let _ = arbiter.observe(2, PC, MISS, false);
    }
    assert_eq!(arbiter.observe(1, PC, MISS, false), None);
    assert_eq!(arbiter.observe(1, PC, MISS, false), Some(5));
    assert_eq!(arbiter.report().prefetches, 2);
}

/// When two models request at once, the first one wins and the other request is dropped.
#[test]
fn arbiter_first_model_wins() {
    let mut arbiter = PrefetchArbiter::new(0);
    arbiter.add_prefetcher(Scripted::boxed(&[(1, 5)]));
    arbiter.add_prefetcher(Scripted::boxed(&[(1, 8)]));
    assert_eq!(arbiter.prefetcher_count(), 2);
    assert_eq!(arbiter.observe(1, PC, MISS, false), Some(5));
    assert_eq!(arbiter.queued(), 0);

    let report = arbiter.report();
    assert_eq!(report.prefetches, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.prefetchers[0].accepted, 1);
    assert_eq!(report.prefetchers[1].dropped, 1);
}

/// A delayed request waits for its issue time.
#[test]
fn arbiter_delays_requests() {
    let mut arbiter = PrefetchArbiter::new(2);
    arbiter.add_prefetcher(Scripted::boxed(&[(1, 5)]));
    assert_eq!(arbiter.observe(1, PC, MISS, false), None);
    assert_eq!(arbiter.queued(), 1);
    assert_eq!(arbiter.observe(2, PC, MISS, false), None);
    assert_eq!(arbiter.observe(3, PC, MISS, false), Some(5));
    assert_eq!(arbiter.queued(), 0);
}

/// A queued request is canceled when the program references its block first.
#[test]
fn arbiter_cancels_demanded_blocks() {
    let mut arbiter = PrefetchArbiter::new(2);
    arbiter.add_prefetcher(Scripted::boxed(&[(1, 5)]));
    assert_eq!(arbiter.observe(1, PC, MISS, false), None);
    assert_eq!(arbiter.observe(5, PC, MISS, false), None);
    assert_eq!(arbiter.observe(6, PC, MISS, false), None);
    assert_eq!(arbiter.queued(), 0);

    let report = arbiter.report();
    assert_eq!(report.canceled, 1);
    assert_eq!(report.prefetches, 0);
}

/// References to issued blocks are scored per PC as hits or misses.
#[test]
fn arbiter_scores_issued_blocks() {
    let mut arbiter = PrefetchArbiter::new(0);
    arbiter.add_prefetcher(Scripted::boxed(&[(1, 5), (2, 6)]));
    assert_eq!(arbiter.observe(1, 0x10, MISS, false), Some(5));
    let _ = arbiter.observe(5, 0x20, Distance::Finite(3), false);
    assert_eq!(arbiter.observe(2, 0x10, MISS, false), Some(6));
    let _ = arbiter.observe(6, 0x20, Distance::InvalidationMiss, false);
    let _ = arbiter.observe(6, 0x20, HIT, false);

    let pcs: Vec<(u64, u64, u64, u64)> = arbiter
        .report()
        .pcs
        .iter()
        .map(|p| (p.pc, p.requests, p.hits, p.misses))
        .collect();
    assert_eq!(pcs, vec![(0x10, 2, 0, 0), (0x20, 0, 1, 1)]);
}

/// The configured models are built in order.
#[test]
fn arbiter_from_config() {
    let arbiter = PrefetchArbiter::from_config(&PrefetchConfig::default());
    assert_eq!(arbiter.prefetcher_count(), 1);
    assert_eq!(arbiter.report().prefetchers[0].stats.name, "IP stride");

    let config = PrefetchConfig {
        prefetchers: vec![PrefetcherKind::Dcu, PrefetcherKind::GlobalStream],
        delay: 1,
    };
    let mut arbiter = PrefetchArbiter::from_config(&config);
    let _ = arbiter.observe(3, PC, MISS, false);
    assert_eq!(arbiter.observe(3, PC, HIT, false), None);
    assert_eq!(arbiter.observe(9, PC, MISS, false), Some(4));
    let names: Vec<&str> = arbiter
        .report()
        .prefetchers
        .iter()
        .map(|p| p.stats.name)
        .collect();
    assert_eq!(names, vec!["DCU", "global stream"]);
}
