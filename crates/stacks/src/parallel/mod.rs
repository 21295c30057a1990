//! Multithreaded sampled stack.
//!
//! Every instrumented thread owns a [`ParallelSampledStack`] handle on a shared
//! [`ParallelEngine`]. A thread keeps two kinds of state:
//! 1. **Distance sets:** Its own samples, each with the set of blocks it referenced since the
//!    sample started.
//! 2. **Write sets:** One per sample of every other thread, holding the blocks this thread
//!    wrote (private semantics) or referenced (shared semantics) since the last merge.
//!
//! References only touch the calling thread's state. Whenever a sample has to be finalized, a
//! new sample starts, or a merge is requested, the awake threads meet in a three-stage
//! synchronization round:
//! - **Stage 0:** Finalized samples pull their write sets back from every other thread, and a
//!   new sample hands an empty write set to every other thread.
//! - **Stage 1:** Finalized samples fold their write sets into a distance and leave their
//!   owner's list; on a merge, live samples fold and clear their remote write sets. New samples
//!   are linked.
//! - **Stage 2:** Nothing; the round ends. A thread on its first round then builds write sets
//!   for every sample that already existed.
//!
//! A sleeping thread's share of a round is done by the next awake thread.

/// Distance sets, write sets, and finalization marks.
mod sets;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use self::sets::{DistanceSet, FinalizeKind, Finalization, WriteSet};
use crate::common::{Distance, Granularity, RdaError, Result};
use crate::config::{BarrierKind, Config, PruneConfig, Semantics, StatsConfig};
use crate::report::{ParallelReport, ParallelThreadReport, StatsReport};
use crate::sampled::{Leftovers, SampleView};
use crate::stats::{PcStats, StackStats};
use crate::sync::{MultistageBarrier, SerialBarrier, SyncBarrier};

#[derive(Debug)]
struct ThreadStats {
    stats: StackStats,
    read: StackStats,
    invalidations: u64,
    prunes: u64,
    lifetime_total: u64,
}

/// State of one registered thread.
#[derive(Debug)]
struct ThreadSlot {
    tid: usize,
    /// Own samples, oldest first.
    distance_sets: Mutex<Vec<DistanceSet>>,
    write_sets: Mutex<Vec<WriteSet>>,
    stats: Mutex<ThreadStats>,
    sampled_accesses: AtomicU64,
    sync_count: AtomicU64,
    /// Set once the thread holds a write set for every sample of the other threads.
    populated: AtomicBool,
}

impl ThreadSlot {
    fn new(tid: usize, stats_config: &StatsConfig, block_size: u64) -> Self {
        Self {
            tid,
            distance_sets: Mutex::new(Vec::new()),
            write_sets: Mutex::new(Vec::new()),
            stats: Mutex::new(ThreadStats {
                stats: StackStats::new(stats_config, block_size),
                read: StackStats::new(stats_config, block_size),
                invalidations: 0,
                prunes: 0,
                lifetime_total: 0,
            }),
            sampled_accesses: AtomicU64::new(0),
            sync_count: AtomicU64::new(0),
            populated: AtomicBool::new(false),
        }
    }

    fn now(&self) -> u64 {
        self.sampled_accesses.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct SharedStats {
    pc: PcStats,
    read_pc: PcStats,
    last_finalized: Option<Distance>,
}

enum SyncAction {
    None,
    Merge,
    Finalize,
    NewSample(DistanceSet),
}

/// State shared by every [`ParallelSampledStack`] handle.
pub struct ParallelEngine {
    granularity: Granularity,
    semantics: Semantics,
    max_threads: usize,
    prune: Option<PruneConfig>,
    stats_config: StatsConfig,
    barrier: Box<dyn SyncBarrier>,
    slots: RwLock<Vec<Arc<ThreadSlot>>>,
    synchronize: AtomicBool,
    merge_needed: AtomicBool,
    finalize_needed: AtomicBool,
    enabled: AtomicBool,
    active: AtomicI64,
    next_sample_id: AtomicU64,
    shared: Mutex<SharedStats>,
}

impl fmt::Debug for ParallelEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelEngine")
            .field("semantics", &self.semantics)
            .field("threads", &self.thread_count())
            .field("active", &self.active_samples())
            .finish_non_exhaustive()
    }
}

impl ParallelEngine {
    /// Creates an engine with the barrier selected by `config.sampling.barrier`.
    ///
    /// # Errors
    ///
    /// Returns configuration errors from [`Config::validate`].
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let max_threads = config.general.max_threads;
        let barrier: Box<dyn SyncBarrier> = match config.sampling.barrier {
            BarrierKind::Spin => Box::new(MultistageBarrier::new(max_threads)),
            BarrierKind::Serial => Box::new(SerialBarrier::new(max_threads)),
        };
        Self::with_barrier(config, barrier)
    }

    /// Creates an engine synchronizing through `barrier`.
    ///
    /// # Errors
    ///
    /// Returns configuration errors from [`Config::validate`].
    pub fn with_barrier(config: &Config, barrier: Box<dyn SyncBarrier>) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            granularity: config.granularity()?,
            semantics: config.general.semantics,
            max_threads: config.general.max_threads,
            prune: config.sampling.prune,
            stats_config: config.stats.clone(),
            barrier,
            slots: RwLock::new(Vec::new()),
            synchronize: AtomicBool::new(false),
            merge_needed: AtomicBool::new(false),
            finalize_needed: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            active: AtomicI64::new(0),
            next_sample_id: AtomicU64::new(0),
            shared: Mutex::new(SharedStats::default()),
        }))
    }

    /// Registers thread `tid` and returns its handle. Threads register in id order, one at a
    /// time.
    ///
    /// # Errors
    ///
    /// Returns [`RdaError::ThreadOrder`] for an out-of-order id and [`RdaError::TooManyThreads`]
    /// past the thread limit.
    pub fn register_thread(self: &Arc<Self>, tid: usize) -> Result<ParallelSampledStack> {
        let expected = self.thread_count();
        if tid >= self.max_threads {
            return Err(RdaError::TooManyThreads {
                max: self.max_threads,
            });
        }
        if tid != expected {
            return Err(RdaError::ThreadOrder { expected, got: tid });
        }
        let barrier_tid = self.barrier.add_thread()?;
        assert_eq!(barrier_tid, tid, "barrier and engine disagree on thread ids");

        let slot = Arc::new(ThreadSlot::new(
            tid,
            &self.stats_config,
            self.granularity.bytes(),
        ));
        self.slots.write().push(Arc::clone(&slot));
        // Live samples need write sets for the newcomer from here on.
        self.merge_needed.store(true, Ordering::Release);
        self.synchronize.store(true, Ordering::Release);
        info!(tid, "registered parallel sampled stack thread");

        Ok(ParallelSampledStack {
            engine: Arc::clone(self),
            slot,
            tid,
            enabled: true,
            new_thread: true,
        })
    }

    /// Registered threads.
    pub fn thread_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Reference semantics.
    pub const fn semantics(&self) -> Semantics {
        self.semantics
    }

    /// Samples started and not yet finalized.
    pub fn active_samples(&self) -> i64 {
        self.active.load(Ordering::Acquire)
    }

    /// Samples created since the engine started.
    pub fn samples_started(&self) -> u64 {
        self.next_sample_id.load(Ordering::Acquire)
    }

    /// Distance of the most recently finalized sample.
    pub fn last_finalized(&self) -> Option<Distance> {
        self.shared.lock().last_finalized
    }

    /// Enables or disables every thread.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Statistics of thread `tid`.
    pub fn thread_stats(&self, tid: usize) -> Option<StackStats> {
        self.slots
            .read()
            .get(tid)
            .map(|slot| slot.stats.lock().stats.clone())
    }

    /// Records every live sample as a cold miss and drops all write sets. Call only after
    /// every thread has stopped referencing memory.
    ///
    /// # Errors
    ///
    /// Returns statistics counter errors.
    pub fn record_leftovers(&self) -> Result<Leftovers> {
        let mut leftovers = Leftovers::default();
        for slot in self.snapshot() {
            let drained: Vec<DistanceSet> = slot.distance_sets.lock().drain(..).collect();
            slot.write_sets.lock().clear();
            for ds in drained {
                let _ = self.active.fetch_sub(1, Ordering::AcqRel);
                leftovers.count += 1;
                leftovers.distance += ds.set.len() as u64;
                slot.stats.lock().stats.add_sample(Distance::ColdMiss)?;
                self.shared.lock().pc.add_sample(ds.pc, Distance::ColdMiss)?;
            }
        }
        info!(
            count = leftovers.count,
            distance = leftovers.distance,
            "recorded leftover parallel samples as cold misses"
        );
        Ok(leftovers)
    }

    /// Serializable dump of every thread.
    pub fn report(&self) -> ParallelReport {
        let threads = self
            .snapshot()
            .iter()
            .map(|slot| {
                let stats = slot.stats.lock();
                ParallelThreadReport {
                    thread: slot.tid,
                    sampled_accesses: slot.now(),
                    sync_count: slot.sync_count.load(Ordering::Acquire),
                    invalidations: stats.invalidations,
                    prunes: stats.prunes,
                    lifetime_total: stats.lifetime_total,
                    stats: StatsReport::from(&stats.stats),
                    read: StatsReport::from(&stats.read),
                }
            })
            .collect();
        let shared = self.shared.lock();
        ParallelReport {
            semantics: format!("{:?}", self.semantics),
            threads,
            active_samples: self.active_samples(),
            pc: shared.pc.report(),
            read_pc: shared.read_pc.report(),
        }
    }

    fn snapshot(&self) -> Vec<Arc<ThreadSlot>> {
        self.slots.read().clone()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Slots `tid` works on in this round: itself and the sleepers up to the next awake thread.
    fn work_range(&self, tid: usize, count: usize) -> Vec<usize> {
        let adjacent = self.barrier.adjacent_sleepers(tid);
        let mut range = vec![tid];
        let mut t = (tid + 1) % count;
        while t != tid && t != adjacent {
            range.push(t);
            t = (t + 1) % count;
        }
        range
    }

    /// Moves the write sets of every marked sample of `slots[t]` back to their owner.
    fn pull_back_write_sets(slots: &[Arc<ThreadSlot>], t: usize) {
        let mut dsets = slots[t].distance_sets.lock();
        for ds in dsets.iter_mut().filter(|ds| !ds.status.is_active()) {
            for other in slots.iter().filter(|s| s.tid != t) {
                let mut wsets = other.write_sets.lock();
                match wsets.iter().position(|ws| ws.id == ds.id) {
                    Some(i) => ds.merged.push(wsets.swap_remove(i)),
                    None => assert!(
                        !other.populated.load(Ordering::Acquire),
                        "thread {} is missing the write set of sample {}",
                        other.tid,
                        ds.id
                    ),
                }
            }
        }
    }

    /// Hands an empty write set for `ds` to every thread but its owner.
    fn broadcast(slots: &[Arc<ThreadSlot>], owner: usize, ds: &DistanceSet) {
        for other in slots.iter().filter(|s| s.tid != owner) {
            other.write_sets.lock().push(WriteSet::for_sample(ds));
        }
    }

    fn validate_active(&self, slots: &[Arc<ThreadSlot>], has_new: bool) {
        let samples: usize = slots.iter().map(|s| s.distance_sets.lock().len()).sum();
        let active = self.active_samples();
        let bound = samples + slots.len() + usize::from(has_new) + 1;
        assert!(
            usize::try_from(active).is_ok_and(|a| a <= bound),
            "{active} active samples but only {samples} distance sets"
        );
    }

    /// Finalizes the marked samples of `slots[t]` and, on a merge, folds remote write sets
    /// into the live ones.
    fn finalize_and_merge(
        &self,
        slots: &[Arc<ThreadSlot>],
        t: usize,
        merge_needed: bool,
    ) -> Result<()> {
        let slot = &slots[t];
        let mut dsets = slot.distance_sets.lock();
        let mut kept = Vec::with_capacity(dsets.len());
        let mut result = Ok(());
        for mut ds in dsets.drain(..) {
            match ds.status.get() {
                Some(finalization) => {
                    if let Err(e) = self.finalize_sample(slot, ds, finalization) {
                        result = Err(e);
                    }
                }
                None => {
                    if merge_needed {
                        self.merge_remote(slots, t, &mut ds);
                    }
                    kept.push(ds);
                }
            }
        }
        *dsets = kept;
        result
    }

    fn merge_remote(&self, slots: &[Arc<ThreadSlot>], t: usize, ds: &mut DistanceSet) {
        for other in slots.iter().filter(|s| s.tid != t) {
            let mut wsets = other.write_sets.lock();
            match wsets.iter_mut().find(|ws| ws.id == ds.id) {
                Some(ws) => {
                    match self.semantics {
                        Semantics::Private => ds.subtract(&ws.set),
                        Semantics::Shared => ds.union(&ws.set),
                    }
                    ws.set.clear();
                }
                None => assert!(
                    !other.populated.load(Ordering::Acquire),
                    "thread {} is missing the write set of sample {}",
                    other.tid,
                    ds.id
                ),
            }
        }
    }

    fn finalize_sample(
        &self,
        slot: &ThreadSlot,
        mut ds: DistanceSet,
        finalization: Finalization,
    ) -> Result<()> {
        ds.absorb_merged(self.semantics == Semantics::Shared);
        let distance = match finalization.kind {
            FinalizeKind::Invalidate => Distance::InvalidationMiss,
            FinalizeKind::Prune => Distance::ColdMiss,
            FinalizeKind::Reuse | FinalizeKind::RemoteReuse => Distance::Finite(ds.distance()),
        };
        let _ = self.active.fetch_sub(1, Ordering::AcqRel);
        debug!(
            tid = slot.tid,
            sample = ds.id,
            kind = ?finalization.kind,
            %distance,
            "finalized parallel sample"
        );

        {
            let mut stats = slot.stats.lock();
            if finalization.kind == FinalizeKind::Invalidate {
                stats.invalidations += 1;
            }
            stats.lifetime_total += slot.now() - ds.creation_time;
            stats.stats.add_sample(distance)?;
            if !finalization.is_write {
                stats.read.add_sample(distance)?;
            }
        }

        let mut shared = self.shared.lock();
        shared.last_finalized = Some(distance);
        shared.pc.add_sample(finalization.pc, distance)?;
        if !finalization.is_write {
            shared.read_pc.add_sample(finalization.pc, distance)?;
        }
        Ok(())
    }

    /// Gives `own` a write set for every sample of the other threads it does not know yet.
    fn populate(slots: &[Arc<ThreadSlot>], own: &ThreadSlot) {
        let mut known: HashSet<u64> = own.write_sets.lock().iter().map(|ws| ws.id).collect();
        let mut fresh = Vec::new();
        for other in slots.iter().filter(|s| s.tid != own.tid) {
            for ds in other.distance_sets.lock().iter() {
                if known.insert(ds.id) {
                    fresh.push(WriteSet::for_sample(ds));
                }
            }
        }
        debug!(tid = own.tid, write_sets = fresh.len(), "populated new thread");
        own.write_sets.lock().extend(fresh);
        own.populated.store(true, Ordering::Release);
    }
}

/// Per-thread handle on a [`ParallelEngine`].
///
/// # Examples
///
/// ```
/// use rda_stacks::config::{BarrierKind, Config};
/// use rda_stacks::ParallelEngine;
///
/// let mut config = Config::default();
/// config.sampling.barrier = BarrierKind::Serial;
/// let engine = ParallelEngine::new(&config).unwrap();
/// let mut t0 = engine.register_thread(0).unwrap();
///
/// t0.new_sample(0x1000, 0).unwrap();
/// t0.access(0x2000, 0, false).unwrap();
/// assert!(t0.access(0x1000, 0, false).unwrap());
/// assert_eq!(engine.last_finalized(), Some(rda_stacks::Distance::Finite(1)));
/// ```
#[derive(Debug)]
pub struct ParallelSampledStack {
    engine: Arc<ParallelEngine>,
    slot: Arc<ThreadSlot>,
    tid: usize,
    enabled: bool,
    new_thread: bool,
}

impl ParallelSampledStack {
    /// Thread id.
    pub const fn tid(&self) -> usize {
        self.tid
    }

    /// Shared engine.
    pub const fn engine(&self) -> &Arc<ParallelEngine> {
        &self.engine
    }

    /// Enables or disables this thread.
    pub const fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Accesses counted by this thread.
    pub fn sampled_accesses(&self) -> u64 {
        self.slot.now()
    }

    /// Live sample of this thread for the block of `address`.
    pub fn distance_set(&self, address: u64) -> Option<SampleView> {
        let block = self.engine.granularity.block(address);
        let now = self.slot.now();
        self.slot
            .distance_sets
            .lock()
            .iter()
            .find(|ds| ds.block == block)
            .map(|ds| ds.view(now))
    }

    /// Starts a sample on the block of `address`. Ignored while disabled or if this thread
    /// already samples the block.
    ///
    /// # Errors
    ///
    /// Returns statistics and allocation errors.
    pub fn new_sample(&mut self, address: u64, pc: u64) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let block = engine.granularity.block(address);
        if !self.enabled
            || !engine.is_enabled()
            || self.slot.distance_sets.lock().iter().any(|ds| ds.block == block)
        {
            return Ok(());
        }
        let _ = engine.active.fetch_add(1, Ordering::AcqRel);
        engine.synchronize.store(true, Ordering::Release);

        let id = engine.next_sample_id.fetch_add(1, Ordering::AcqRel);
        let ds = DistanceSet::new(id, block, pc, self.slot.now());
        if self.check_oldest_sample()? {
            engine.finalize_needed.store(true, Ordering::Release);
        }
        debug!(tid = self.tid, sample = id, block, "new parallel sample");
        self.sync(SyncAction::NewSample(ds))
    }

    /// Records a reference to the block of `address`.
    ///
    /// # Returns
    ///
    /// `true` when no sample is live anywhere.
    ///
    /// # Errors
    ///
    /// Returns statistics and allocation errors.
    pub fn access(&mut self, address: u64, pc: u64, is_write: bool) -> Result<bool> {
        let engine = Arc::clone(&self.engine);
        if self.new_thread || engine.synchronize.load(Ordering::Acquire) {
            self.sync(SyncAction::None)?;
        }
        if !self.enabled || !engine.is_enabled() {
            return Ok(false);
        }
        let block = engine.granularity.block(address);
        let _ = self.slot.sampled_accesses.fetch_add(1, Ordering::AcqRel);
        let mut finalize = false;

        {
            let mut dsets = self.slot.distance_sets.lock();
            for ds in dsets.iter_mut() {
                if ds.block == block {
                    let _ = ds.status.mark(Finalization {
                        kind: FinalizeKind::Reuse,
                        pc,
                        is_write,
                    });
                    finalize = true;
                } else {
                    ds.record(block)?;
                }
            }
        }

        let remote_kind = match engine.semantics {
            Semantics::Private if is_write => Some(FinalizeKind::Invalidate),
            Semantics::Private => None,
            Semantics::Shared => Some(FinalizeKind::RemoteReuse),
        };
        if let Some(kind) = remote_kind {
            let mut wsets = self.slot.write_sets.lock();
            for ws in wsets.iter_mut() {
                if ws.block == block {
                    let _ = ws.owner.mark(Finalization { kind, pc, is_write });
                    finalize = true;
                } else {
                    ws.record(block)?;
                }
            }
        }

        if finalize {
            engine.finalize_needed.store(true, Ordering::Release);
            engine.synchronize.store(true, Ordering::Release);
            self.sync(SyncAction::Finalize)?;
            assert!(
                self.slot
                    .distance_sets
                    .lock()
                    .iter()
                    .all(|ds| ds.status.get().is_none_or(|f| f.kind != FinalizeKind::Reuse)),
                "thread {} kept a reused sample past finalization",
                self.tid
            );
        }
        Ok(engine.active_samples() == 0)
    }

    /// Folds every remote write set into the live samples.
    ///
    /// # Errors
    ///
    /// Returns statistics errors of samples finalized in the same round.
    pub fn merge_all_samples(&mut self) -> Result<()> {
        self.engine.merge_needed.store(true, Ordering::Release);
        self.engine.synchronize.store(true, Ordering::Release);
        self.sync(SyncAction::Merge)
    }

    /// Leaves the synchronization rounds (for example around a blocking system call).
    pub fn sleep(&self) {
        self.engine.barrier.sleep(self.tid);
    }

    /// Rejoins the synchronization rounds; returns the rounds missed.
    pub fn wake(&self) -> u64 {
        self.engine.barrier.wake(self.tid)
    }

    /// Marks the oldest sample for pruning if it outgrew the target size.
    fn check_oldest_sample(&self) -> Result<bool> {
        let Some(prune) = self.engine.prune else {
            return Ok(false);
        };
        let target = {
            let stats = self.slot.stats.lock();
            if stats.stats.total_samples() <= prune.min_samples {
                return Ok(false);
            }
            stats.stats.target_size(prune.target_rate)?
        };
        let dsets = self.slot.distance_sets.lock();
        let Some(oldest) = dsets.first() else {
            return Ok(false);
        };
        if oldest.status.is_active()
            && oldest.distance() > target
            && oldest.status.mark(Finalization {
                kind: FinalizeKind::Prune,
                pc: oldest.pc,
                is_write: false,
            })
        {
            self.slot.stats.lock().prunes += 1;
            debug!(tid = self.tid, sample = oldest.id, target, "pruned oldest sample");
            return Ok(true);
        }
        Ok(false)
    }

    fn sync(&mut self, action: SyncAction) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let _ = self.slot.sync_count.fetch_add(1, Ordering::AcqRel);
        let generation = engine.barrier.wait_start(self.tid);
        assert!(generation != 0, "thread {} synchronized while asleep", self.tid);

        let merge_needed = engine.merge_needed.load(Ordering::Acquire);
        let finalize_needed = engine.finalize_needed.load(Ordering::Acquire);
        let slots = engine.snapshot();
        let range = if merge_needed || finalize_needed {
            engine.work_range(self.tid, slots.len())
        } else {
            Vec::new()
        };

        // Stage 0
        if finalize_needed {
            for &t in &range {
                ParallelEngine::pull_back_write_sets(&slots, t);
            }
        } else {
            assert!(
                !matches!(action, SyncAction::Finalize),
                "thread {} requested finalization with nothing marked",
                self.tid
            );
        }
        let new_ds = match action {
            SyncAction::NewSample(ds) => {
                ParallelEngine::broadcast(&slots, self.tid, &ds);
                Some(ds)
            }
            SyncAction::None | SyncAction::Merge | SyncAction::Finalize => None,
        };
        engine.validate_active(&slots, new_ds.is_some());
        engine.barrier.wait_stage(1, self.tid);

        // Stage 1
        let mut result = Ok(());
        for &t in &range {
            if let Err(e) = engine.finalize_and_merge(&slots, t, merge_needed) {
                result = Err(e);
            }
        }
        engine.merge_needed.store(false, Ordering::Release);
        engine.finalize_needed.store(false, Ordering::Release);
        engine.synchronize.store(false, Ordering::Release);
        if let Some(ds) = new_ds {
            self.slot.distance_sets.lock().push(ds);
        }
        engine.barrier.wait_stage(2, self.tid);

        if self.new_thread {
            ParallelEngine::populate(&slots, &self.slot);
            self.new_thread = false;
        }
        result
    }
}
