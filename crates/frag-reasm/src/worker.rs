//! Sharded reassembly workers.
//!
//! Each worker thread exclusively owns one `Reassembler`. The dispatcher
//! hashes a fragment's group key to pick the shard, so every fragment of a
//! datagram lands on the same table and no table is ever shared.
//!
//! Loop per worker: block up to `poll_us` for input, process a burst, run one
//! sweep step, then free the death row. Completed datagrams go to the output
//! channel with `try_send`; a full output channel drops them and counts it.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::clock;
use crate::error::{PoolError, ReassemblyError, TableError};
use crate::key::GroupKey;
use crate::reassembler::{Datagram, Fragment, Progress, ReassemblyConfig, Reassembler};
use crate::stats::StatsSnapshot;

/// Fragments handled per wakeup before the sweep step runs.
const BURST: usize = 64;
/// Death row release batch.
const FREE_BATCH: usize = 32;

/// Seeds for shard selection; independent of bucket placement.
const SHARD_SEEDS: [u64; 4] = [
    0x6a09_e667_f3bc_c908,
    0xbb67_ae85_84ca_a73b,
    0x3c6e_f372_fe94_f82b,
    0xa54f_f53a_5f1d_36f1,
];

fn default_count() -> usize { 1 }
fn default_queue_depth() -> usize { 4096 }
fn default_poll_us() -> u64 { 100 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default = "default_count")]
    pub count: usize,
    /// CPU core per worker, by index. Workers past the end of the list float.
    #[serde(default)]
    pub pin_cores: Vec<usize>,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Receive timeout; bounds how long a quiet worker goes between sweeps.
    #[serde(default = "default_poll_us")]
    pub poll_us: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_count(),
            pin_cores: Vec::new(),
            queue_depth: default_queue_depth(),
            poll_us: default_poll_us(),
        }
    }
}

/// One fragment routed to a worker.
pub struct WorkItem<B> {
    pub key: GroupKey,
    pub fragment: Fragment<B>,
}

/// Live per-worker counters.
/// All atomic writes use Relaxed ordering; these are sampling metrics, not synchronisation.
#[derive(Default)]
pub struct WorkerMetrics {
    pub fragments_in: AtomicU64,
    /// Dropped by the dispatcher because this worker's queue was full.
    pub fragments_dropped: AtomicU64,
    pub datagrams_out: AtomicU64,
    /// Completed but dropped because the output channel was full.
    pub datagrams_dropped: AtomicU64,
    pub overlap_rejected: AtomicU64,
    pub size_exceeded: AtomicU64,
    pub too_many_fragments: AtomicU64,
    pub inconsistent_length: AtomicU64,
    pub table_full: AtomicU64,
    pub bucket_collision: AtomicU64,
    pub timed_out: AtomicU64,
    pub buffers_freed: AtomicU64,
}

/// Plain-struct snapshot of `WorkerMetrics`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerMetricsSnapshot {
    pub fragments_in: u64,
    pub fragments_dropped: u64,
    pub datagrams_out: u64,
    pub datagrams_dropped: u64,
    pub overlap_rejected: u64,
    pub size_exceeded: u64,
    pub too_many_fragments: u64,
    pub inconsistent_length: u64,
    pub table_full: u64,
    pub bucket_collision: u64,
    pub timed_out: u64,
    pub buffers_freed: u64,
}

impl WorkerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record_error(&self, err: &ReassemblyError) {
        let counter = match err {
            ReassemblyError::OverlapRejected => &self.overlap_rejected,
            ReassemblyError::SizeLimitExceeded => &self.size_exceeded,
            ReassemblyError::TooManyFragments => &self.too_many_fragments,
            ReassemblyError::InconsistentLength => &self.inconsistent_length,
            ReassemblyError::Table(TableError::TableFull) => &self.table_full,
            ReassemblyError::Table(TableError::BucketCollision) => &self.bucket_collision,
            ReassemblyError::Table(other) => {
                tracing::warn!(error = %other, "unexpected table error");
                return;
            }
        };
        counter.fetch_add(1, Relaxed);
    }

    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        WorkerMetricsSnapshot {
            fragments_in: self.fragments_in.load(Relaxed),
            fragments_dropped: self.fragments_dropped.load(Relaxed),
            datagrams_out: self.datagrams_out.load(Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Relaxed),
            overlap_rejected: self.overlap_rejected.load(Relaxed),
            size_exceeded: self.size_exceeded.load(Relaxed),
            too_many_fragments: self.too_many_fragments.load(Relaxed),
            inconsistent_length: self.inconsistent_length.load(Relaxed),
            table_full: self.table_full.load(Relaxed),
            bucket_collision: self.bucket_collision.load(Relaxed),
            timed_out: self.timed_out.load(Relaxed),
            buffers_freed: self.buffers_freed.load(Relaxed),
        }
    }
}

impl WorkerMetricsSnapshot {
    /// Fragments that reached a worker but were refused.
    pub fn fragment_errors(&self) -> u64 {
        self.overlap_rejected
            + self.size_exceeded
            + self.too_many_fragments
            + self.inconsistent_length
            + self.table_full
            + self.bucket_collision
    }
}

pub struct WorkerPool<B> {
    senders: Vec<Sender<WorkItem<B>>>,
    handles: Vec<JoinHandle<StatsSnapshot>>,
    metrics: Vec<Arc<WorkerMetrics>>,
    shard_state: ahash::RandomState,
}

impl<B: Send + 'static> WorkerPool<B> {
    /// Build one reassembler per worker and start the threads. Table
    /// configuration errors surface here, before any thread is spawned.
    pub fn start(
        workers: &WorkerConfig,
        reassembly: &ReassemblyConfig,
        out: Sender<Datagram<GroupKey, B>>,
    ) -> Result<Self, PoolError> {
        if workers.count == 0 {
            return Err(TableError::InvalidConfiguration("worker count must be non-zero".into()).into());
        }

        let mut tables = Vec::with_capacity(workers.count);
        for _ in 0..workers.count {
            tables.push(Reassembler::<GroupKey, B>::new(reassembly)?);
        }

        let poll = Duration::from_micros(workers.poll_us.max(1));
        let mut senders = Vec::with_capacity(workers.count);
        let mut handles = Vec::with_capacity(workers.count);
        let mut metrics = Vec::with_capacity(workers.count);

        for (shard, reasm) in tables.into_iter().enumerate() {
            let (tx, rx) = crossbeam_channel::bounded(workers.queue_depth.max(1));
            let m = WorkerMetrics::new();
            let worker_metrics = m.clone();
            let out = out.clone();
            let pin_core = workers.pin_cores.get(shard).copied();

            let handle = std::thread::Builder::new()
                .name(format!("reasm-{}", shard))
                .spawn(move || {
                    if let Some(core) = pin_core {
                        pin_to_core(core);
                    }
                    run_worker(shard, reasm, rx, out, worker_metrics, poll)
                })?;

            senders.push(tx);
            handles.push(handle);
            metrics.push(m);
        }

        Ok(Self {
            senders,
            handles,
            metrics,
            shard_state: ahash::RandomState::with_seeds(
                SHARD_SEEDS[0],
                SHARD_SEEDS[1],
                SHARD_SEEDS[2],
                SHARD_SEEDS[3],
            ),
        })
    }
}

impl<B> WorkerPool<B> {
    pub fn shards(&self) -> usize {
        self.senders.len()
    }

    /// The worker owning `key`. Stable for the pool's lifetime.
    pub fn shard_of(&self, key: &GroupKey) -> usize {
        (self.shard_state.hash_one(key) % self.senders.len() as u64) as usize
    }

    /// Route one fragment to its worker. Returns false if the worker's queue
    /// was full (or the worker is gone) and the fragment was dropped.
    pub fn dispatch(&self, key: GroupKey, fragment: Fragment<B>) -> bool {
        let shard = self.shard_of(&key);
        match self.senders[shard].try_send(WorkItem { key, fragment }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.metrics[shard].fragments_dropped.fetch_add(1, Relaxed);
                false
            }
        }
    }

    pub fn metrics(&self) -> &[Arc<WorkerMetrics>] {
        &self.metrics
    }

    /// Close every input queue, let the workers drain and tear down their
    /// tables, and collect each table's final statistics in shard order.
    pub fn shutdown(self) -> Vec<StatsSnapshot> {
        drop(self.senders);
        let mut out = Vec::with_capacity(self.handles.len());
        for (shard, handle) in self.handles.into_iter().enumerate() {
            match handle.join() {
                Ok(stats) => out.push(stats),
                Err(_) => {
                    tracing::error!(shard, "reassembly worker panicked");
                    out.push(StatsSnapshot::default());
                }
            }
        }
        out
    }
}

fn run_worker<B>(
    shard: usize,
    mut reasm: Reassembler<GroupKey, B>,
    rx: Receiver<WorkItem<B>>,
    out: Sender<Datagram<GroupKey, B>>,
    metrics: Arc<WorkerMetrics>,
    poll: Duration,
) -> StatsSnapshot {
    tracing::info!(
        shard,
        slots = reasm.table().capacity(),
        buckets = reasm.table().bucket_count(),
        "reassembly worker started"
    );

    let handle = |reasm: &mut Reassembler<GroupKey, B>, item: WorkItem<B>| {
        metrics.fragments_in.fetch_add(1, Relaxed);
        match reasm.process(item.key, item.fragment, clock::now_ticks()) {
            Ok(Progress::Pending { .. }) => {}
            Ok(Progress::Complete(datagram)) => match out.try_send(datagram) {
                Ok(()) => {
                    metrics.datagrams_out.fetch_add(1, Relaxed);
                }
                Err(TrySendError::Full(d)) | Err(TrySendError::Disconnected(d)) => {
                    metrics.datagrams_dropped.fetch_add(1, Relaxed);
                    for buf in d.into_buffers() {
                        reasm.death_row().push(buf);
                    }
                }
            },
            Err(e) => metrics.record_error(&e),
        }
    };

    loop {
        match rx.recv_timeout(poll) {
            Ok(item) => {
                handle(&mut reasm, item);
                for item in rx.try_iter().take(BURST - 1) {
                    handle(&mut reasm, item);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let timed_out = reasm.sweep(clock::now_ticks());
        if timed_out > 0 {
            metrics.timed_out.fetch_add(timed_out as u64, Relaxed);
        }
        let freed = reasm.free_death_row(FREE_BATCH);
        if freed > 0 {
            metrics.buffers_freed.fetch_add(freed as u64, Relaxed);
        }
    }

    let stats = reasm.stats();
    tracing::debug!(shard, "final table statistics\n{}", reasm.table().report());
    let mut leftover = reasm.destroy();
    let freed = leftover.free_batched(FREE_BATCH, |chunk| chunk.clear());
    metrics.buffers_freed.fetch_add(freed as u64, Relaxed);
    tracing::info!(shard, in_flight = stats.use_entries, freed, "reassembly worker stopped");
    stats
}

fn pin_to_core(core_id: usize) {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = core_id;
}
