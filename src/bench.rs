//! `fragtop bench`: timed synthetic benchmark with structured JSON output.
//!
//! Generates fragment traffic for a fixed duration, feeds it through the
//! worker pool, verifies every reassembled payload, then emits a JSON report
//! with aggregate and per-shard table statistics.

use anyhow::{Context, Result};
use frag_reasm::{Datagram, GroupKey, StatsSnapshot, WorkerMetricsSnapshot, WorkerPool};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::FragtopConfig;
use crate::traffic::{expected_payload, TrafficGen};

/// Datagrams generated between elapsed-time checks.
const GEN_BATCH: u32 = 256;

#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub started_at: String,
    pub duration_secs: u64,
    pub workers: usize,
    pub traffic: TrafficReport,
    pub datagrams_per_sec: f64,
    pub totals: StatsSnapshot,
    pub shards: Vec<ShardReport>,
}

#[derive(Debug, Serialize)]
pub struct TrafficReport {
    pub datagrams_sent: u64,
    pub fragments_sent: u64,
    pub fragments_lost: u64,
    pub fragments_duplicated: u64,
    pub datagrams_verified: u64,
    pub datagrams_corrupt: u64,
}

#[derive(Debug, Serialize)]
pub struct ShardReport {
    pub shard: usize,
    pub table: StatsSnapshot,
    pub worker: WorkerMetricsSnapshot,
}

#[derive(Default)]
struct Verify {
    ok: AtomicU64,
    corrupt: AtomicU64,
}

pub fn run(config: &FragtopConfig, duration_secs: u64, output: Option<PathBuf>) -> Result<()> {
    config.validate()?;
    let reassembly = config.reassembly_config();

    eprintln!(
        "fragtop bench: running for {}s with {} worker(s), {} flow(s)...",
        duration_secs, config.workers.count, config.traffic.flows
    );

    let (out_tx, out_rx) = crossbeam_channel::bounded::<Datagram<GroupKey, Vec<u8>>>(4096);
    let pool = WorkerPool::start(&config.workers, &reassembly, out_tx)
        .context("failed to start reassembly workers")?;

    // Drain thread
    let verify = Arc::new(Verify::default());
    let drain = {
        let verify = verify.clone();
        std::thread::spawn(move || {
            for d in out_rx {
                if d.assemble() == expected_payload(&d.key, d.total_len) {
                    verify.ok.fetch_add(1, Relaxed);
                } else {
                    tracing::warn!(key = %d.key, total_len = d.total_len, "reassembled payload mismatch");
                    verify.corrupt.fetch_add(1, Relaxed);
                }
            }
        })
    };

    let started_at = chrono::Utc::now().to_rfc3339();
    let mut gen = TrafficGen::new(&config.traffic);
    let start = Instant::now();
    let target = Duration::from_secs(duration_secs);

    // Progress indicator every 10s
    let mut next_tick = 10u64;
    while start.elapsed() < target {
        for _ in 0..GEN_BATCH {
            let (key, frags) = gen.next_datagram();
            for frag in frags {
                if !pool.dispatch(key, frag) {
                    std::thread::yield_now();
                }
            }
        }
        let elapsed = start.elapsed().as_secs();
        if elapsed >= next_tick {
            eprintln!(
                "  ...{}s / {}s  sent={}  verified={}",
                elapsed,
                duration_secs,
                gen.datagrams,
                verify.ok.load(Relaxed)
            );
            next_tick += 10;
        }
    }

    let elapsed_secs = start.elapsed().as_secs_f64();
    let metrics = pool.metrics().to_vec();
    let shard_stats = pool.shutdown();
    // Workers dropped their output senders on exit, so the drain thread ends.
    if drain.join().is_err() {
        anyhow::bail!("verification thread panicked");
    }

    let mut totals = StatsSnapshot::default();
    for s in &shard_stats {
        totals += s;
    }

    let verified = verify.ok.load(Relaxed);
    let report = BenchReport {
        started_at,
        duration_secs,
        workers: shard_stats.len(),
        traffic: TrafficReport {
            datagrams_sent: gen.datagrams,
            fragments_sent: gen.fragments,
            fragments_lost: gen.lost,
            fragments_duplicated: gen.duplicated,
            datagrams_verified: verified,
            datagrams_corrupt: verify.corrupt.load(Relaxed),
        },
        datagrams_per_sec: if elapsed_secs > 0.0 { verified as f64 / elapsed_secs } else { 0.0 },
        totals,
        shards: shard_stats
            .into_iter()
            .zip(metrics.iter())
            .enumerate()
            .map(|(shard, (table, m))| ShardReport {
                shard,
                table,
                worker: m.snapshot(),
            })
            .collect(),
    };

    let json = serde_json::to_string_pretty(&report)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &json)
                .with_context(|| format!("failed to write report: {}", path.display()))?;
            eprintln!("Report written to {}", path.display());
        }
        None => {
            println!("{}", json);
        }
    }

    // Also print a human-readable summary to stderr
    eprintln!();
    eprintln!("=== BENCH SUMMARY ({:.0}s) ===", elapsed_secs);
    eprintln!(
        "  datagrams sent={}  verified={}  corrupt={}  rate={:.0}/s",
        report.traffic.datagrams_sent,
        report.traffic.datagrams_verified,
        report.traffic.datagrams_corrupt,
        report.datagrams_per_sec
    );
    for s in &report.shards {
        eprintln!(
            "  shard {}  frags in={} dropped={}  timed-out={}  errors={}",
            s.shard,
            s.worker.fragments_in,
            s.worker.fragments_dropped,
            s.worker.timed_out,
            s.worker.fragment_errors()
        );
        for line in s.table.report().lines() {
            eprintln!("    {}", line);
        }
    }

    Ok(())
}
