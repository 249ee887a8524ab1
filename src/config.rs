//! `fragtop.toml` configuration.

use anyhow::{Context, Result};
use frag_reasm::clock;
use frag_reasm::{OverlapPolicy, ReassemblyConfig, TableConfig, WorkerConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level fragtop configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FragtopConfig {
    #[serde(default)]
    pub table: TableSection,
    #[serde(default)]
    pub reassembly: ReassemblySection,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
}

/// Per-worker table geometry. Every worker gets an identical table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableSection {
    #[serde(default = "TableSection::default_bucket_count")]
    pub bucket_count: u32,
    /// Must be a power of two.
    #[serde(default = "TableSection::default_bucket_capacity")]
    pub bucket_capacity: u32,
    #[serde(default = "TableSection::default_max_entries")]
    pub max_entries: u32,
    /// Incomplete groups older than this are evicted.
    #[serde(default = "TableSection::default_timeout_ms")]
    pub timeout_ms: u64,
    /// NUMA node hint for table storage.
    #[serde(default)]
    pub numa_node: Option<u32>,
    #[serde(default = "TableSection::default_max_fragments")]
    pub max_fragments: u32,
}

impl TableSection {
    fn default_bucket_count() -> u32 { 1024 }
    fn default_bucket_capacity() -> u32 { 16 }
    fn default_max_entries() -> u32 { 16_384 }
    fn default_timeout_ms() -> u64 { 1_000 }
    fn default_max_fragments() -> u32 { 8 }
}

impl Default for TableSection {
    fn default() -> Self {
        Self {
            bucket_count: Self::default_bucket_count(),
            bucket_capacity: Self::default_bucket_capacity(),
            max_entries: Self::default_max_entries(),
            timeout_ms: Self::default_timeout_ms(),
            numa_node: None,
            max_fragments: Self::default_max_fragments(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReassemblySection {
    #[serde(default = "ReassemblySection::default_max_datagram_len")]
    pub max_datagram_len: u32,
    /// "reject", "replace" or "abandon".
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
}

impl ReassemblySection {
    fn default_max_datagram_len() -> u32 { frag_reasm::reassembler::IPV4_MAX_DATAGRAM }
}

impl Default for ReassemblySection {
    fn default() -> Self {
        Self {
            max_datagram_len: Self::default_max_datagram_len(),
            overlap_policy: OverlapPolicy::default(),
        }
    }
}

/// Synthetic fragment traffic shape for `fragtop bench`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrafficConfig {
    /// Distinct (src, dst) pairs generating datagrams.
    #[serde(default = "TrafficConfig::default_flows")]
    pub flows: u32,
    #[serde(default = "TrafficConfig::default_datagram_len_min")]
    pub datagram_len_min: u32,
    #[serde(default = "TrafficConfig::default_datagram_len_max")]
    pub datagram_len_max: u32,
    /// Payload bytes per fragment; rounded down to a multiple of 8.
    #[serde(default = "TrafficConfig::default_mtu")]
    pub mtu: u32,
    /// Percentage of fragments silently dropped before dispatch.
    #[serde(default)]
    pub loss_pct: f64,
    /// Percentage of fragments sent twice.
    #[serde(default)]
    pub duplicate_pct: f64,
    /// Shuffle the fragments of each datagram.
    #[serde(default = "TrafficConfig::default_reorder")]
    pub reorder: bool,
    #[serde(default = "TrafficConfig::default_seed")]
    pub seed: u64,
}

impl TrafficConfig {
    fn default_flows() -> u32 { 256 }
    fn default_datagram_len_min() -> u32 { 1_500 }
    fn default_datagram_len_max() -> u32 { 9_000 }
    fn default_mtu() -> u32 { 1_480 }
    fn default_reorder() -> bool { true }
    fn default_seed() -> u64 { 0x5eed }
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            flows: Self::default_flows(),
            datagram_len_min: Self::default_datagram_len_min(),
            datagram_len_max: Self::default_datagram_len_max(),
            mtu: Self::default_mtu(),
            loss_pct: 0.0,
            duplicate_pct: 0.0,
            reorder: Self::default_reorder(),
            seed: Self::default_seed(),
        }
    }
}

impl FragtopConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// A config exercising loss and duplicates on two workers.
    pub fn default_example() -> Self {
        Self {
            workers: WorkerConfig { count: 2, ..Default::default() },
            traffic: TrafficConfig {
                loss_pct: 1.0,
                duplicate_pct: 0.5,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Library-facing reassembly settings, with the timeout converted to ticks.
    pub fn reassembly_config(&self) -> ReassemblyConfig {
        let t = &self.table;
        ReassemblyConfig {
            table: TableConfig {
                bucket_count: t.bucket_count,
                bucket_capacity: t.bucket_capacity,
                max_entries: t.max_entries,
                timeout_ticks: clock::ticks_from_millis(t.timeout_ms),
                numa_node: t.numa_node,
                max_fragments: t.max_fragments,
            },
            max_datagram_len: self.reassembly.max_datagram_len,
            overlap_policy: self.reassembly.overlap_policy,
        }
    }

    /// Operator-level checks the library does not make.
    pub fn validate(&self) -> Result<()> {
        let tr = &self.traffic;
        if tr.flows == 0 {
            anyhow::bail!("traffic.flows must be non-zero");
        }
        if tr.mtu < 8 {
            anyhow::bail!("traffic.mtu must be at least 8 bytes");
        }
        if tr.datagram_len_min == 0 || tr.datagram_len_min > tr.datagram_len_max {
            anyhow::bail!(
                "traffic.datagram_len_min ({}) must be non-zero and <= datagram_len_max ({})",
                tr.datagram_len_min,
                tr.datagram_len_max
            );
        }
        if !(0.0..=100.0).contains(&tr.loss_pct) || !(0.0..=100.0).contains(&tr.duplicate_pct) {
            anyhow::bail!("traffic.loss_pct and traffic.duplicate_pct must be within 0..=100");
        }
        if tr.datagram_len_max > self.reassembly.max_datagram_len {
            tracing::warn!(
                datagram_len_max = tr.datagram_len_max,
                max_datagram_len = self.reassembly.max_datagram_len,
                "traffic generates datagrams the tables will reject as oversized"
            );
        }
        Ok(())
    }
}
