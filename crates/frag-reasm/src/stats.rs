//! Per-table operation counters.
//!
//! The table is single-owner, so these are plain integers rather than atomics.
//! Readers take a [`StatsSnapshot`], which also carries the table's occupancy.

use serde::Serialize;
use std::fmt;
use std::ops::AddAssign;

#[derive(Debug, Default, Clone)]
pub(crate) struct TableStats {
    /// Lookups that matched a live entry.
    pub find_num: u64,
    pub add_num: u64,
    /// Every removal, whatever the cause.
    pub del_num: u64,
    /// Entries destroyed to free capacity for another group.
    pub reuse_num: u64,
    pub fail_total: u64,
    pub fail_nospace: u64,
}

/// Point-in-time copy of a table's counters and occupancy.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub max_entries: u64,
    pub use_entries: u64,
    pub find_num: u64,
    pub add_num: u64,
    pub del_num: u64,
    pub reuse_num: u64,
    pub fail_total: u64,
    pub fail_nospace: u64,
    pub fail_collision: u64,
}

impl StatsSnapshot {
    pub(crate) fn capture(stats: &TableStats, max_entries: u32, use_entries: u32) -> Self {
        Self {
            max_entries: max_entries as u64,
            use_entries: use_entries as u64,
            find_num: stats.find_num,
            add_num: stats.add_num,
            del_num: stats.del_num,
            reuse_num: stats.reuse_num,
            fail_total: stats.fail_total,
            fail_nospace: stats.fail_nospace,
            fail_collision: stats.fail_total - stats.fail_nospace,
        }
    }

    /// Operator-facing dump, one counter per line.
    pub fn report(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "max entries:\t{};", self.max_entries)?;
        writeln!(f, "entries in use:\t{};", self.use_entries)?;
        writeln!(f, "finds:\t{};", self.find_num)?;
        writeln!(f, "entries added:\t{};", self.add_num)?;
        writeln!(f, "entries deleted:\t{};", self.del_num)?;
        writeln!(f, "entries reused by timeout:\t{};", self.reuse_num)?;
        writeln!(f, "total add failures:\t{};", self.fail_total)?;
        writeln!(f, "add no-space failures:\t{};", self.fail_nospace)?;
        writeln!(f, "add hash-collisions failures:\t{};", self.fail_collision)
    }
}

/// Aggregation across shards.
impl AddAssign<&StatsSnapshot> for StatsSnapshot {
    fn add_assign(&mut self, rhs: &StatsSnapshot) {
        self.max_entries += rhs.max_entries;
        self.use_entries += rhs.use_entries;
        self.find_num += rhs.find_num;
        self.add_num += rhs.add_num;
        self.del_num += rhs.del_num;
        self.reuse_num += rhs.reuse_num;
        self.fail_total += rhs.fail_total;
        self.fail_nospace += rhs.fail_nospace;
        self.fail_collision += rhs.fail_collision;
    }
}
