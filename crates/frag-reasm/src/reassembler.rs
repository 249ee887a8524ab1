//! Fragment matching on top of the fragment table.
//!
//! For every arriving fragment: find or create the group, validate the
//! fragment against what is already recorded, record it, and hand back the
//! whole datagram once `[0, total_len)` is covered. Whatever is rejected or
//! abandoned lands on the death row; nothing is dropped in place.

use serde::{Deserialize, Serialize};
use std::hash::{BuildHasher, Hash};

use crate::death_row::DeathRow;
use crate::entry::FragmentPart;
use crate::error::{ReassemblyError, TableError};
use crate::key::default_hash_state;
use crate::stats::StatsSnapshot;
use crate::table::{EntryId, FragTable, TableConfig};

/// Largest IPv4 datagram.
pub const IPV4_MAX_DATAGRAM: u32 = 65_535;

fn default_max_datagram_len() -> u32 {
    IPV4_MAX_DATAGRAM
}

/// What to do with a fragment that collides with bytes already recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Drop the new fragment, keep the group as it was.
    #[default]
    Reject,
    /// Drop the recorded fragments it collides with, keep the new one.
    Replace,
    /// Drop the new fragment and the whole group.
    Abandon,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassemblyConfig {
    pub table: TableConfig,
    #[serde(default = "default_max_datagram_len")]
    pub max_datagram_len: u32,
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
}

impl ReassemblyConfig {
    pub fn new(table: TableConfig) -> Self {
        Self {
            table,
            max_datagram_len: IPV4_MAX_DATAGRAM,
            overlap_policy: OverlapPolicy::default(),
        }
    }
}

/// One fragment as delivered by the header parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment<B> {
    /// Byte offset of this fragment's payload in the original datagram.
    pub offset: u32,
    pub len: u32,
    /// Cleared on the terminal fragment.
    pub more_fragments: bool,
    pub buf: B,
}

/// A fully reassembled datagram: every fragment, in offset order, contiguous
/// from zero to `total_len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram<K, B> {
    pub key: K,
    pub total_len: u32,
    pub parts: Vec<FragmentPart<B>>,
}

impl<K, B> Datagram<K, B> {
    pub fn into_buffers(self) -> impl Iterator<Item = B> {
        self.parts.into_iter().map(|p| p.buf)
    }
}

impl<K, B: AsRef<[u8]>> Datagram<K, B> {
    /// Copy the payload into one contiguous buffer.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len as usize);
        for p in &self.parts {
            let bytes = p.buf.as_ref();
            out.extend_from_slice(&bytes[..(p.len as usize).min(bytes.len())]);
        }
        out
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Progress<K, B> {
    /// Fragment recorded; the group is still missing bytes.
    Pending { id: EntryId, received: u32 },
    Complete(Datagram<K, B>),
}

/// A fragment table, its death row and sweep cursor, owned by one worker.
pub struct Reassembler<K, B, S = ahash::RandomState> {
    table: FragTable<K, B, S>,
    death_row: DeathRow<B>,
    cursor: u32,
    max_datagram_len: u32,
    policy: OverlapPolicy,
}

impl<K: Hash + Eq, B> Reassembler<K, B> {
    pub fn new(config: &ReassemblyConfig) -> Result<Self, TableError> {
        Self::with_hasher(config, default_hash_state())
    }
}

impl<K: Hash + Eq, B, S: BuildHasher> Reassembler<K, B, S> {
    pub fn with_hasher(config: &ReassemblyConfig, hash_state: S) -> Result<Self, TableError> {
        if config.max_datagram_len == 0 {
            return Err(TableError::InvalidConfiguration(
                "max_datagram_len must be non-zero".into(),
            ));
        }
        let table = FragTable::with_hasher(&config.table, hash_state)?;
        Ok(Self {
            death_row: DeathRow::for_fragments(table.max_fragments() as usize),
            table,
            cursor: 0,
            max_datagram_len: config.max_datagram_len,
            policy: config.overlap_policy,
        })
    }

    pub fn table(&self) -> &FragTable<K, B, S> {
        &self.table
    }

    pub fn death_row(&mut self) -> &mut DeathRow<B> {
        &mut self.death_row
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.table.stats()
    }

    /// Feed one fragment of the datagram identified by `key`.
    pub fn process(
        &mut self,
        key: K,
        frag: Fragment<B>,
        now: u64,
    ) -> Result<Progress<K, B>, ReassemblyError> {
        let id = match self.table.find_or_create(key, now, &mut self.death_row) {
            Ok(lookup) => lookup.id,
            Err(e) => {
                self.death_row.push(frag.buf);
                return Err(e.into());
            }
        };
        let max_fragments = self.table.max_fragments() as usize;
        let max_len = self.max_datagram_len;
        let policy = self.policy;
        let Fragment { offset, len, more_fragments, buf } = frag;

        let entry = self
            .table
            .get_mut(id)
            .expect("find_or_create returned a vacant slot");

        let end = match offset.checked_add(len) {
            Some(end) if end <= max_len => end,
            _ => return Err(self.abandon(id, buf, ReassemblyError::SizeLimitExceeded)),
        };

        let inconsistent = match entry.total_len() {
            Some(total) => end > total || (!more_fragments && end != total),
            None => !more_fragments && entry.max_end() > end,
        };
        if inconsistent {
            return Err(self.abandon(id, buf, ReassemblyError::InconsistentLength));
        }

        if entry.overlaps(offset, len) {
            match policy {
                OverlapPolicy::Reject => {
                    self.death_row.push(buf);
                    return Err(ReassemblyError::OverlapRejected);
                }
                OverlapPolicy::Replace => {
                    let replaced = entry.evict_overlapping(offset, len, &mut self.death_row);
                    tracing::trace!(offset, len, replaced, "fragment replaced overlapping data");
                }
                OverlapPolicy::Abandon => {
                    return Err(self.abandon(id, buf, ReassemblyError::OverlapRejected));
                }
            }
        }

        if entry.buffers_held() >= max_fragments {
            return Err(self.abandon(id, buf, ReassemblyError::TooManyFragments));
        }

        entry.insert(FragmentPart { offset, len, buf });
        if !more_fragments {
            entry.set_total_len(offset, end);
        }

        if !entry.is_complete() {
            return Ok(Progress::Pending { id, received: entry.received_len() });
        }

        let total_len = entry.received_len();
        let (key, parts) = self.table.take(id);
        Ok(Progress::Complete(Datagram { key, total_len, parts }))
    }

    /// One incremental sweep step over the next bucket. Returns the number
    /// of groups evicted for age.
    pub fn sweep(&mut self, now: u64) -> usize {
        // The cursor is only ever advanced by the table, so it stays in range.
        self.table
            .sweep(now, &mut self.death_row, &mut self.cursor)
            .unwrap_or(0)
    }

    /// Release everything on the death row in batches. Returns the count.
    pub fn free_death_row(&mut self, batch: usize) -> usize {
        self.death_row.free_batched(batch, |chunk| chunk.clear())
    }

    /// Evict every in-flight group and hand back the death row holding all
    /// remaining buffers.
    pub fn destroy(self) -> DeathRow<B> {
        let mut death_row = self.death_row;
        self.table.destroy(&mut death_row);
        death_row
    }

    fn abandon(&mut self, id: EntryId, buf: B, err: ReassemblyError) -> ReassemblyError {
        let dropped = self.table.abandon(id, &mut self.death_row);
        self.death_row.push(buf);
        tracing::debug!(error = %err, dropped = dropped + 1, "fragment group abandoned");
        err
    }
}
