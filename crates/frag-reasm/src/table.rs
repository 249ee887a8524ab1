//! Fixed-capacity bucketed hash table of fragment groups.
//!
//! Layout: one flat slot array, carved into buckets of `bucket_capacity`
//! consecutive slots. Each key has two candidate buckets, one per 32-bit half
//! of its hash, both addressed by masking with `entry_mask`. The array is
//! allocated once at creation and never resized.
//!
//! Timeouts compare `now - created_at` against the budget. Recency (the LRU
//! list and per-slot touch stamps) only breaks ties between eviction
//! candidates. A second list keeps live entries in creation order, so the
//! oldest entry is always at its head.
//!
//! Every removal goes through `retire`, which keeps the occupancy count,
//! both lists and the delete counter in step.

use serde::{Deserialize, Serialize};
use std::hash::{BuildHasher, Hash};
use std::mem;

use crate::death_row::DeathRow;
use crate::entry::{FragEntry, FragmentPart};
use crate::error::TableError;
use crate::key::{default_hash_state, signatures};
use crate::stats::{StatsSnapshot, TableStats};

/// Candidate buckets per key. Total slot count is over-provisioned by this
/// factor so both placements have room.
pub const HASH_FNUM: u64 = 2;

/// Default per-entry fragment cap.
pub const MAX_FRAG_NUM: u32 = 8;

const NIL: u32 = u32::MAX;

fn default_max_fragments() -> u32 {
    MAX_FRAG_NUM
}

/// Creation parameters. Immutable once the table exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Requested bucket count; rounded up to a power of two.
    pub bucket_count: u32,
    /// Slots per bucket; must be a power of two.
    pub bucket_capacity: u32,
    /// Soft cap on live entries.
    pub max_entries: u32,
    /// Maximum entry age in ticks before it may be evicted.
    pub timeout_ticks: u64,
    /// Allocation locality hint (NUMA node). Recorded for the operator;
    /// the global allocator decides actual placement.
    #[serde(default)]
    pub numa_node: Option<u32>,
    #[serde(default = "default_max_fragments")]
    pub max_fragments: u32,
}

impl TableConfig {
    pub fn new(bucket_count: u32, bucket_capacity: u32, max_entries: u32, timeout_ticks: u64) -> Self {
        Self {
            bucket_count,
            bucket_capacity,
            max_entries,
            timeout_ticks,
            numa_node: None,
            max_fragments: MAX_FRAG_NUM,
        }
    }

    /// Check every creation constraint and return the derived slot count:
    /// `bucket_count.next_power_of_two() * bucket_capacity * HASH_FNUM`.
    pub fn validate(&self) -> Result<u32, TableError> {
        if self.bucket_count == 0 {
            return Err(invalid("bucket_count must be non-zero"));
        }
        if !self.bucket_capacity.is_power_of_two() {
            return Err(invalid(format!(
                "bucket_capacity {} is not a power of two",
                self.bucket_capacity
            )));
        }
        if self.max_entries == 0 {
            return Err(invalid("max_entries must be non-zero"));
        }
        if self.max_fragments == 0 {
            return Err(invalid("max_fragments must be non-zero"));
        }

        let nb_entries = (self.bucket_count as u64).next_power_of_two()
            * self.bucket_capacity as u64
            * HASH_FNUM;
        if nb_entries > u32::MAX as u64 {
            return Err(invalid(format!("{} slots exceeds a 32-bit slot count", nb_entries)));
        }
        if nb_entries < self.max_entries as u64 {
            return Err(invalid(format!(
                "max_entries {} exceeds slot capacity {}",
                self.max_entries, nb_entries
            )));
        }
        Ok(nb_entries as u32)
    }
}

fn invalid(msg: impl Into<String>) -> TableError {
    TableError::InvalidConfiguration(msg.into())
}

/// Handle to a live entry: its slot index. Valid until that entry is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u32);

impl EntryId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How `find_or_create` produced its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Matched a live entry for the key.
    Found,
    /// New entry in a free slot.
    Added,
    /// New entry in a slot reclaimed from an expired entry of another key.
    Recycled,
    /// Matched an expired entry for the same key; its fragments were
    /// discarded and it was restarted at `now`.
    Restarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    pub id: EntryId,
    pub placement: Placement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    prev: u32,
    next: u32,
}

impl Link {
    const DETACHED: Link = Link { prev: NIL, next: NIL };
}

/// Head and tail of an intrusive list threaded through the slots.
#[derive(Debug, Clone, Copy)]
struct Ends {
    head: u32,
    tail: u32,
}

impl Ends {
    const EMPTY: Ends = Ends { head: NIL, tail: NIL };
}

#[derive(Debug, Clone, Copy)]
enum Order {
    /// Least recently touched first.
    Recency,
    /// Oldest `created_at` first.
    Creation,
}

struct Slot<K, B> {
    entry: Option<FragEntry<K, B>>,
    /// Fragment storage parked while the slot is vacant.
    spare: Vec<FragmentPart<B>>,
    last_touch: u64,
    lru: Link,
    age: Link,
}

pub struct FragTable<K, B, S = ahash::RandomState> {
    slots: Vec<Slot<K, B>>,
    hash_state: S,
    /// `(nb_entries - 1) & !(bucket_entries - 1)`: maps a signature to the
    /// first slot of a bucket.
    entry_mask: u32,
    bucket_entries: u32,
    nb_entries: u32,
    max_entries: u32,
    use_entries: u32,
    max_cycles: u64,
    max_fragments: u32,
    lru: Ends,
    age: Ends,
    touch_seq: u64,
    stats: TableStats,
}

impl<K: Hash + Eq, B> FragTable<K, B> {
    pub fn new(config: &TableConfig) -> Result<Self, TableError> {
        Self::with_hasher(config, default_hash_state())
    }
}

impl<K: Hash + Eq, B, S: BuildHasher> FragTable<K, B, S> {
    /// Create a table whose bucket placement uses `hash_state`.
    /// Fails without allocating if the configuration is invalid.
    pub fn with_hasher(config: &TableConfig, hash_state: S) -> Result<Self, TableError> {
        let nb_entries = config.validate()?;
        let max_fragments = config.max_fragments as usize;

        let mut slots: Vec<Slot<K, B>> = Vec::new();
        slots
            .try_reserve_exact(nb_entries as usize)
            .map_err(|_| TableError::AllocationFailed)?;
        for _ in 0..nb_entries {
            let mut spare = Vec::new();
            spare
                .try_reserve_exact(max_fragments)
                .map_err(|_| TableError::AllocationFailed)?;
            slots.push(Slot {
                entry: None,
                spare,
                last_touch: 0,
                lru: Link::DETACHED,
                age: Link::DETACHED,
            });
        }

        let bytes = nb_entries as usize
            * (mem::size_of::<Slot<K, B>>() + max_fragments * mem::size_of::<FragmentPart<B>>());
        match config.numa_node {
            Some(node) => tracing::warn!(
                slots = nb_entries,
                bytes,
                numa_node = node,
                "fragment table allocated; locality hint recorded only"
            ),
            None => tracing::info!(slots = nb_entries, bytes, "fragment table allocated"),
        }

        Ok(Self {
            slots,
            hash_state,
            entry_mask: (nb_entries - 1) & !(config.bucket_capacity - 1),
            bucket_entries: config.bucket_capacity,
            nb_entries,
            max_entries: config.max_entries,
            use_entries: 0,
            max_cycles: config.timeout_ticks,
            max_fragments: config.max_fragments,
            lru: Ends::EMPTY,
            age: Ends::EMPTY,
            touch_seq: 0,
            stats: TableStats::default(),
        })
    }

    /// Physical bucket count: the number of `sweep` steps in one full pass.
    pub fn bucket_count(&self) -> u32 {
        self.nb_entries / self.bucket_entries
    }

    pub fn bucket_capacity(&self) -> u32 {
        self.bucket_entries
    }

    /// Total slot count.
    pub fn capacity(&self) -> u32 {
        self.nb_entries
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    pub fn max_fragments(&self) -> u32 {
        self.max_fragments
    }

    pub fn timeout_ticks(&self) -> u64 {
        self.max_cycles
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        self.use_entries as usize
    }

    pub fn is_empty(&self) -> bool {
        self.use_entries == 0
    }

    pub fn get(&self, id: EntryId) -> Option<&FragEntry<K, B>> {
        self.slots.get(id.index())?.entry.as_ref()
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut FragEntry<K, B>> {
        self.slots.get_mut(id.index())?.entry.as_mut()
    }

    /// Locate the live entry for `key` without touching counters or recency.
    pub fn lookup(&self, key: &K) -> Option<EntryId> {
        self.candidate_buckets(key)
            .into_iter()
            .flatten()
            .flat_map(|start| start..start + self.bucket_entries as usize)
            .find(|&i| matches!(&self.slots[i].entry, Some(e) if e.key() == key))
            .map(|i| EntryId(i as u32))
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &FragEntry<K, B>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.entry.as_ref().map(|e| (EntryId(i as u32), e)))
    }

    /// Return the live entry for `key`, creating one if needed.
    ///
    /// Scans both candidate buckets. A match is refreshed to most recent. With
    /// no match, the first free slot is used; with no free slot, the least
    /// recently used expired entry in the candidate buckets is evicted onto
    /// `death_row` and its slot recycled.
    ///
    /// At `max_entries`, a free slot is only usable once something expired
    /// goes: an expired entry in the candidate buckets first, else the oldest
    /// entry in the table.
    pub fn find_or_create(
        &mut self,
        key: K,
        now: u64,
        death_row: &mut DeathRow<B>,
    ) -> Result<Lookup, TableError> {
        let cap = self.bucket_entries as usize;
        let mut matched = None;
        let mut free = None;
        // (slot, last_touch) of the least recently used expired entry.
        let mut stale: Option<(usize, u64)> = None;

        'scan: for start in self.candidate_buckets(&key).into_iter().flatten() {
            for i in start..start + cap {
                let slot = &self.slots[i];
                match &slot.entry {
                    Some(e) if *e.key() == key => {
                        matched = Some(i);
                        break 'scan;
                    }
                    Some(e) => {
                        if self.is_expired(e.created_at(), now)
                            && stale.map_or(true, |(_, t)| slot.last_touch < t)
                        {
                            stale = Some((i, slot.last_touch));
                        }
                    }
                    None => {
                        if free.is_none() {
                            free = Some(i);
                        }
                    }
                }
            }
        }

        if let Some(i) = matched {
            let expired = self.slots[i]
                .entry
                .as_ref()
                .is_some_and(|e| self.is_expired(e.created_at(), now));
            let placement = if expired {
                self.restart(i, now, death_row);
                Placement::Restarted
            } else {
                self.stats.find_num += 1;
                Placement::Found
            };
            self.touch(i);
            return Ok(Lookup { id: EntryId(i as u32), placement });
        }

        let at_cap = self.use_entries >= self.max_entries;
        if let Some(i) = free {
            if !at_cap || (stale.is_none() && self.retire_oldest(now, death_row)) {
                self.occupy(i, key, now);
                return Ok(Lookup { id: EntryId(i as u32), placement: Placement::Added });
            }
        }

        if let Some((i, _)) = stale {
            self.evict(i, death_row);
            self.stats.reuse_num += 1;
            self.occupy(i, key, now);
            return Ok(Lookup { id: EntryId(i as u32), placement: Placement::Recycled });
        }

        self.stats.fail_total += 1;
        if at_cap {
            self.stats.fail_nospace += 1;
            Err(TableError::TableFull)
        } else {
            Err(TableError::BucketCollision)
        }
    }

    /// Remove an entry whose buffers have already been disposed of.
    ///
    /// # Panics
    /// If `id` is not live, or the entry still holds buffers.
    pub fn delete(&mut self, id: EntryId) {
        let i = id.index();
        match self.slots.get(i).and_then(|s| s.entry.as_ref()) {
            None => panic!("delete of vacant fragment table slot {}", i),
            Some(e) => assert!(
                e.buffers_held() == 0,
                "fragment entry deleted while holding {} buffers",
                e.buffers_held()
            ),
        }
        self.vacate(i);
    }

    /// Move the entry's buffers onto `death_row`, then delete it.
    /// Returns how many buffers were moved.
    pub fn abandon(&mut self, id: EntryId, death_row: &mut DeathRow<B>) -> usize {
        let moved = match self.get_mut(id) {
            Some(e) => e.release_into(death_row),
            None => 0,
        };
        self.delete(id);
        moved
    }

    /// Move the entry's key and fragments out to the caller, fragments in
    /// offset order, then delete it.
    ///
    /// # Panics
    /// If `id` is not live.
    pub fn take(&mut self, id: EntryId) -> (K, Vec<FragmentPart<B>>) {
        let i = id.index();
        let Some(mut entry) = self.slots.get_mut(i).and_then(|s| s.entry.take()) else {
            panic!("take of vacant fragment table slot {}", i);
        };
        let parts = entry.take_parts();
        (self.retire(i, entry), parts)
    }

    /// Evict timed-out entries from the bucket at `*cursor`, then advance the
    /// cursor, wrapping to zero after the last bucket. Returns the number of
    /// entries evicted.
    pub fn sweep(
        &mut self,
        now: u64,
        death_row: &mut DeathRow<B>,
        cursor: &mut u32,
    ) -> Result<usize, TableError> {
        let buckets = self.bucket_count();
        if *cursor >= buckets {
            return Err(TableError::CursorOutOfRange { cursor: *cursor, buckets });
        }

        let start = (*cursor * self.bucket_entries) as usize;
        let mut evicted = 0;
        for i in start..start + self.bucket_entries as usize {
            let expired = self.slots[i]
                .entry
                .as_ref()
                .is_some_and(|e| self.is_expired(e.created_at(), now));
            if expired {
                self.evict(i, death_row);
                evicted += 1;
            }
        }

        *cursor = if *cursor + 1 == buckets { 0 } else { *cursor + 1 };
        if evicted > 0 {
            tracing::debug!(bucket = start / self.bucket_entries as usize, evicted, "sweep evicted expired groups");
        }
        Ok(evicted)
    }

    /// Evict every live entry onto `death_row` and release the table.
    pub fn destroy(mut self, death_row: &mut DeathRow<B>) {
        let live = self.use_entries;
        while self.age.head != NIL {
            let head = self.age.head as usize;
            self.evict(head, death_row);
        }
        tracing::info!(evicted = live, buffers = death_row.len(), "fragment table destroyed");
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot::capture(&self.stats, self.max_entries, self.use_entries)
    }

    pub fn report(&self) -> String {
        self.stats().report()
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    #[inline]
    fn is_expired(&self, created_at: u64, now: u64) -> bool {
        now.saturating_sub(created_at) > self.max_cycles
    }

    /// First slot of each candidate bucket; the second is `None` when both
    /// signatures land in the same bucket.
    fn candidate_buckets(&self, key: &K) -> [Option<usize>; 2] {
        let (sig1, sig2) = signatures(&self.hash_state, key);
        let b1 = (sig1 & self.entry_mask) as usize;
        let b2 = (sig2 & self.entry_mask) as usize;
        [Some(b1), (b2 != b1).then_some(b2)]
    }

    fn occupy(&mut self, i: usize, key: K, now: u64) {
        let slot = &mut self.slots[i];
        let storage = mem::take(&mut slot.spare);
        slot.entry = Some(FragEntry::new(key, now, storage));
        self.use_entries += 1;
        self.stats.add_num += 1;
        self.push_back(Order::Recency, i as u32);
        self.push_back(Order::Creation, i as u32);
        self.touch(i);
    }

    fn vacate(&mut self, i: usize) -> Option<K> {
        let entry = self.slots[i].entry.take()?;
        Some(self.retire(i, entry))
    }

    /// The single removal path for an entry already lifted out of slot `i`:
    /// parks its storage, unlinks it from both lists and counts the delete.
    fn retire(&mut self, i: usize, entry: FragEntry<K, B>) -> K {
        let (key, storage) = entry.into_inner();
        self.slots[i].spare = storage;
        self.unlink(Order::Recency, i as u32);
        self.unlink(Order::Creation, i as u32);
        self.use_entries -= 1;
        self.stats.del_num += 1;
        key
    }

    fn evict(&mut self, i: usize, death_row: &mut DeathRow<B>) -> Option<K> {
        let moved = self.slots[i]
            .entry
            .as_mut()
            .map_or(0, |e| e.release_into(death_row));
        tracing::trace!(slot = i, buffers = moved, "evicting fragment group");
        self.vacate(i)
    }

    fn restart(&mut self, i: usize, now: u64, death_row: &mut DeathRow<B>) {
        if let Some(key) = self.evict(i, death_row) {
            self.stats.reuse_num += 1;
            self.occupy(i, key, now);
        }
    }

    /// At the soft cap, evict the oldest entry in the table if it has expired.
    fn retire_oldest(&mut self, now: u64, death_row: &mut DeathRow<B>) -> bool {
        let head = self.age.head;
        if head == NIL {
            return false;
        }
        let expired = self.slots[head as usize]
            .entry
            .as_ref()
            .is_some_and(|e| self.is_expired(e.created_at(), now));
        if expired {
            self.evict(head as usize, death_row);
            self.stats.reuse_num += 1;
        }
        expired
    }

    fn touch(&mut self, i: usize) {
        self.touch_seq += 1;
        self.slots[i].last_touch = self.touch_seq;
        let idx = i as u32;
        if self.lru.tail != idx {
            self.unlink(Order::Recency, idx);
            self.push_back(Order::Recency, idx);
        }
    }

    fn ends(&mut self, order: Order) -> &mut Ends {
        match order {
            Order::Recency => &mut self.lru,
            Order::Creation => &mut self.age,
        }
    }

    fn link(&mut self, idx: u32, order: Order) -> &mut Link {
        let slot = &mut self.slots[idx as usize];
        match order {
            Order::Recency => &mut slot.lru,
            Order::Creation => &mut slot.age,
        }
    }

    fn push_back(&mut self, order: Order, idx: u32) {
        let tail = self.ends(order).tail;
        *self.link(idx, order) = Link { prev: tail, next: NIL };
        if tail == NIL {
            self.ends(order).head = idx;
        } else {
            self.link(tail, order).next = idx;
        }
        self.ends(order).tail = idx;
    }

    fn unlink(&mut self, order: Order, idx: u32) {
        let Link { prev, next } = *self.link(idx, order);
        if prev == NIL {
            if self.ends(order).head == idx {
                self.ends(order).head = next;
            }
        } else {
            self.link(prev, order).next = next;
        }
        if next == NIL {
            if self.ends(order).tail == idx {
                self.ends(order).tail = prev;
            }
        } else {
            self.link(next, order).prev = prev;
        }
        *self.link(idx, order) = Link::DETACHED;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::key::GroupKey;
    use std::hash::Hasher;
    use std::net::Ipv4Addr;

    /// Hasher that returns the last `u64` written, so tests pick buckets.
    #[derive(Default)]
    pub(crate) struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }
        fn write(&mut self, bytes: &[u8]) {
            for b in bytes {
                self.0 = (self.0 << 8) | *b as u64;
            }
        }
        fn write_u64(&mut self, n: u64) {
            self.0 = n;
        }
    }

    #[derive(Default, Clone)]
    pub(crate) struct IdentityState;

    impl BuildHasher for IdentityState {
        type Hasher = IdentityHasher;
        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher::default()
        }
    }

    /// Key with explicit signatures; `tag` distinguishes keys sharing them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TestKey {
        pub sig1: u32,
        pub sig2: u32,
        pub tag: u32,
    }

    impl Hash for TestKey {
        fn hash<H: Hasher>(&self, state: &mut H) {
            state.write_u64(((self.sig2 as u64) << 32) | self.sig1 as u64);
        }
    }

    /// Key whose both candidates are bucket `bucket` (for a given capacity).
    pub(crate) fn key_in(bucket: u32, cap: u32, tag: u32) -> TestKey {
        TestKey { sig1: bucket * cap, sig2: bucket * cap, tag }
    }

    type Table = FragTable<TestKey, u32, IdentityState>;

    fn table(bucket_count: u32, cap: u32, max_entries: u32, timeout: u64) -> Table {
        FragTable::with_hasher(&TableConfig::new(bucket_count, cap, max_entries, timeout), IdentityState)
            .unwrap()
    }

    fn lru_order<K, B, S>(t: &FragTable<K, B, S>) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = t.lru.head;
        while cur != NIL {
            out.push(cur);
            cur = t.slots[cur as usize].lru.next;
        }
        out
    }

    fn age_order<K, B, S>(t: &FragTable<K, B, S>) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = t.age.head;
        while cur != NIL {
            out.push(cur);
            cur = t.slots[cur as usize].age.next;
        }
        out
    }

    fn add_buf(t: &mut Table, id: EntryId, offset: u32, buf: u32) {
        t.get_mut(id).unwrap().insert(FragmentPart { offset, len: 8, buf });
    }

    #[test]
    fn test_create_rejects_non_power_of_two_capacity() {
        let err = TableConfig::new(4, 3, 8, 100).validate().unwrap_err();
        assert!(matches!(err, TableError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_create_rejects_oversized_slot_count() {
        // 2^31 buckets * 2 * 2 = 2^33 slots
        let cfg = TableConfig::new(1 << 31, 2, 8, 100);
        assert!(matches!(cfg.validate(), Err(TableError::InvalidConfiguration(_))));
        let t: Result<Table, _> = FragTable::with_hasher(&cfg, IdentityState);
        assert!(t.is_err());
    }

    #[test]
    fn test_create_rejects_max_entries_above_capacity() {
        // 3 buckets round to 4: 4 * 2 * 2 = 16 slots
        assert_eq!(TableConfig::new(3, 2, 16, 100).validate(), Ok(16));
        assert!(TableConfig::new(3, 2, 17, 100).validate().is_err());
    }

    #[test]
    fn test_create_rejects_zero_values() {
        assert!(TableConfig::new(0, 4, 8, 100).validate().is_err());
        assert!(TableConfig::new(4, 0, 8, 100).validate().is_err());
        assert!(TableConfig::new(4, 4, 0, 100).validate().is_err());
        let mut cfg = TableConfig::new(4, 4, 8, 100);
        cfg.max_fragments = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_layout_derived_from_config() {
        let t = table(2, 4, 8, 100);
        assert_eq!(t.capacity(), 16);
        assert_eq!(t.bucket_count(), 4);
        assert_eq!(t.bucket_capacity(), 4);
        assert_eq!(t.entry_mask, 0b1100);
        assert!(t.is_empty());
        assert!(t.slots.iter().all(|s| s.spare.capacity() >= MAX_FRAG_NUM as usize));
    }

    #[test]
    fn test_five_distinct_keys_all_added() {
        let mut t: FragTable<GroupKey, u32> = FragTable::new(&TableConfig::new(2, 4, 8, 100)).unwrap();
        let mut dr = DeathRow::new();
        for id in 0..5u16 {
            let key = GroupKey::v4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), id, 17);
            let l = t.find_or_create(key, 0, &mut dr).unwrap();
            assert_eq!(l.placement, Placement::Added);
        }
        let s = t.stats();
        assert_eq!(s.add_num, 5);
        assert_eq!(s.find_num, 0);
        assert_eq!(s.use_entries, 5);
        assert_eq!(t.len(), 5);
    }

    #[test]
    fn test_repeat_lookup_is_find_and_refreshes_lru() {
        let mut t = table(2, 4, 8, 100);
        let mut dr = DeathRow::new();
        let a = key_in(0, 4, 1);
        let b = key_in(1, 4, 2);
        let ida = t.find_or_create(a, 0, &mut dr).unwrap().id;
        let idb = t.find_or_create(b, 1, &mut dr).unwrap().id;
        assert_eq!(lru_order(&t), vec![ida.0, idb.0]);

        for n in 0..3 {
            let l = t.find_or_create(a, 2 + n, &mut dr).unwrap();
            assert_eq!(l, Lookup { id: ida, placement: Placement::Found });
            assert_eq!(lru_order(&t).last(), Some(&ida.0));
        }
        let s = t.stats();
        assert_eq!(s.find_num, 3);
        assert_eq!(s.add_num, 2);
        assert_eq!(t.len(), 2);
        // Finding does not move the creation timestamp.
        assert_eq!(t.get(ida).unwrap().created_at(), 0);
    }

    #[test]
    fn test_at_most_one_entry_per_key() {
        let mut t = table(4, 2, 16, 1000);
        let mut dr = DeathRow::new();
        let keys: Vec<TestKey> = (0..12)
            .map(|i| TestKey { sig1: (i % 4) * 2, sig2: ((i + 1) % 4) * 2, tag: i })
            .collect();
        for (n, k) in keys.iter().chain(keys.iter()).enumerate() {
            let _ = t.find_or_create(*k, n as u64, &mut dr);
        }
        let live: Vec<TestKey> = t.iter().map(|(_, e)| *e.key()).collect();
        for k in &live {
            assert_eq!(live.iter().filter(|x| *x == k).count(), 1);
            assert!(t.lookup(k).is_some());
        }
    }

    #[test]
    fn test_second_bucket_used_when_first_full() {
        let mut t = table(2, 2, 8, 100);
        let mut dr = DeathRow::new();
        t.find_or_create(key_in(0, 2, 1), 0, &mut dr).unwrap();
        t.find_or_create(key_in(0, 2, 2), 0, &mut dr).unwrap();
        let k = TestKey { sig1: 0, sig2: 2, tag: 3 };
        let l = t.find_or_create(k, 0, &mut dr).unwrap();
        assert_eq!(l.placement, Placement::Added);
        assert!((2..4).contains(&l.id.index()));
        assert_eq!(t.lookup(&k), Some(l.id));
    }

    #[test]
    fn test_full_bucket_collision_then_recycle_after_timeout() {
        let mut t = table(2, 4, 16, 100);
        let mut dr = DeathRow::new();
        let mut ids = Vec::new();
        for tag in 0..4 {
            let id = t.find_or_create(key_in(0, 4, tag), tag as u64, &mut dr).unwrap().id;
            add_buf(&mut t, id, 0, 100 + tag);
            ids.push(id);
        }

        let newcomer = key_in(0, 4, 99);
        assert_eq!(t.find_or_create(newcomer, 10, &mut dr), Err(TableError::BucketCollision));
        let s = t.stats();
        assert_eq!(s.fail_total, 1);
        assert_eq!(s.fail_nospace, 0);
        assert_eq!(s.fail_collision, 1);

        // Everything is past the budget at 104; the least recently used
        // entry (tag 0) goes.
        let l = t.find_or_create(newcomer, 104, &mut dr).unwrap();
        assert_eq!(l.placement, Placement::Recycled);
        assert_eq!(l.id, ids[0]);
        assert!(t.lookup(&key_in(0, 4, 0)).is_none());
        assert!(t.lookup(&key_in(0, 4, 1)).is_some());
        assert_eq!(dr.drain().collect::<Vec<_>>(), vec![100]);

        let s = t.stats();
        assert_eq!(s.reuse_num, 1);
        assert_eq!(s.add_num, 5);
        assert_eq!(s.del_num, 1);
        assert_eq!(t.len(), 4);
    }

    #[test]
    fn test_lru_breaks_ties_between_expired_entries() {
        let mut t = table(1, 2, 4, 10);
        let mut dr = DeathRow::new();
        let a = key_in(0, 2, 1);
        let b = key_in(0, 2, 2);
        let ida = t.find_or_create(a, 0, &mut dr).unwrap().id;
        let idb = t.find_or_create(b, 0, &mut dr).unwrap().id;
        // Touch `a` again so `b` becomes least recently used.
        assert_eq!(t.find_or_create(a, 5, &mut dr).unwrap().placement, Placement::Found);
        let l = t.find_or_create(key_in(0, 2, 3), 50, &mut dr).unwrap();
        assert_eq!(l.id, idb);
        assert!(t.get(ida).is_some());
    }

    #[test]
    fn test_table_full_at_soft_cap() {
        let mut t = table(2, 4, 2, 100);
        let mut dr = DeathRow::new();
        t.find_or_create(key_in(0, 4, 1), 0, &mut dr).unwrap();
        t.find_or_create(key_in(1, 4, 2), 10, &mut dr).unwrap();
        assert_eq!(t.find_or_create(key_in(2, 4, 3), 20, &mut dr), Err(TableError::TableFull));
        let s = t.stats();
        assert_eq!(s.fail_total, 1);
        assert_eq!(s.fail_nospace, 1);

        // Once the table-wide LRU entry expires it makes room.
        let l = t.find_or_create(key_in(2, 4, 3), 101, &mut dr).unwrap();
        assert_eq!(l.placement, Placement::Added);
        assert!(t.lookup(&key_in(0, 4, 1)).is_none());
        assert_eq!(t.len(), 2);
        assert_eq!(t.stats().reuse_num, 1);
    }

    #[test]
    fn test_soft_cap_recycles_expired_entry_in_own_bucket() {
        let mut t = table(2, 4, 2, 100);
        let mut dr = DeathRow::new();
        let a = key_in(0, 4, 1);
        let b = key_in(1, 4, 2);
        let ida = t.find_or_create(a, 0, &mut dr).unwrap().id;
        t.find_or_create(b, 50, &mut dr).unwrap();
        // `a` is touched last, so `b` heads the recency list.
        t.find_or_create(a, 90, &mut dr).unwrap();

        let l = t.find_or_create(key_in(0, 4, 3), 120, &mut dr).unwrap();
        assert_eq!(l, Lookup { id: ida, placement: Placement::Recycled });
        assert!(t.lookup(&a).is_none());
        assert!(t.lookup(&b).is_some());
        assert_eq!(t.len(), 2);
        let s = t.stats();
        assert_eq!((s.reuse_num, s.fail_total), (1, 0));
    }

    #[test]
    fn test_soft_cap_evicts_oldest_not_least_recent() {
        let mut t = table(2, 4, 2, 100);
        let mut dr = DeathRow::new();
        let a = key_in(0, 4, 1);
        let b = key_in(1, 4, 2);
        let ida = t.find_or_create(a, 0, &mut dr).unwrap().id;
        let idb = t.find_or_create(b, 50, &mut dr).unwrap().id;
        t.find_or_create(a, 90, &mut dr).unwrap();
        assert_eq!(lru_order(&t), vec![idb.0, ida.0]);
        assert_eq!(age_order(&t), vec![ida.0, idb.0]);

        // Nothing expired in bucket 2 itself; `a` is the oldest and past the
        // budget even though `b` was touched less recently.
        let c = key_in(2, 4, 3);
        let l = t.find_or_create(c, 120, &mut dr).unwrap();
        assert_eq!(l.placement, Placement::Added);
        assert!(t.lookup(&a).is_none());
        assert!(t.lookup(&b).is_some());
        assert_eq!(age_order(&t), vec![idb.0, l.id.0]);
        assert_eq!(t.stats().reuse_num, 1);
    }

    #[test]
    fn test_expired_match_restarts_entry() {
        let mut t = table(2, 4, 8, 100);
        let mut dr = DeathRow::new();
        let k = key_in(1, 4, 7);
        let id = t.find_or_create(k, 0, &mut dr).unwrap().id;
        add_buf(&mut t, id, 0, 5);
        let l = t.find_or_create(k, 500, &mut dr).unwrap();
        assert_eq!(l, Lookup { id, placement: Placement::Restarted });
        let e = t.get(id).unwrap();
        assert_eq!(e.created_at(), 500);
        assert_eq!(e.buffers_held(), 0);
        assert_eq!(dr.drain().collect::<Vec<_>>(), vec![5]);
        let s = t.stats();
        assert_eq!((s.add_num, s.del_num, s.reuse_num, s.find_num), (2, 1, 1, 0));
    }

    #[test]
    fn test_delete_updates_counters_and_lru() {
        let mut t = table(2, 4, 8, 100);
        let mut dr = DeathRow::new();
        let id = t.find_or_create(key_in(0, 4, 1), 0, &mut dr).unwrap().id;
        let id2 = t.find_or_create(key_in(1, 4, 2), 0, &mut dr).unwrap().id;
        t.delete(id);
        assert_eq!(t.len(), 1);
        assert_eq!(lru_order(&t), vec![id2.0]);
        assert_eq!(t.stats().del_num, 1);
        assert!(t.get(id).is_none());
        // Storage returned to the slot for the next occupant.
        assert!(t.slots[id.index()].spare.capacity() >= MAX_FRAG_NUM as usize);
    }

    #[test]
    #[should_panic(expected = "holding 1 buffers")]
    fn test_delete_with_buffers_panics() {
        let mut t = table(2, 4, 8, 100);
        let mut dr = DeathRow::new();
        let id = t.find_or_create(key_in(0, 4, 1), 0, &mut dr).unwrap().id;
        add_buf(&mut t, id, 0, 1);
        t.delete(id);
    }

    #[test]
    #[should_panic(expected = "vacant")]
    fn test_delete_vacant_panics() {
        let mut t = table(2, 4, 8, 100);
        t.delete(EntryId(3));
    }

    #[test]
    fn test_abandon_and_take_move_buffers() {
        let mut t = table(2, 4, 8, 100);
        let mut dr = DeathRow::new();
        let a = t.find_or_create(key_in(0, 4, 1), 0, &mut dr).unwrap().id;
        add_buf(&mut t, a, 8, 2);
        add_buf(&mut t, a, 0, 1);
        assert_eq!(t.abandon(a, &mut dr), 2);
        assert_eq!(dr.len(), 2);

        let b = t.find_or_create(key_in(1, 4, 2), 0, &mut dr).unwrap().id;
        add_buf(&mut t, b, 8, 4);
        add_buf(&mut t, b, 0, 3);
        let (key, parts) = t.take(b);
        assert_eq!(key, key_in(1, 4, 2));
        assert_eq!(parts.iter().map(|p| p.buf).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(dr.len(), 2);
        assert!(t.is_empty());
        assert_eq!(t.stats().del_num, 2);
    }

    #[test]
    fn test_sweep_visits_every_bucket_once_then_wraps() {
        let mut t = table(2, 2, 8, 10);
        let mut dr = DeathRow::new();
        for b in 0..4 {
            let id = t.find_or_create(key_in(b, 2, b), 0, &mut dr).unwrap().id;
            add_buf(&mut t, id, 0, b);
        }
        let mut cursor = 0u32;
        let mut visited = Vec::new();
        for _ in 0..t.bucket_count() {
            visited.push(cursor);
            assert_eq!(t.sweep(100, &mut dr, &mut cursor).unwrap(), 1);
        }
        assert_eq!(visited, vec![0, 1, 2, 3]);
        assert_eq!(cursor, 0);
        assert!(t.is_empty());
        assert_eq!(dr.len(), 4);
        assert_eq!(t.stats().del_num, 4);
        assert_eq!(t.stats().reuse_num, 0);
    }

    #[test]
    fn test_sweep_keeps_fresh_entries() {
        let mut t = table(2, 2, 8, 10);
        let mut dr = DeathRow::new();
        t.find_or_create(key_in(0, 2, 1), 0, &mut dr).unwrap();
        t.find_or_create(key_in(0, 2, 2), 95, &mut dr).unwrap();
        let mut cursor = 0;
        assert_eq!(t.sweep(100, &mut dr, &mut cursor).unwrap(), 1);
        assert_eq!(cursor, 1);
        assert!(t.lookup(&key_in(0, 2, 2)).is_some());
    }

    #[test]
    fn test_sweep_age_equal_to_budget_is_not_expired() {
        let mut t = table(1, 2, 4, 10);
        let mut dr = DeathRow::new();
        t.find_or_create(key_in(0, 2, 1), 0, &mut dr).unwrap();
        let mut cursor = 0;
        assert_eq!(t.sweep(10, &mut dr, &mut cursor).unwrap(), 0);
        assert_eq!(t.sweep(11, &mut dr, &mut cursor).unwrap(), 0, "other bucket");
        assert_eq!(t.sweep(11, &mut dr, &mut cursor).unwrap(), 1);
    }

    #[test]
    fn test_sweep_rejects_bad_cursor() {
        let mut t = table(2, 2, 8, 10);
        let mut dr = DeathRow::new();
        let mut cursor = 4;
        assert_eq!(
            t.sweep(0, &mut dr, &mut cursor),
            Err(TableError::CursorOutOfRange { cursor: 4, buckets: 4 })
        );
        assert_eq!(cursor, 4);
    }

    #[test]
    fn test_report_reflects_counters() {
        let mut t = table(2, 4, 8, 100);
        let mut dr = DeathRow::new();
        let k = key_in(0, 4, 1);
        t.find_or_create(k, 0, &mut dr).unwrap();
        t.find_or_create(k, 1, &mut dr).unwrap();
        let report = t.report();
        assert!(report.contains("entries in use:\t1;"));
        assert!(report.contains("finds:\t1;"));
        assert!(report.contains("entries added:\t1;"));
    }

    #[test]
    fn test_destroy_moves_all_buffers() {
        let mut t = table(2, 4, 8, 100);
        let mut dr = DeathRow::new();
        for tag in 0..3 {
            let id = t.find_or_create(key_in(tag, 4, tag), 0, &mut dr).unwrap().id;
            add_buf(&mut t, id, 0, tag * 10);
            add_buf(&mut t, id, 8, tag * 10 + 1);
        }
        t.destroy(&mut dr);
        let mut freed: Vec<u32> = dr.drain().collect();
        freed.sort_unstable();
        assert_eq!(freed, vec![0, 1, 10, 11, 20, 21]);
    }
}
