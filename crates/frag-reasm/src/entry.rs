//! Fragment group entries: the table's record of one in-flight reassembly.

use crate::death_row::DeathRow;

/// One received fragment: where its bytes sit in the original datagram and
/// the buffer that carries them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPart<B> {
    pub offset: u32,
    pub len: u32,
    pub buf: B,
}

impl<B> FragmentPart<B> {
    #[inline]
    pub fn end(&self) -> u32 {
        self.offset + self.len
    }
}

/// Live reassembly state for one group key.
///
/// Parts are kept sorted by offset and never overlap, so the byte count
/// received equals the coverage of `[0, total_len)` once that is known.
#[derive(Debug)]
pub struct FragEntry<K, B> {
    key: K,
    created_at: u64,
    parts: Vec<FragmentPart<B>>,
    total_len: Option<u32>,
    /// Offset of the fragment that carried the terminal flag.
    terminal_at: Option<u32>,
    received: u32,
}

impl<K, B> FragEntry<K, B> {
    /// `parts` is the slot's pre-reserved (empty) fragment storage.
    pub(crate) fn new(key: K, now: u64, parts: Vec<FragmentPart<B>>) -> Self {
        debug_assert!(parts.is_empty());
        Self {
            key,
            created_at: now,
            parts,
            total_len: None,
            terminal_at: None,
            received: 0,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn fragments(&self) -> &[FragmentPart<B>] {
        &self.parts
    }

    /// Number of buffer handles this entry currently owns.
    pub fn buffers_held(&self) -> usize {
        self.parts.len()
    }

    pub fn received_len(&self) -> u32 {
        self.received
    }

    /// Known once the fragment without the more-fragments flag has arrived.
    pub fn total_len(&self) -> Option<u32> {
        self.total_len
    }

    /// End of the furthest fragment recorded so far.
    pub fn max_end(&self) -> u32 {
        self.parts.last().map_or(0, FragmentPart::end)
    }

    pub fn is_complete(&self) -> bool {
        self.total_len == Some(self.received)
    }

    /// Whether `[offset, offset + len)` collides with a recorded fragment.
    /// A fragment starting at an already-recorded offset always collides,
    /// even when empty.
    pub fn overlaps(&self, offset: u32, len: u32) -> bool {
        let end = offset.saturating_add(len);
        self.parts
            .iter()
            .any(|p| p.offset == offset || (offset < p.end() && p.offset < end))
    }

    /// Record the total length implied by the terminal fragment at
    /// `terminal_offset`.
    pub(crate) fn set_total_len(&mut self, terminal_offset: u32, total: u32) {
        self.total_len = Some(total);
        self.terminal_at = Some(terminal_offset);
    }

    /// Record a fragment in offset order. The caller has already checked
    /// for overlap and fragment-count limits.
    pub(crate) fn insert(&mut self, part: FragmentPart<B>) {
        let pos = self.parts.partition_point(|p| p.offset < part.offset);
        self.received += part.len;
        self.parts.insert(pos, part);
    }

    /// Drop every recorded fragment colliding with `[offset, offset + len)`
    /// onto the death row. Returns how many were removed. Removing the
    /// terminal fragment forgets the total length until another arrives.
    pub(crate) fn evict_overlapping(
        &mut self,
        offset: u32,
        len: u32,
        death_row: &mut DeathRow<B>,
    ) -> usize {
        let end = offset.saturating_add(len);
        let before = self.parts.len();
        let mut i = 0;
        while i < self.parts.len() {
            let p = &self.parts[i];
            if p.offset == offset || (offset < p.end() && p.offset < end) {
                let p = self.parts.remove(i);
                self.received -= p.len;
                if self.terminal_at == Some(p.offset) {
                    self.total_len = None;
                    self.terminal_at = None;
                }
                death_row.push(p.buf);
            } else {
                i += 1;
            }
        }
        before - self.parts.len()
    }

    /// Move every held buffer onto the death row.
    pub(crate) fn release_into(&mut self, death_row: &mut DeathRow<B>) -> usize {
        let n = self.parts.len();
        for p in self.parts.drain(..) {
            death_row.push(p.buf);
        }
        self.received = 0;
        n
    }

    /// Move every held fragment out to the caller, in offset order.
    pub(crate) fn take_parts(&mut self) -> Vec<FragmentPart<B>> {
        self.received = 0;
        self.parts.drain(..).collect()
    }

    /// Tear down an emptied entry, handing back its key and the fragment
    /// storage for reuse by the next occupant of the slot.
    pub(crate) fn into_inner(self) -> (K, Vec<FragmentPart<B>>) {
        (self.key, self.parts)
    }
}
