//! Deferred release of buffer handles.
//!
//! Table mutations never drop a buffer in place: whatever an abandoned or
//! evicted group held is pushed here, and the owning worker releases it at a
//! safe point outside the lookup/sweep path, ideally in batches.

/// Number of whole groups a default-sized row can absorb between drains.
pub const DEATH_ROW_LEN: usize = 32;

pub struct DeathRow<B> {
    row: Vec<B>,
}

impl<B> DeathRow<B> {
    pub fn new() -> Self {
        Self { row: Vec::new() }
    }

    /// Pre-size for `DEATH_ROW_LEN` groups of up to `max_fragments` buffers,
    /// plus the arriving fragment that triggered each abandonment.
    pub fn for_fragments(max_fragments: usize) -> Self {
        Self::with_capacity(DEATH_ROW_LEN * (max_fragments + 1))
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { row: Vec::with_capacity(cap) }
    }

    /// Always succeeds; the row grows past its initial size if a burst of
    /// evictions outpaces draining.
    #[inline]
    pub fn push(&mut self, buf: B) {
        self.row.push(buf);
    }

    pub fn len(&self) -> usize {
        self.row.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row.is_empty()
    }

    /// Hand every held buffer to the caller and leave the row empty.
    /// The row keeps its allocation.
    pub fn drain(&mut self) -> std::vec::Drain<'_, B> {
        self.row.drain(..)
    }

    /// Release everything by dropping it.
    pub fn free(&mut self) {
        self.row.clear();
    }

    /// Release in chunks of at most `batch` handles. The callback may drain
    /// the chunk to return buffers to a pool in one go; anything it leaves
    /// behind is dropped. Returns the number of buffers released.
    pub fn free_batched<F>(&mut self, batch: usize, mut release: F) -> usize
    where
        F: FnMut(&mut Vec<B>),
    {
        let batch = batch.max(1);
        let total = self.row.len();
        let mut chunk = Vec::with_capacity(batch.min(total));
        let mut it = self.row.drain(..);
        loop {
            chunk.extend(it.by_ref().take(batch));
            if chunk.is_empty() {
                break;
            }
            release(&mut chunk);
            chunk.clear();
        }
        total
    }
}

impl<B> Default for DeathRow<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_twice_second_is_empty() {
        let mut dr = DeathRow::with_capacity(4);
        dr.push(1u32);
        dr.push(2);
        let first: Vec<u32> = dr.drain().collect();
        assert_eq!(first, vec![1, 2]);
        let second: Vec<u32> = dr.drain().collect();
        assert!(second.is_empty());
        assert!(dr.is_empty());
    }

    #[test]
    fn test_push_grows_past_capacity() {
        let mut dr = DeathRow::with_capacity(1);
        for i in 0..10u32 {
            dr.push(i);
        }
        assert_eq!(dr.len(), 10);
    }

    #[test]
    fn test_free_batched_chunks() {
        let mut dr = DeathRow::new();
        for i in 0..10u32 {
            dr.push(i);
        }
        let mut sizes = Vec::new();
        let mut seen = Vec::new();
        let n = dr.free_batched(4, |chunk| {
            sizes.push(chunk.len());
            seen.extend(chunk.drain(..));
        });
        assert_eq!(n, 10);
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(dr.is_empty());
    }

    #[test]
    fn test_free_batched_empty_row() {
        let mut dr: DeathRow<u32> = DeathRow::for_fragments(4);
        let mut calls = 0;
        assert_eq!(dr.free_batched(8, |_| calls += 1), 0);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_free_drops_everything() {
        use std::rc::Rc;
        let tracked = Rc::new(());
        let mut dr = DeathRow::new();
        dr.push(tracked.clone());
        dr.push(tracked.clone());
        assert_eq!(Rc::strong_count(&tracked), 3);
        dr.free();
        assert_eq!(Rc::strong_count(&tracked), 1);
    }
}
