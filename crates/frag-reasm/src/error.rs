use thiserror::Error;

/// Failures surfaced by the fragment table itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("invalid table configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to allocate table storage")]
    AllocationFailed,
    /// No free slot and nothing evictable, with the table at `max_entries`.
    #[error("fragment table full")]
    TableFull,
    /// Both candidate buckets saturated with live entries while capacity
    /// remains elsewhere.
    #[error("bucket collision: candidate buckets saturated")]
    BucketCollision,
    #[error("sweep cursor {cursor} out of range (bucket count {buckets})")]
    CursorOutOfRange { cursor: u32, buckets: u32 },
}

/// Per-fragment outcomes that drop the fragment and possibly its group.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("fragment overlaps bytes already recorded")]
    OverlapRejected,
    #[error("datagram exceeds the maximum reassembled size")]
    SizeLimitExceeded,
    #[error("too many fragments for one datagram")]
    TooManyFragments,
    #[error("fragment disagrees with the recorded total length")]
    InconsistentLength,
}

/// Errors starting a worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] TableError),
    #[error("failed to spawn reassembly worker: {0}")]
    Spawn(#[from] std::io::Error),
}
