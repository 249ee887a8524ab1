//! Bounded reassembly tables for fragmented datagrams.
//!
//! A [`FragTable`] tracks in-flight fragment groups in a fixed, pre-allocated
//! slot array and evicts groups that outlive a tick budget. A [`Reassembler`]
//! layers fragment matching on top, and a [`WorkerPool`] runs one reassembler
//! per worker thread with fragments sharded by group key.

pub mod clock;
pub mod death_row;
pub mod entry;
pub mod error;
pub mod key;
pub mod reassembler;
pub mod stats;
pub mod table;
pub mod worker;

pub use death_row::DeathRow;
pub use entry::{FragEntry, FragmentPart};
pub use error::{PoolError, ReassemblyError, TableError};
pub use key::GroupKey;
pub use reassembler::{Datagram, Fragment, OverlapPolicy, Progress, ReassemblyConfig, Reassembler};
pub use stats::StatsSnapshot;
pub use table::{EntryId, FragTable, Lookup, Placement, TableConfig};
pub use worker::{WorkerConfig, WorkerMetrics, WorkerMetricsSnapshot, WorkerPool};
