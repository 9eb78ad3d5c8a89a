//! Page allocation segments.
//!
//! [`RandomAllocationSegment`] allocates pages in place.
//! [`VersionedAllocationSegment`] stages its allocation metadata per
//! transaction and keeps version chains; [`SnapshotSegment`] is one
//! transaction's view over it.

pub(crate) mod alloc;
pub mod chain;
pub mod layout;
pub mod metrics;
pub mod node;
pub mod options;
pub mod random;
pub mod snapshot;
pub mod versioned;

pub use alloc::{AllocationReport, PageCounts};
pub use chain::{ChainCursor, ChainLink};
pub use layout::{ExtentGeometry, ExtentNum, PageSlot};
pub use metrics::{CounterMetrics, NoopMetrics, SegmentMetrics};
pub use node::{PageEntry, PlainEntry, VersionedEntry};
pub use options::SegmentOptions;
pub use random::RandomAllocationSegment;
pub use snapshot::SnapshotSegment;
pub use versioned::{ReclaimCursor, TxnChanges, VersionedAllocationSegment};
