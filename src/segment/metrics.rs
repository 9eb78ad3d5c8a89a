use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking allocation and versioning activity in a segment.
///
/// Implementations collect counts of page allocations, node staging traffic,
/// transaction outcomes and reclamation so that embedders can monitor how a
/// store evolves. Every method is invoked on hot paths and must be cheap.
pub trait SegmentMetrics: Send + Sync {
    /// Records a data page handed out by an allocator.
    fn page_allocated(&self);

    /// Records a data page returned to its extent.
    fn page_freed(&self);

    /// Records a newly formatted extent.
    fn extent_formatted(&self);

    /// Records an allocation node copied into the scratch segment.
    fn node_staged(&self);

    /// Records a scratch copy released after its last update was resolved.
    fn node_released(&self);

    /// Records a committed transaction.
    fn commit(&self);

    /// Records a rolled-back transaction.
    fn rollback(&self);

    /// Records a copy-on-write version created by a snapshot.
    fn version_created(&self);

    /// Records old versions freed by reclamation.
    ///
    /// # Parameters
    /// * `count` - Pages freed in one reclamation batch.
    fn versions_reclaimed(&self, count: u64);
}

/// A no-op implementation of [`SegmentMetrics`] that discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl SegmentMetrics for NoopMetrics {
    fn page_allocated(&self) {}
    fn page_freed(&self) {}
    fn extent_formatted(&self) {}
    fn node_staged(&self) {}
    fn node_released(&self) {}
    fn commit(&self) {}
    fn rollback(&self) {}
    fn version_created(&self) {}
    fn versions_reclaimed(&self, _count: u64) {}
}

/// A thread-safe counter-based implementation of [`SegmentMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Data pages allocated.
    pub pages_allocated: AtomicU64,

    /// Data pages freed.
    pub pages_freed: AtomicU64,

    /// Extents formatted.
    pub extents_formatted: AtomicU64,

    /// Allocation nodes staged into scratch.
    pub nodes_staged: AtomicU64,

    /// Scratch copies released.
    pub nodes_released: AtomicU64,

    /// Committed transactions.
    pub commits: AtomicU64,

    /// Rolled-back transactions.
    pub rollbacks: AtomicU64,

    /// Copy-on-write versions created.
    pub versions_created: AtomicU64,

    /// Old versions freed by reclamation.
    pub versions_reclaimed: AtomicU64,
}

impl SegmentMetrics for CounterMetrics {
    fn page_allocated(&self) {
        self.pages_allocated.fetch_add(1, Ordering::Relaxed);
    }

    fn page_freed(&self) {
        self.pages_freed.fetch_add(1, Ordering::Relaxed);
    }

    fn extent_formatted(&self) {
        self.extents_formatted.fetch_add(1, Ordering::Relaxed);
    }

    fn node_staged(&self) {
        self.nodes_staged.fetch_add(1, Ordering::Relaxed);
    }

    fn node_released(&self) {
        self.nodes_released.fetch_add(1, Ordering::Relaxed);
    }

    fn commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    fn rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn version_created(&self) {
        self.versions_created.fetch_add(1, Ordering::Relaxed);
    }

    fn versions_reclaimed(&self, count: u64) {
        self.versions_reclaimed.fetch_add(count, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
pub fn default_metrics() -> Arc<dyn SegmentMetrics> {
    Arc::new(NoopMetrics)
}
