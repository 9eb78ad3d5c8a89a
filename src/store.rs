//! Transaction-facing entry point: a versioned segment over a file or
//! memory store, with its scratch segment kept in memory.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::primitives::pager::{Pager, PagerOptions, PagerStats};
use crate::segment::{
    AllocationReport, PageCounts, ReclaimCursor, SegmentOptions, SnapshotSegment,
    VersionedAllocationSegment,
};
use crate::types::{Csn, Result};

/// Configuration supplied when creating or opening a [`VersionedStore`].
#[derive(Clone, Default)]
pub struct StoreOptions {
    /// Options of the store holding data pages and permanent nodes.
    pub pager: PagerOptions,
    /// Frames cached by the scratch store; defaults to the home cache size.
    pub scratch_cache_pages: Option<usize>,
    /// Upper bound on the scratch store, in pages.
    pub scratch_max_pages: Option<u64>,
    /// Segment shape and instrumentation.
    pub segment: SegmentOptions,
}

impl StoreOptions {
    /// Sets the home pager options.
    pub fn pager(mut self, pager: PagerOptions) -> Self {
        self.pager = pager;
        self
    }

    /// Sets the segment options.
    pub fn segment(mut self, segment: SegmentOptions) -> Self {
        self.segment = segment;
        self
    }

    /// Caps the scratch store at `pages` pages.
    pub fn scratch_max_pages(mut self, pages: u64) -> Self {
        self.scratch_max_pages = Some(pages);
        self
    }

    fn scratch_pager(&self) -> PagerOptions {
        PagerOptions {
            page_size: self.pager.page_size,
            cache_pages: self.scratch_cache_pages.unwrap_or(self.pager.cache_pages),
            max_pages: self.scratch_max_pages,
        }
    }
}

/// Pages freed by one call to [`VersionedStore::reclaim`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ReclaimOutcome {
    /// Candidates examined.
    pub candidates: u64,
    /// Versions freed.
    pub freed: u64,
    /// True when the scan stopped before the last extent.
    pub more: bool,
}

/// Summary of a store's allocation state.
#[derive(Clone, Debug, Serialize)]
pub struct StoreStats {
    /// Page size in bytes.
    pub page_size: u32,
    /// Pages per extent.
    pub pages_per_extent: u32,
    /// Extents per segment allocation node.
    pub extents_per_seg_alloc: u32,
    /// Size of the home store in pages.
    pub store_pages: u64,
    /// Page counters of the versioned segment.
    pub counts: PageCounts,
    /// Scratch pages holding staged nodes.
    pub scratch_pages_in_use: u64,
    /// Cache activity of the home store.
    pub cache: PagerStats,
}

/// A versioned page store: open snapshots to read and write pages, and
/// reclaim old versions as snapshots retire.
pub struct VersionedStore {
    segment: Arc<VersionedAllocationSegment>,
    resolve_cache: usize,
    cursor: Mutex<ReclaimCursor>,
}

impl VersionedStore {
    /// Creates a store at `path`, discarding any prior content.
    pub fn create(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let home = Arc::new(Pager::create(path.as_ref(), options.pager.clone())?);
        let store = Self::format(home, &options)?;
        store.flush()?;
        Ok(store)
    }

    /// Opens an existing store at `path`.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let home = Arc::new(Pager::open(path.as_ref(), options.pager.clone())?);
        let scratch = Arc::new(Pager::in_memory(options.scratch_pager())?);
        let segment = VersionedAllocationSegment::open(home, scratch, &options.segment)?;
        info!(path = %path.as_ref().display(), "store.open");
        Ok(Self::wrap(segment, &options))
    }

    /// Creates a store held entirely in memory.
    pub fn in_memory(options: StoreOptions) -> Result<Self> {
        let home = Arc::new(Pager::in_memory(options.pager.clone())?);
        Self::format(home, &options)
    }

    fn format(home: Arc<Pager>, options: &StoreOptions) -> Result<Self> {
        let scratch = Arc::new(Pager::in_memory(options.scratch_pager())?);
        let segment = VersionedAllocationSegment::create(home, scratch, &options.segment)?;
        Ok(Self::wrap(segment, options))
    }

    fn wrap(segment: VersionedAllocationSegment, options: &StoreOptions) -> Self {
        Self {
            segment: Arc::new(segment),
            resolve_cache: options.segment.resolve_cache_capacity,
            cursor: Mutex::new(ReclaimCursor::new()),
        }
    }

    /// The versioned segment under this store.
    pub fn segment(&self) -> &Arc<VersionedAllocationSegment> {
        &self.segment
    }

    /// Opens a snapshot reading as of `csn`.
    pub fn open_snapshot(&self, csn: Csn) -> SnapshotSegment {
        SnapshotSegment::new(Arc::clone(&self.segment), csn, self.resolve_cache)
    }

    /// Frees versions no snapshot at or after `oldest_active` can observe,
    /// scanning until at least `min_batch` candidates are found. Successive
    /// calls resume where the last one stopped.
    pub fn reclaim(&self, oldest_active: Csn, min_batch: usize) -> Result<ReclaimOutcome> {
        let mut cursor = self.cursor.lock();
        let mut candidates = BTreeSet::new();
        let more =
            self.segment
                .get_old_page_ids(&mut cursor, oldest_active, min_batch, &mut candidates)?;
        let freed = self.segment.deallocate_old_pages(&candidates, oldest_active)?;
        if !more {
            cursor.reset();
        }
        Ok(ReclaimOutcome {
            candidates: candidates.len() as u64,
            freed,
            more,
        })
    }

    /// Reclaims repeatedly until a full pass over the segment completes.
    pub fn reclaim_all(&self, oldest_active: Csn, min_batch: usize) -> Result<u64> {
        let mut freed = 0;
        loop {
            let outcome = self.reclaim(oldest_active, min_batch)?;
            freed += outcome.freed;
            if !outcome.more {
                return Ok(freed);
            }
        }
    }

    /// Scratch pages holding staged nodes.
    pub fn scratch_pages_in_use(&self) -> u64 {
        self.segment.scratch_pages_in_use()
    }

    /// Allocation summary.
    pub fn stats(&self) -> StoreStats {
        let geometry = self.segment.geometry();
        let pager = self.segment.pager();
        StoreStats {
            page_size: pager.page_size(),
            pages_per_extent: geometry.pages_per_extent(),
            extents_per_seg_alloc: geometry.extents_per_seg_alloc(),
            store_pages: pager.allocated_pages(),
            counts: self.segment.counts(),
            scratch_pages_in_use: self.segment.scratch_pages_in_use(),
            cache: pager.stats(),
        }
    }

    /// Checks allocation metadata for consistency.
    pub fn verify(&self) -> Result<AllocationReport> {
        self.segment.verify()
    }

    /// Writes every dirty page back to the device.
    pub fn flush(&self) -> Result<()> {
        self.segment.pager().flush()
    }
}

impl Drop for VersionedStore {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(error = %err, "store.drop.flush_failed");
        }
    }
}
