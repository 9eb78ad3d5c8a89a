use std::sync::Arc;

use tracing::info;

use super::alloc::{AllocationReport, DirectRouter, ExtentAllocator, PageCounts};
use super::layout::ExtentGeometry;
use super::node::{PageEntry, PlainEntry};
use super::options::SegmentOptions;
use crate::primitives::pager::Pager;
use crate::types::{PageId, PageOwnerId, Result, StrataError};

/// Non-versioned segment: pages are allocated and freed in place.
///
/// Used directly for scratch storage and as the building block the
/// versioned segment stages its metadata into.
pub struct RandomAllocationSegment {
    alloc: ExtentAllocator<PlainEntry, DirectRouter>,
    pager: Arc<Pager>,
}

impl RandomAllocationSegment {
    /// Formats a segment over `pager`, covering whatever the store already
    /// holds.
    pub fn create(pager: Arc<Pager>, options: &SegmentOptions) -> Result<Self> {
        let segment = Self::build(pager, options)?;
        segment.alloc.format()?;
        info!(
            pages = segment.pager.allocated_pages(),
            "random_segment.create"
        );
        Ok(segment)
    }

    /// Attaches to an already formatted segment and recounts its pages.
    pub fn open(pager: Arc<Pager>, options: &SegmentOptions) -> Result<Self> {
        let segment = Self::build(pager, options)?;
        segment.alloc.count_allocated_pages()?;
        Ok(segment)
    }

    fn build(pager: Arc<Pager>, options: &SegmentOptions) -> Result<Self> {
        let geometry = options.geometry::<PlainEntry>(pager.page_size())?;
        Ok(Self {
            alloc: ExtentAllocator::new(
                DirectRouter::new(Arc::clone(&pager)),
                geometry,
                options.metrics_handle(),
            ),
            pager,
        })
    }

    /// The page store under this segment.
    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// Shape of the segment.
    pub fn geometry(&self) -> ExtentGeometry {
        self.alloc.geometry()
    }

    /// Allocates a page for `owner`; `Ok(None)` when the store cannot grow.
    pub fn allocate_page_id(&self, owner: PageOwnerId) -> Result<Option<PageId>> {
        if !owner.is_allocated() || owner.is_deallocation_deferred() {
            return Err(StrataError::Invalid("owner id is reserved"));
        }
        self.alloc.allocate(owner)
    }

    /// Frees `page`, which must be allocated.
    pub fn deallocate_page(&self, page: PageId) -> Result<()> {
        if !self.alloc.is_page_valid(page)? {
            return Err(StrataError::Invalid("page id is not a data page of this segment"));
        }
        self.alloc.free_page(page)
    }

    /// Frees every page and re-formats the segment.
    pub fn deallocate_all(&self) -> Result<()> {
        self.alloc.deallocate_all()?;
        info!("random_segment.deallocate_all");
        Ok(())
    }

    /// True when `page` is a data page whose entry is allocated.
    pub fn is_page_id_allocated(&self, page: PageId) -> Result<bool> {
        self.alloc.is_page_allocated(page)
    }

    /// True when `page` addresses a data page inside a formatted extent.
    pub fn is_page_id_valid(&self, page: PageId) -> Result<bool> {
        self.alloc.is_page_valid(page)
    }

    /// Owner recorded for `page`.
    pub fn get_page_owner_id(&self, page: PageId) -> Result<PageOwnerId> {
        Ok(self.alloc.read_entry(page)?.owner())
    }

    /// Successor recorded for `page`.
    pub fn get_page_successor(&self, page: PageId) -> Result<PageId> {
        Ok(self.alloc.read_entry(page)?.successor())
    }

    /// Records `successor` as the page following `page`.
    pub fn set_page_successor(&self, page: PageId, successor: PageId) -> Result<()> {
        self.alloc.update_entry(page, |entry| {
            assert!(entry.owner().is_allocated(), "successor set on a free page");
            entry.set_successor(successor);
        })?;
        Ok(())
    }

    /// Data pages currently allocated.
    pub fn allocated_size_in_pages(&self) -> u64 {
        self.alloc.counters().snapshot().allocated
    }

    /// Pages ever occupied, allocation nodes included.
    pub fn occupied_high_water(&self) -> u64 {
        self.alloc.counters().snapshot().high_water
    }

    /// All page counters.
    pub fn counts(&self) -> PageCounts {
        self.alloc.counters().snapshot()
    }

    /// Recomputes the page counters from the persisted nodes.
    pub fn count_allocated_pages(&self) -> Result<PageCounts> {
        self.alloc.count_allocated_pages()
    }

    /// Checks free counters against extent entries.
    pub fn verify(&self) -> Result<AllocationReport> {
        self.alloc.verify()
    }
}
