//! Versioned allocation segment.
//!
//! Every allocation-node write made on behalf of a transaction lands in a
//! scratch copy of the node; the permanent node changes only when the
//! transaction commits. Pages are never freed in place by a transaction:
//! their owner is tagged deallocation-deferred and the reclamation pass frees
//! them once no snapshot can observe them.

mod changes;
mod reclaim;
mod staging;

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, info};

pub use changes::{ModKind, ModifiedPageEntry, TxnChanges};
pub use reclaim::{plan_reclaim, ReclaimCursor};

use super::alloc::{AllocationReport, ExtentAllocator, PageCounts};
use super::chain::{collect_chain, ChainLink};
use super::layout::ExtentGeometry;
use super::node::{read_entry, write_entry, PageEntry, SegAllocNode, VersionedEntry};
use super::options::SegmentOptions;
use super::random::RandomAllocationSegment;
use crate::primitives::pager::Pager;
use crate::types::{Csn, PageId, PageOwnerId, Result, StrataError};
use staging::{NodeMap, StagingRouter};

/// Segment whose allocation metadata is transactional and whose pages carry
/// version chains.
pub struct VersionedAllocationSegment {
    alloc: ExtentAllocator<VersionedEntry, StagingRouter>,
    home: Arc<Pager>,
    dealloc_lock: RwLock<()>,
}

impl VersionedAllocationSegment {
    /// Formats a segment over `home`, staging into a fresh scratch segment
    /// over `scratch`.
    pub fn create(home: Arc<Pager>, scratch: Arc<Pager>, options: &SegmentOptions) -> Result<Self> {
        let segment = Self::build(home, scratch, options)?;
        segment.alloc.format()?;
        info!(
            pages = segment.home.allocated_pages(),
            "versioned_segment.create"
        );
        Ok(segment)
    }

    /// Attaches to a formatted segment and recounts its pages.
    pub fn open(home: Arc<Pager>, scratch: Arc<Pager>, options: &SegmentOptions) -> Result<Self> {
        let segment = Self::build(home, scratch, options)?;
        let counts = segment.alloc.count_allocated_pages()?;
        info!(
            allocated = counts.allocated,
            high_water = counts.high_water,
            "versioned_segment.open"
        );
        Ok(segment)
    }

    fn build(home: Arc<Pager>, scratch: Arc<Pager>, options: &SegmentOptions) -> Result<Self> {
        if scratch.page_size() != home.page_size() {
            return Err(StrataError::Invalid(
                "scratch store must use the same page size as the segment",
            ));
        }
        let geometry = options.geometry::<VersionedEntry>(home.page_size())?;
        let metrics = options.metrics_handle();
        let scratch_options = SegmentOptions {
            metrics: None,
            ..SegmentOptions::default()
        };
        let scratch = RandomAllocationSegment::create(scratch, &scratch_options)?;
        let router = StagingRouter::new(Arc::clone(&home), scratch, Arc::clone(&metrics));
        Ok(Self {
            alloc: ExtentAllocator::new(router, geometry, metrics),
            home,
            dealloc_lock: RwLock::new(()),
        })
    }

    fn router(&self) -> &StagingRouter {
        self.alloc.router()
    }

    /// The page store holding data pages and permanent nodes.
    pub fn pager(&self) -> &Arc<Pager> {
        &self.home
    }

    /// Shape of the segment.
    pub fn geometry(&self) -> ExtentGeometry {
        self.alloc.geometry()
    }

    /// Shared side of the lock reclamation takes exclusively. Held by
    /// snapshot operations for their whole duration.
    pub(crate) fn deallocation_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.dealloc_lock.read()
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn super::metrics::SegmentMetrics> {
        self.alloc.metrics()
    }

    /// Allocates a page for `owner` within the transaction recorded in
    /// `changes`. The entry carries the provisional owner until commit.
    pub fn allocate_page_id(
        &self,
        changes: &mut TxnChanges,
        owner: PageOwnerId,
    ) -> Result<Option<PageId>> {
        if !owner.is_allocated()
            || owner.is_deallocation_deferred()
            || owner == PageOwnerId::UNCOMMITTED
        {
            return Err(StrataError::Invalid("owner id is reserved"));
        }
        let page = self.alloc.allocate(PageOwnerId::UNCOMMITTED)?;
        if let Some(page) = page {
            changes.record_allocation(page, owner);
        }
        Ok(page)
    }

    /// Frees `page` immediately, through staged metadata. Only valid for
    /// pages no other transaction can see.
    pub fn deallocate_page(&self, changes: &mut TxnChanges, page: PageId) -> Result<()> {
        if !self.alloc.is_page_valid(page)? {
            return Err(StrataError::Invalid("page id is not a data page of this segment"));
        }
        self.alloc.free_page(page)?;
        changes.record_free(page);
        Ok(())
    }

    /// Tags `page` as deallocated by the transaction at `csn`.
    pub fn defer_deallocation(
        &self,
        changes: &mut TxnChanges,
        page: PageId,
        csn: Csn,
    ) -> Result<()> {
        self.alloc.update_entry(page, |entry| {
            assert!(
                entry.owner.is_allocated() && !entry.owner.is_deallocation_deferred(),
                "page {page} deallocated twice or while free"
            );
            entry.owner = PageOwnerId::deallocation_deferred(csn);
        })?;
        changes.record_update(page);
        Ok(())
    }

    /// Entry of `page` as this process currently sees it, staged changes
    /// included.
    pub fn get_page_entry_copy(&self, page: PageId) -> Result<VersionedEntry> {
        self.alloc.read_entry(page)
    }

    /// Entry of `page` as last committed.
    pub fn get_committed_entry(&self, page: PageId) -> Result<VersionedEntry> {
        if !self.alloc.is_page_valid(page)? {
            return Err(StrataError::Invalid("page id is not a data page of this segment"));
        }
        self.read_committed_entry(page)
    }

    /// Reads the permanent entry without consulting the staging map.
    fn read_committed_entry(&self, page: PageId) -> Result<VersionedEntry> {
        let geo = self.geometry();
        let (_, extent, offset) = geo.split_data_page(page);
        let node = self.home.pin_shared(geo.extent_alloc_page_id(extent))?;
        Ok(read_entry(node.data(), offset))
    }

    /// Sets the version chain link and creation CSN of `page`.
    pub fn init_page_entry(
        &self,
        changes: &mut TxnChanges,
        page: PageId,
        chain: PageId,
        csn: Csn,
    ) -> Result<()> {
        self.alloc.update_entry(page, |entry| {
            entry.version_chain = chain;
            entry.allocation_csn = csn;
        })?;
        changes.record_update(page);
        Ok(())
    }

    /// Points the chain link of `page` at `chain`, optionally replacing its
    /// successor too.
    pub fn chain_page_entries(
        &self,
        changes: &mut TxnChanges,
        page: PageId,
        chain: PageId,
        successor: Option<PageId>,
    ) -> Result<()> {
        self.alloc.update_entry(page, |entry| {
            entry.version_chain = chain;
            if let Some(successor) = successor {
                entry.successor = successor;
            }
        })?;
        changes.record_update(page);
        Ok(())
    }

    /// Successor recorded for `page`.
    pub fn get_page_successor(&self, page: PageId) -> Result<PageId> {
        Ok(self.alloc.read_entry(page)?.successor)
    }

    /// Records `successor` as the page following `page`.
    pub fn set_page_successor(
        &self,
        changes: &mut TxnChanges,
        page: PageId,
        successor: PageId,
    ) -> Result<()> {
        self.alloc.update_entry(page, |entry| entry.set_successor(successor))?;
        changes.record_update(page);
        Ok(())
    }

    /// Owner recorded for `page`.
    pub fn get_page_owner_id(&self, page: PageId) -> Result<PageOwnerId> {
        Ok(self.alloc.read_entry(page)?.owner)
    }

    /// True when `page` is a data page whose entry is allocated.
    pub fn is_page_id_allocated(&self, page: PageId) -> Result<bool> {
        self.alloc.is_page_allocated(page)
    }

    /// True when `page` addresses a data page inside a formatted extent.
    pub fn is_page_id_valid(&self, page: PageId) -> Result<bool> {
        self.alloc.is_page_valid(page)
    }

    /// Members of the version chain through `page`, in ring order.
    pub fn version_chain(&self, page: PageId) -> Result<Vec<ChainLink>> {
        collect_chain(page, self.chain_limit(), |member| self.alloc.read_entry(member))
    }

    pub(crate) fn chain_limit(&self) -> u64 {
        self.home.allocated_pages()
    }

    /// Scratch pages holding staged node copies. Zero whenever no
    /// transaction is pending.
    pub fn scratch_pages_in_use(&self) -> u64 {
        self.router().scratch().allocated_size_in_pages()
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

    /// Frees every page and re-formats the segment. Refused while any
    /// transaction has staged metadata.
    pub fn deallocate_all(&self) -> Result<()> {
        let _dealloc = self.dealloc_lock.write();
        if !self.router().nodes().read().is_empty() {
            return Err(StrataError::Invalid(
                "cannot deallocate every page while transactions are pending",
            ));
        }
        self.alloc.deallocate_all()
    }

    /// Applies the staged changes to the permanent nodes, stamping `csn`
    /// into allocated and deallocated entries.
    pub fn commit(&self, changes: &mut TxnChanges, csn: Csn) -> Result<()> {
        let changes = changes.take();
        self.update_alloc_nodes(&changes, Some(csn))?;
        self.alloc.metrics().commit();
        debug!(csn = csn.0, pages = changes.len(), "versioned.commit.complete");
        Ok(())
    }

    /// Discards the staged changes. Permanent nodes are never written, so
    /// they stay byte-identical to their state before the transaction; the
    /// store itself keeps any size it grew by.
    pub fn rollback(&self, changes: &mut TxnChanges) -> Result<()> {
        let changes = changes.take();
        self.update_alloc_nodes(&changes, None)?;
        self.alloc.metrics().rollback();
        debug!(pages = changes.len(), "versioned.rollback.complete");
        Ok(())
    }

    fn update_alloc_nodes(&self, changes: &TxnChanges, commit: Option<Csn>) -> Result<()> {
        let mut nodes = self.router().nodes().write();
        for (page, modified) in changes.iter() {
            self.update_page_entry(&mut nodes, page, modified, commit)?;
        }
        Ok(())
    }

    fn update_page_entry(
        &self,
        nodes: &mut NodeMap,
        page: PageId,
        modified: &ModifiedPageEntry,
        commit: Option<Csn>,
    ) -> Result<()> {
        if commit.is_some() && modified.allocated_here {
            self.alloc.grow_permanent(page)?;
        }
        let net = modified.net_allocations();
        // Free counters never promise a page whose entry is not yet free.
        let counter_first = match commit {
            Some(_) => net < 0,
            None => net <= 0,
        };
        if counter_first {
            self.update_extent_counter(nodes, page, modified, commit)?;
            self.update_entry_copy(nodes, page, modified, commit)
        } else {
            self.update_entry_copy(nodes, page, modified, commit)?;
            self.update_extent_counter(nodes, page, modified, commit)
        }
    }

    fn update_extent_counter(
        &self,
        nodes: &mut NodeMap,
        page: PageId,
        modified: &ModifiedPageEntry,
        commit: Option<Csn>,
    ) -> Result<()> {
        if modified.allocation_count == 0 {
            return Ok(());
        }
        let geo = self.geometry();
        let (seg_index, extent, _) = geo.split_data_page(page);
        let node = geo.seg_alloc_page_id(seg_index);
        let rel = geo.relative_extent(extent);
        let net = modified.net_allocations();
        if net != 0 {
            match commit {
                Some(_) => {
                    let mut permanent = self.home.pin_exclusive(node)?;
                    SegAllocNode::new(permanent.data_mut()).adjust_free_count(
                        rel,
                        -net,
                        geo.pages_per_extent(),
                    );
                }
                None => {
                    let temp = staged_copy(nodes, node);
                    let mut staged = self.router().scratch_store().pin_exclusive(temp)?;
                    SegAllocNode::new(staged.data_mut()).adjust_free_count(
                        rel,
                        net,
                        geo.pages_per_extent(),
                    );
                    let counters = self.alloc.counters();
                    if net > 0 {
                        counters.decrement();
                    } else {
                        counters.increment();
                    }
                }
            }
        }
        self.router()
            .release_locked(nodes, node, modified.allocation_count)
    }

    fn update_entry_copy(
        &self,
        nodes: &mut NodeMap,
        page: PageId,
        modified: &ModifiedPageEntry,
        commit: Option<Csn>,
    ) -> Result<()> {
        let geo = self.geometry();
        let (_, extent, offset) = geo.split_data_page(page);
        let node = geo.extent_alloc_page_id(extent);
        let temp = staged_copy(nodes, node);
        {
            let mut staged = self.router().scratch_store().pin_exclusive(temp)?;
            match commit {
                Some(csn) => {
                    let mut entry: VersionedEntry = read_entry(staged.data(), offset);
                    if entry.owner.is_allocated() {
                        stamp_committed(&mut entry, modified, csn);
                        write_entry(staged.data_mut(), offset, &entry);
                    }
                    let mut permanent = self.home.pin_exclusive(node)?;
                    write_entry(permanent.data_mut(), offset, &entry);
                }
                None => {
                    let permanent = self.home.pin_shared(node)?;
                    let header: VersionedEntry = read_entry(permanent.data(), 0);
                    // Extents grown by pending transactions have no
                    // permanent node yet.
                    let entry = if header.owner == PageOwnerId::ANONYMOUS {
                        read_entry(permanent.data(), offset)
                    } else {
                        VersionedEntry::unused()
                    };
                    write_entry(staged.data_mut(), offset, &entry);
                }
            }
        }
        self.router().release_locked(nodes, node, modified.update_count)
    }
}

fn staged_copy(nodes: &NodeMap, node: PageId) -> PageId {
    nodes
        .get(&node)
        .map(|staged| staged.temp)
        .unwrap_or_else(|| panic!("allocation node {node} changed but was never staged"))
}

fn stamp_committed(entry: &mut VersionedEntry, modified: &ModifiedPageEntry, csn: Csn) {
    if modified.last_mod == ModKind::Allocated {
        entry.allocation_csn = csn;
    }
    if entry.owner == PageOwnerId::UNCOMMITTED {
        entry.owner = modified.owner;
    }
    if entry.owner.is_deallocation_deferred() {
        entry.owner = PageOwnerId::deallocation_deferred(csn);
    }
}
