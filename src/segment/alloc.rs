//! Extent-based page allocator shared by the random and versioned segments.
//!
//! The allocator never decides on its own where a node write lands: every
//! mutation of a segment or extent allocation node goes through a
//! [`NodeRouter`], which either hands back the permanent page or a staged
//! copy of it. Reads go through the router as well so that a transaction
//! observes its own staged metadata.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace};

use super::layout::{ExtentGeometry, ExtentNum, PageSlot};
use super::metrics::SegmentMetrics;
use super::node::{format_extent_node, read_entry, write_entry, PageEntry, SegAllocNode};
use crate::primitives::pager::Pager;
use crate::types::{PageId, PageOwnerId, Result, StrataError, NULL_PAGE_ID};

/// Location a node write should be applied to.
pub(crate) struct NodeSite<'a> {
    pub store: &'a Pager,
    pub page: PageId,
    pub staged: bool,
}

/// Decides where allocation-node reads and writes land.
pub(crate) trait NodeRouter: Send + Sync {
    /// The store holding the permanent nodes and the data pages.
    fn home(&self) -> &Pager;

    /// Prepares `node` for modification and returns where to write it.
    /// Every call must be balanced by a commit, rollback or
    /// [`NodeRouter::undo_node_write`].
    fn node_for_write(&self, node: PageId) -> Result<NodeSite<'_>>;

    /// Releases a write reservation obtained from
    /// [`NodeRouter::node_for_write`] that ended up unused.
    fn undo_node_write(&self, node: PageId) -> Result<()>;

    /// Runs `read` over the current image of `node`. May run it more than
    /// once.
    fn read_node<T, F>(&self, node: PageId, read: F) -> Result<T>
    where
        F: Fn(&[u8]) -> T;
}

/// Writes straight to the permanent nodes.
pub(crate) struct DirectRouter {
    home: Arc<Pager>,
}

impl DirectRouter {
    pub fn new(home: Arc<Pager>) -> Self {
        Self { home }
    }
}

impl NodeRouter for DirectRouter {
    fn home(&self) -> &Pager {
        &self.home
    }

    fn node_for_write(&self, node: PageId) -> Result<NodeSite<'_>> {
        Ok(NodeSite {
            store: &self.home,
            page: node,
            staged: false,
        })
    }

    fn undo_node_write(&self, _node: PageId) -> Result<()> {
        Ok(())
    }

    fn read_node<T, F>(&self, node: PageId, read: F) -> Result<T>
    where
        F: Fn(&[u8]) -> T,
    {
        let page = self.home.pin_shared(node)?;
        Ok(read(page.data()))
    }
}

/// Page counters maintained by an allocator.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PageCounts {
    /// Pages ever occupied, node pages included. Only grows between recounts.
    pub high_water: u64,
    /// Data pages currently allocated.
    pub allocated: u64,
    /// Deallocations not yet offset by a reallocation.
    pub net_deallocations: u64,
}

#[derive(Default)]
pub(crate) struct PageCounters {
    state: Mutex<PageCounts>,
}

impl PageCounters {
    pub fn increment(&self) {
        let mut state = self.state.lock();
        if state.net_deallocations > 0 {
            state.net_deallocations -= 1;
        } else {
            state.high_water += 1;
        }
        state.allocated += 1;
    }

    pub fn increment_occupied(&self) {
        self.state.lock().high_water += 1;
    }

    pub fn decrement(&self) {
        let mut state = self.state.lock();
        assert!(state.allocated > 0, "allocated page counter underflow");
        state.allocated -= 1;
        state.net_deallocations += 1;
    }

    pub fn replace(&self, counts: PageCounts) {
        *self.state.lock() = counts;
    }

    pub fn snapshot(&self) -> PageCounts {
        *self.state.lock()
    }
}

/// Result of an allocator integrity pass.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AllocationReport {
    /// Segment allocation nodes walked.
    pub seg_nodes: u64,
    /// Extents walked.
    pub extents: u64,
    /// Data pages whose entry is allocated.
    pub allocated_pages: u64,
    /// Data pages whose entry is free.
    pub free_pages: u64,
    /// Human readable inconsistencies; empty when the segment is sound.
    pub findings: Vec<String>,
}

impl AllocationReport {
    /// True when no inconsistency was found.
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Decoded image of one segment allocation node.
pub(crate) struct SegNodeImage {
    pub next: PageId,
    pub extent_size: u64,
    pub free: Vec<u32>,
}

enum Reservation {
    Extent(ExtentNum),
    Next(u64),
    NoSpace,
}

/// Base allocator over extents of `E` entries, with node placement decided
/// by `R`.
pub(crate) struct ExtentAllocator<E, R> {
    router: R,
    geometry: ExtentGeometry,
    counters: PageCounters,
    metrics: Arc<dyn SegmentMetrics>,
    _entry: PhantomData<fn() -> E>,
}

impl<E: PageEntry, R: NodeRouter> ExtentAllocator<E, R> {
    pub fn new(router: R, geometry: ExtentGeometry, metrics: Arc<dyn SegmentMetrics>) -> Self {
        Self {
            router,
            geometry,
            counters: PageCounters::default(),
            metrics,
            _entry: PhantomData,
        }
    }

    pub fn router(&self) -> &R {
        &self.router
    }

    pub fn geometry(&self) -> ExtentGeometry {
        self.geometry
    }

    pub fn metrics(&self) -> &Arc<dyn SegmentMetrics> {
        &self.metrics
    }

    pub fn counters(&self) -> &PageCounters {
        &self.counters
    }

    fn home(&self) -> &Pager {
        self.router.home()
    }

    /// Lays out allocation nodes covering the current store size, marking
    /// every data page free. Node writes go straight to the permanent pages.
    pub fn format(&self) -> Result<()> {
        let geo = self.geometry;
        let epsa = geo.extents_per_seg_alloc() as u64;
        let ppe = geo.pages_per_extent();
        let (seg_nodes, extents) = format_shape(self.home().allocated_pages(), geo);
        if !self.home().ensure_allocated(geo.extent_end(extents - 1))? {
            return Err(StrataError::Invalid(
                "store cannot grow to hold a formatted segment",
            ));
        }
        for seg_index in 0..seg_nodes {
            let first = seg_index * epsa;
            let here = extents.saturating_sub(first).min(epsa) as u32;
            let next = if seg_index + 1 < seg_nodes {
                geo.seg_alloc_page_id(seg_index + 1)
            } else {
                NULL_PAGE_ID
            };
            {
                let mut page = self.home().pin_exclusive(geo.seg_alloc_page_id(seg_index))?;
                let mut node = SegAllocNode::new(page.data_mut());
                node.format(ppe);
                node.set_next(next);
                node.set_extent_count(here);
                for rel in 0..here {
                    node.set_free_count(rel, ppe - 1);
                }
            }
            for rel in 0..here as u64 {
                self.format_extent(first + rel)?;
            }
        }
        self.count_allocated_pages()?;
        info!(seg_nodes, extents, "segment.format.complete");
        Ok(())
    }

    fn format_extent(&self, extent: ExtentNum) -> Result<()> {
        let node = self.geometry.extent_alloc_page_id(extent);
        let mut page = self.home().pin_exclusive(node)?;
        format_extent_node::<E>(page.data_mut(), self.geometry.pages_per_extent());
        self.metrics.extent_formatted();
        Ok(())
    }

    /// Extends the permanent nodes so they map the extent holding `page`:
    /// formats and links any segment node up to it, then formats the
    /// missing extents of its node as free. Used when committing pages
    /// allocated from staged growth.
    pub fn grow_permanent(&self, page: PageId) -> Result<()> {
        let geo = self.geometry;
        let ppe = geo.pages_per_extent();
        let epsa = geo.extents_per_seg_alloc() as u64;
        let (seg_index, extent, _) = geo.split_data_page(page);
        for index in 1..=seg_index {
            let node = geo.seg_alloc_page_id(index);
            {
                let mut fresh = self.home().pin_exclusive(node)?;
                let mut view = SegAllocNode::new(fresh.data_mut());
                if view.extent_size() != 0 {
                    continue;
                }
                view.format(ppe);
            }
            let mut prev = self.home().pin_exclusive(geo.seg_alloc_page_id(index - 1))?;
            SegAllocNode::new(prev.data_mut()).set_next(node);
            debug!(seg_index = index, page = node.0, "segment.grow.seg_node");
        }

        let rel = geo.relative_extent(extent);
        let mut home = self.home().pin_exclusive(geo.seg_alloc_page_id(seg_index))?;
        let mut node = SegAllocNode::new(home.data_mut());
        let count = node.extent_count();
        if count > rel {
            return Ok(());
        }
        for missing in count..=rel {
            self.format_extent(seg_index * epsa + missing as u64)?;
            node.set_free_count(missing, ppe - 1);
        }
        node.set_extent_count(rel + 1);
        debug!(seg_index, extents = rel + 1, "segment.grow.extents");
        Ok(())
    }

    pub fn read_seg_node(&self, seg_index: u64) -> Result<SegNodeImage> {
        let node = self.geometry.seg_alloc_page_id(seg_index);
        if node.0 >= self.home().allocated_pages() {
            return Err(StrataError::Corruption("segment allocation chain runs past the store"));
        }
        self.router.read_node(node, |buf| {
            let view = SegAllocNode::new(buf);
            let count = view.extent_count();
            SegNodeImage {
                next: view.next(),
                extent_size: view.extent_size(),
                free: (0..count).map(|rel| view.free_count(rel)).collect(),
            }
        })
    }

    fn read_checked_seg_node(&self, seg_index: u64) -> Result<SegNodeImage> {
        let image = self.read_seg_node(seg_index)?;
        if image.extent_size == 0 {
            return Err(StrataError::Corruption("segment allocation node is not formatted"));
        }
        if image.extent_size != self.geometry.pages_per_extent() as u64 {
            return Err(StrataError::Corruption("extent size differs from the segment geometry"));
        }
        if image.free.len() > self.geometry.extents_per_seg_alloc() as usize {
            return Err(StrataError::Corruption("segment allocation node maps too many extents"));
        }
        if !image.next.is_null() && image.next != self.geometry.seg_alloc_page_id(seg_index + 1) {
            return Err(StrataError::Corruption("segment allocation chain is not sequential"));
        }
        Ok(image)
    }

    /// Recomputes the page counters from the nodes.
    pub fn count_allocated_pages(&self) -> Result<PageCounts> {
        let ppe = self.geometry.pages_per_extent() as u64;
        let mut counts = PageCounts::default();
        let mut seg_index = 0;
        loop {
            let image = self.read_checked_seg_node(seg_index)?;
            for &free in &image.free {
                let used = ppe - free as u64;
                counts.allocated += used - 1;
                counts.high_water += used;
            }
            counts.high_water += 1;
            if image.next.is_null() {
                break;
            }
            seg_index += 1;
        }
        self.counters.replace(counts);
        debug!(
            allocated = counts.allocated,
            high_water = counts.high_water,
            "segment.count"
        );
        Ok(counts)
    }

    /// Hands out a free data page owned by `owner`, growing the store when
    /// every extent is full. `Ok(None)` means the store cannot grow.
    pub fn allocate(&self, owner: PageOwnerId) -> Result<Option<PageId>> {
        let mut seg_index = 0;
        loop {
            let node = self.geometry.seg_alloc_page_id(seg_index);
            let site = self.router.node_for_write(node)?;
            match self.reserve_in_node(seg_index, &site)? {
                Reservation::Extent(extent) => {
                    self.counters.increment();
                    return self.allocate_from_extent(extent, owner).map(Some);
                }
                Reservation::Next(next) => {
                    self.router.undo_node_write(node)?;
                    seg_index = next;
                }
                Reservation::NoSpace => {
                    self.router.undo_node_write(node)?;
                    debug!(seg_index, "segment.alloc.no_space");
                    return Ok(None);
                }
            }
        }
    }

    fn reserve_in_node(&self, seg_index: u64, site: &NodeSite<'_>) -> Result<Reservation> {
        let geo = self.geometry;
        let ppe = geo.pages_per_extent();
        let epsa = geo.extents_per_seg_alloc();
        let mut page = site.store.pin_exclusive(site.page)?;
        let mut node = SegAllocNode::new(page.data_mut());
        if node.extent_size() == 0 {
            // Reached through growth that no commit has made permanent yet.
            node.format(ppe);
            self.counters.increment_occupied();
        }
        let count = node.extent_count();
        for rel in 0..count {
            let free = node.free_count(rel);
            if free > 0 {
                node.set_free_count(rel, free - 1);
                return Ok(Reservation::Extent(seg_index * epsa as u64 + rel as u64));
            }
        }

        if count < epsa {
            let extent = seg_index * epsa as u64 + count as u64;
            if !self.home().ensure_allocated(geo.extent_end(extent))? {
                return Ok(Reservation::NoSpace);
            }
            if !site.staged {
                self.format_extent(extent)?;
            }
            node.set_extent_count(count + 1);
            node.set_free_count(count, ppe - 2);
            self.counters.increment_occupied();
            debug!(seg_index, extent, staged = site.staged, "segment.alloc.new_extent");
            return Ok(Reservation::Extent(extent));
        }

        let next = node.next();
        let expected = geo.seg_alloc_page_id(seg_index + 1);
        if !next.is_null() {
            if next != expected {
                return Err(StrataError::Corruption("segment allocation chain is not sequential"));
            }
            return Ok(Reservation::Next(seg_index + 1));
        }
        if !self.home().ensure_allocated(expected.0 + 1)? {
            return Ok(Reservation::NoSpace);
        }
        // A staged node is not linked: the successor is formatted when it is
        // first staged and linked for good by the commit that uses it.
        if !site.staged {
            {
                let mut fresh = self.home().pin_exclusive(expected)?;
                SegAllocNode::new(fresh.data_mut()).format(ppe);
            }
            node.set_next(expected);
            self.counters.increment_occupied();
        }
        debug!(seg_index = seg_index + 1, page = expected.0, "segment.alloc.new_seg_node");
        Ok(Reservation::Next(seg_index + 1))
    }

    fn allocate_from_extent(&self, extent: ExtentNum, owner: PageOwnerId) -> Result<PageId> {
        let geo = self.geometry;
        let site = self.router.node_for_write(geo.extent_alloc_page_id(extent))?;
        let mut page = site.store.pin_exclusive(site.page)?;
        if read_entry::<E>(page.data(), 0).owner() != PageOwnerId::ANONYMOUS {
            // First staged copy of an extent grown by a pending transaction.
            format_extent_node::<E>(page.data_mut(), geo.pages_per_extent());
            self.metrics.extent_formatted();
        }
        for offset in 1..geo.pages_per_extent() {
            let mut entry: E = read_entry(page.data(), offset);
            if entry.owner().is_allocated() {
                continue;
            }
            let id = geo.make_page_id(extent, offset);
            entry.claim(id, owner);
            write_entry(page.data_mut(), offset, &entry);
            self.metrics.page_allocated();
            trace!(page = id.0, owner = %owner, "segment.alloc.page");
            return Ok(id);
        }
        Err(StrataError::Corruption(
            "extent advertised a free page but every entry is allocated",
        ))
    }

    /// Returns `page` to its extent: the entry is marked unused before the
    /// free counter is raised.
    pub fn free_page(&self, page: PageId) -> Result<()> {
        let geo = self.geometry;
        let (seg_index, extent, offset) = geo.split_data_page(page);
        {
            let site = self.router.node_for_write(geo.extent_alloc_page_id(extent))?;
            let mut node = site.store.pin_exclusive(site.page)?;
            let mut entry: E = read_entry(node.data(), offset);
            assert!(
                entry.owner().is_allocated(),
                "page {page} freed while unallocated"
            );
            entry.mark_unused();
            write_entry(node.data_mut(), offset, &entry);
        }
        {
            let site = self.router.node_for_write(geo.seg_alloc_page_id(seg_index))?;
            let mut node = site.store.pin_exclusive(site.page)?;
            SegAllocNode::new(node.data_mut()).adjust_free_count(
                geo.relative_extent(extent),
                1,
                geo.pages_per_extent(),
            );
        }
        self.home().discard(page);
        self.counters.decrement();
        self.metrics.page_freed();
        trace!(page = page.0, "segment.free.page");
        Ok(())
    }

    /// True when `page` is a data page inside a formatted extent.
    pub fn is_page_valid(&self, page: PageId) -> Result<bool> {
        if page.is_null() {
            return Ok(false);
        }
        let PageSlot::Extent {
            seg_index,
            extent,
            offset,
        } = self.geometry.split_page_id(page)
        else {
            return Ok(false);
        };
        if offset == 0 {
            return Ok(false);
        }
        if self.geometry.seg_alloc_page_id(seg_index).0 >= self.home().allocated_pages() {
            return Ok(false);
        }
        let image = self.read_seg_node(seg_index)?;
        Ok(image.extent_size != 0
            && (self.geometry.relative_extent(extent) as usize) < image.free.len())
    }

    fn check_valid(&self, page: PageId) -> Result<()> {
        if self.is_page_valid(page)? {
            Ok(())
        } else {
            Err(StrataError::Invalid("page id is not a data page of this segment"))
        }
    }

    /// Current entry of `page`, as seen through the router.
    pub fn read_entry(&self, page: PageId) -> Result<E> {
        self.check_valid(page)?;
        let (_, extent, offset) = self.geometry.split_data_page(page);
        self.router
            .read_node(self.geometry.extent_alloc_page_id(extent), |buf| {
                read_entry::<E>(buf, offset)
            })
    }

    /// Applies `update` to the entry of `page` and returns the new entry.
    pub fn update_entry(&self, page: PageId, update: impl FnOnce(&mut E)) -> Result<E> {
        self.check_valid(page)?;
        let (_, extent, offset) = self.geometry.split_data_page(page);
        let site = self
            .router
            .node_for_write(self.geometry.extent_alloc_page_id(extent))?;
        let mut node = site.store.pin_exclusive(site.page)?;
        let mut entry: E = read_entry(node.data(), offset);
        update(&mut entry);
        write_entry(node.data_mut(), offset, &entry);
        Ok(entry)
    }

    pub fn is_page_allocated(&self, page: PageId) -> Result<bool> {
        if !self.is_page_valid(page)? {
            return Ok(false);
        }
        Ok(self.read_entry(page)?.owner().is_allocated())
    }

    /// Visits every extent in chain order with its free counter.
    pub fn for_each_extent(
        &self,
        mut visit: impl FnMut(ExtentNum, u32) -> Result<()>,
    ) -> Result<u64> {
        let epsa = self.geometry.extents_per_seg_alloc() as u64;
        let mut seg_index = 0;
        loop {
            let image = self.read_checked_seg_node(seg_index)?;
            for (rel, &free) in image.free.iter().enumerate() {
                visit(seg_index * epsa + rel as u64, free)?;
            }
            if image.next.is_null() {
                return Ok(seg_index + 1);
            }
            seg_index += 1;
        }
    }

    /// Entries of every page of `extent`, entry 0 included.
    pub fn extent_entries(&self, extent: ExtentNum) -> Result<Vec<E>> {
        let ppe = self.geometry.pages_per_extent();
        self.router
            .read_node(self.geometry.extent_alloc_page_id(extent), |buf| {
                (0..ppe).map(|offset| read_entry::<E>(buf, offset)).collect()
            })
    }

    /// Checks every extent's free counter against its entries.
    pub fn verify(&self) -> Result<AllocationReport> {
        let ppe = self.geometry.pages_per_extent();
        let mut report = AllocationReport::default();
        let seg_nodes = self.for_each_extent(|extent, free| {
            report.extents += 1;
            let entries = self.extent_entries(extent)?;
            if entries[0].owner() != PageOwnerId::ANONYMOUS {
                report
                    .findings
                    .push(format!("extent {extent}: node entry owned by {}", entries[0].owner()));
            }
            let unused = entries[1..]
                .iter()
                .filter(|entry| !entry.owner().is_allocated())
                .count() as u64;
            report.free_pages += unused;
            report.allocated_pages += (ppe as u64 - 1) - unused;
            if free as u64 != unused {
                report.findings.push(format!(
                    "extent {extent}: free counter {free} but {unused} unused entries"
                ));
            }
            Ok(())
        })?;
        report.seg_nodes = seg_nodes;
        Ok(report)
    }

    /// Drops every allocated page from the cache and re-formats the segment.
    pub fn deallocate_all(&self) -> Result<()> {
        let ppe = self.geometry.pages_per_extent();
        self.for_each_extent(|extent, free| {
            if free == ppe - 1 {
                return Ok(());
            }
            for (offset, entry) in self.extent_entries(extent)?.iter().enumerate().skip(1) {
                if entry.owner().is_allocated() {
                    self.home()
                        .discard(self.geometry.make_page_id(extent, offset as u32));
                }
            }
            Ok(())
        })?;
        self.format()
    }
}

/// Number of segment allocation nodes and extents `format` lays out over a
/// store of `pages` pages. Always at least one of each.
fn format_shape(pages: u64, geo: ExtentGeometry) -> (u64, u64) {
    let ppe = geo.pages_per_extent() as u64;
    let epsa = geo.extents_per_seg_alloc() as u64;
    let seg_nodes = pages.div_ceil(geo.pages_per_seg_alloc());
    if seg_nodes == 0 {
        return (1, 1);
    }
    let full = (seg_nodes - 1) * epsa;
    let remainder = pages.saturating_sub(full * ppe + seg_nodes);
    let extents = full + (remainder / ppe).min(epsa);
    (seg_nodes, extents.max(1))
}
