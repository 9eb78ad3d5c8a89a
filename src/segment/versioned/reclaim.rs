//! Reclamation of page versions no active snapshot can observe.
//!
//! Runs in two phases. [`VersionedAllocationSegment::get_old_page_ids`] scans
//! committed extent entries for candidates without taking any segment-wide
//! lock; [`VersionedAllocationSegment::deallocate_old_pages`] then takes the
//! deallocation lock exclusively, re-reads each candidate's chain and frees
//! what is provably invisible.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, info};

use super::staging::NodeMap;
use super::VersionedAllocationSegment;
use crate::segment::chain::{collect_chain, ChainLink};
use crate::segment::layout::ExtentNum;
use crate::segment::node::{read_entry, write_entry, PageEntry, SegAllocNode, VersionedEntry};
use crate::types::{Csn, PageId, Result};

/// Resume point of the candidate scan.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReclaimCursor {
    next_extent: ExtentNum,
}

impl ReclaimCursor {
    /// Cursor positioned at the first extent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Extent the next scan starts from.
    pub fn position(&self) -> ExtentNum {
        self.next_extent
    }

    /// Restarts from the first extent.
    pub fn reset(&mut self) {
        self.next_extent = 0;
    }
}

/// Decides which members of one version chain can be freed once every
/// active snapshot reads at `oldest_active` or later.
///
/// * every member deallocation-deferred, all by transactions committed
///   before the horizon: free the whole chain;
/// * only some members deferred: keep everything, the deallocation is still
///   being assembled;
/// * otherwise keep the anchor (lowest CSN) and the newest version older
///   than the horizon, and free every version older than that one.
pub fn plan_reclaim(chain: &[ChainLink], oldest_active: Csn) -> Vec<PageId> {
    let deferred: Vec<Option<Csn>> = chain
        .iter()
        .map(|link| link.entry.owner.deallocating_csn())
        .collect();
    if deferred.iter().all(Option::is_some) {
        let newest = deferred.iter().flatten().max();
        return match newest {
            Some(&csn) if csn < oldest_active => chain.iter().map(|link| link.page).collect(),
            _ => Vec::new(),
        };
    }
    if deferred.iter().any(Option::is_some) {
        return Vec::new();
    }
    let Some(anchor) = chain
        .iter()
        .min_by_key(|link| link.entry.allocation_csn)
        .map(|link| link.page)
    else {
        return Vec::new();
    };
    let Some(newest_old) = chain
        .iter()
        .map(|link| link.entry.allocation_csn)
        .filter(|&csn| csn < oldest_active)
        .max()
    else {
        return Vec::new();
    };
    chain
        .iter()
        .filter(|link| link.page != anchor && link.entry.allocation_csn < newest_old)
        .map(|link| link.page)
        .collect()
}

fn is_candidate(page: PageId, entry: &VersionedEntry, oldest_active: Csn) -> bool {
    if !entry.owner.is_allocated() {
        return false;
    }
    entry.owner.is_deallocation_deferred()
        || (!entry.is_singleton(page) && entry.allocation_csn < oldest_active)
}

impl VersionedAllocationSegment {
    /// Extents mapped by the permanent nodes, in chain order.
    fn committed_extents(&self) -> Result<Vec<ExtentNum>> {
        let geo = self.geometry();
        let epsa = geo.extents_per_seg_alloc() as u64;
        let mut extents = Vec::new();
        let mut seg_index = 0;
        loop {
            let node = self.home.pin_shared(geo.seg_alloc_page_id(seg_index))?;
            let view = SegAllocNode::new(node.data());
            extents.extend((0..view.extent_count() as u64).map(|rel| seg_index * epsa + rel));
            if view.next().is_null() {
                return Ok(extents);
            }
            seg_index += 1;
        }
    }

    /// Adds to `out` committed pages that may be reclaimable below
    /// `oldest_active`, resuming at `cursor`. Stops at an extent boundary
    /// once at least `min_batch` candidates are collected.
    ///
    /// Returns true while extents remain to be scanned.
    pub fn get_old_page_ids(
        &self,
        cursor: &mut ReclaimCursor,
        oldest_active: Csn,
        min_batch: usize,
        out: &mut BTreeSet<PageId>,
    ) -> Result<bool> {
        let geo = self.geometry();
        let extents = self.committed_extents()?;
        let start = cursor.next_extent;
        let mut remaining = extents
            .iter()
            .copied()
            .filter(|&extent| extent >= start)
            .peekable();
        while let Some(extent) = remaining.next() {
            {
                let node = self.home.pin_shared(geo.extent_alloc_page_id(extent))?;
                for offset in 1..geo.pages_per_extent() {
                    let entry: VersionedEntry = read_entry(node.data(), offset);
                    let page = geo.make_page_id(extent, offset);
                    if is_candidate(page, &entry, oldest_active) {
                        out.insert(page);
                    }
                }
            }
            cursor.next_extent = extent + 1;
            if out.len() >= min_batch {
                break;
            }
        }
        Ok(remaining.peek().is_some())
    }

    /// Frees the versions among `candidates` that no snapshot at or after
    /// `oldest_active` can observe, relinking the surviving members of
    /// every chain. Chains with uncommitted changes are left for a later
    /// pass. Returns the number of pages freed.
    pub fn deallocate_old_pages(
        &self,
        candidates: &BTreeSet<PageId>,
        oldest_active: Csn,
    ) -> Result<u64> {
        let _dealloc = self.dealloc_lock.write();
        let nodes = self.router().nodes().read();
        let mut visited = HashSet::new();
        let mut freed = 0u64;
        for &page in candidates {
            if visited.contains(&page) {
                continue;
            }
            if !self.read_committed_entry(page)?.owner.is_allocated() {
                continue;
            }
            let chain = collect_chain(page, self.chain_limit(), |member| {
                self.read_committed_entry(member)
            })?;
            visited.extend(chain.iter().map(|link| link.page));
            if self.chain_has_pending(&nodes, &chain)? {
                debug!(page = page.0, "versioned.reclaim.skip_pending");
                continue;
            }
            let doomed = plan_reclaim(&chain, oldest_active);
            if doomed.is_empty() {
                continue;
            }
            let survivors: Vec<PageId> = chain
                .iter()
                .map(|link| link.page)
                .filter(|member| !doomed.contains(member))
                .collect();
            for (i, &member) in survivors.iter().enumerate() {
                let next = survivors[(i + 1) % survivors.len()];
                self.edit_committed_entry(&nodes, member, |entry| entry.version_chain = next)?;
            }
            for &member in &doomed {
                self.free_committed_page(&nodes, member)?;
            }
            freed += doomed.len() as u64;
        }
        self.metrics().versions_reclaimed(freed);
        info!(
            candidates = candidates.len(),
            freed,
            oldest_active = oldest_active.0,
            "versioned.reclaim.batch"
        );
        Ok(freed)
    }

    fn chain_has_pending(&self, nodes: &NodeMap, chain: &[ChainLink]) -> Result<bool> {
        let geo = self.geometry();
        for link in chain {
            let (_, extent, offset) = geo.split_data_page(link.page);
            let Some(staged) = nodes.get(&geo.extent_alloc_page_id(extent)) else {
                continue;
            };
            let copy = self.router().scratch_store().pin_shared(staged.temp)?;
            let staged_entry: VersionedEntry = read_entry(copy.data(), offset);
            if staged_entry != link.entry {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Applies `edit` to the committed entry of `page` and to its staged
    /// copy, if any.
    fn edit_committed_entry(
        &self,
        nodes: &NodeMap,
        page: PageId,
        edit: impl Fn(&mut VersionedEntry),
    ) -> Result<()> {
        let geo = self.geometry();
        let (_, extent, offset) = geo.split_data_page(page);
        let node = geo.extent_alloc_page_id(extent);
        if let Some(staged) = nodes.get(&node) {
            let mut copy = self.router().scratch_store().pin_exclusive(staged.temp)?;
            let mut entry: VersionedEntry = read_entry(copy.data(), offset);
            edit(&mut entry);
            write_entry(copy.data_mut(), offset, &entry);
        }
        let mut permanent = self.home.pin_exclusive(node)?;
        let mut entry: VersionedEntry = read_entry(permanent.data(), offset);
        edit(&mut entry);
        write_entry(permanent.data_mut(), offset, &entry);
        Ok(())
    }

    fn free_committed_page(&self, nodes: &NodeMap, page: PageId) -> Result<()> {
        let geo = self.geometry();
        let (seg_index, extent, _) = geo.split_data_page(page);
        self.edit_committed_entry(nodes, page, |entry| entry.mark_unused())?;

        let node = geo.seg_alloc_page_id(seg_index);
        let rel = geo.relative_extent(extent);
        let ppe = geo.pages_per_extent();
        if let Some(staged) = nodes.get(&node) {
            let mut copy = self.router().scratch_store().pin_exclusive(staged.temp)?;
            SegAllocNode::new(copy.data_mut()).adjust_free_count(rel, 1, ppe);
        }
        {
            let mut permanent = self.home.pin_exclusive(node)?;
            SegAllocNode::new(permanent.data_mut()).adjust_free_count(rel, 1, ppe);
        }
        self.home.discard(page);
        self.alloc.counters().decrement();
        self.metrics().page_freed();
        Ok(())
    }
}
