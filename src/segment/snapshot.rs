//! Snapshot view over a versioned segment.
//!
//! A snapshot reads, for every logical page, the newest committed version no
//! newer than its CSN, plus whatever versions it created itself. Writes
//! never touch a version someone else can see: the first write to a logical
//! page copies the visible version into a new page and links it into the
//! page's version chain.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::chain::{ChainCursor, ChainLink};
use super::node::VersionedEntry;
use super::versioned::{TxnChanges, VersionedAllocationSegment};
use crate::primitives::pager::{PageMut, PageRef};
use crate::types::{Csn, PageId, PageOwnerId, Result, StrataError};

struct SnapshotState {
    changes: TxnChanges,
    resolved: LruCache<PageId, PageId>,
    own_pages: HashSet<PageId>,
}

/// One transaction's view of a [`VersionedAllocationSegment`].
///
/// Dropping a snapshot with pending changes rolls them back.
pub struct SnapshotSegment {
    segment: Arc<VersionedAllocationSegment>,
    csn: Csn,
    state: Mutex<SnapshotState>,
}

impl SnapshotSegment {
    /// Opens a snapshot reading as of `csn`.
    pub fn new(segment: Arc<VersionedAllocationSegment>, csn: Csn, resolve_cache: usize) -> Self {
        let capacity = NonZeroUsize::new(resolve_cache.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            segment,
            csn,
            state: Mutex::new(SnapshotState {
                changes: TxnChanges::new(),
                resolved: LruCache::new(capacity),
                own_pages: HashSet::new(),
            }),
        }
    }

    /// CSN this snapshot reads as of.
    pub fn csn(&self) -> Csn {
        self.csn
    }

    /// The segment under this snapshot.
    pub fn segment(&self) -> &Arc<VersionedAllocationSegment> {
        &self.segment
    }

    /// True when the snapshot holds uncommitted changes.
    pub fn has_pending_changes(&self) -> bool {
        !self.state.lock().changes.is_empty()
    }

    /// Physical page holding the version of `logical` this snapshot sees.
    pub fn resolve(&self, logical: PageId) -> Result<PageId> {
        let _dealloc = self.segment.deallocation_guard();
        let mut state = self.state.lock();
        self.resolve_locked(&mut state, logical)
    }

    fn resolve_locked(&self, state: &mut SnapshotState, logical: PageId) -> Result<PageId> {
        if let Some(&page) = state.resolved.get(&logical) {
            return Ok(page);
        }
        let anchor = self.segment.get_page_entry_copy(logical)?;
        assert!(
            anchor.owner.is_allocated(),
            "snapshot resolved unallocated page {logical}"
        );
        if anchor.is_singleton(logical) {
            return Ok(logical);
        }
        let mut best: Option<(Csn, PageId)> = None;
        for link in self.chain(logical) {
            let ChainLink { page, entry, .. } = link?;
            if state.own_pages.contains(&page) {
                best = Some((entry.allocation_csn, page));
                break;
            }
            if entry.owner == PageOwnerId::UNCOMMITTED || entry.allocation_csn > self.csn {
                continue;
            }
            if best.map_or(true, |(csn, _)| entry.allocation_csn > csn) {
                best = Some((entry.allocation_csn, page));
            }
        }
        let page = best.map_or(logical, |(_, page)| page);
        state.resolved.put(logical, page);
        trace!(logical = logical.0, page = page.0, "snapshot.resolve");
        Ok(page)
    }

    fn chain(
        &self,
        start: PageId,
    ) -> ChainCursor<impl FnMut(PageId) -> Result<VersionedEntry> + '_> {
        ChainCursor::new(start, self.segment.chain_limit(), move |page| {
            self.segment.get_page_entry_copy(page)
        })
    }

    /// Whether `logical` exists as of this snapshot.
    pub fn is_page_visible(&self, logical: PageId) -> Result<bool> {
        let _dealloc = self.segment.deallocation_guard();
        let mut state = self.state.lock();
        if !self.segment.is_page_id_allocated(logical)? {
            return Ok(false);
        }
        let page = self.resolve_locked(&mut state, logical)?;
        if state.own_pages.contains(&page) {
            let entry = self.segment.get_page_entry_copy(page)?;
            return Ok(!entry.owner.is_deallocation_deferred());
        }
        if state.changes.get(page).is_some()
            && self
                .segment
                .get_page_entry_copy(page)?
                .owner
                .is_deallocation_deferred()
        {
            return Ok(false);
        }
        let entry = self.segment.get_committed_entry(page)?;
        if !entry.owner.is_allocated() || entry.allocation_csn > self.csn {
            return Ok(false);
        }
        Ok(match entry.owner.deallocating_csn() {
            Some(deallocated) => deallocated > self.csn,
            None => true,
        })
    }

    /// Allocates a new logical page owned by `owner`.
    pub fn allocate_page(&self, owner: PageOwnerId) -> Result<Option<PageId>> {
        let _dealloc = self.segment.deallocation_guard();
        let mut state = self.state.lock();
        let Some(page) = self.segment.allocate_page_id(&mut state.changes, owner)? else {
            return Ok(None);
        };
        self.segment
            .init_page_entry(&mut state.changes, page, page, self.csn)?;
        state.own_pages.insert(page);
        state.resolved.put(page, page);
        Ok(Some(page))
    }

    /// Pins the version of `logical` this snapshot sees, for reading.
    pub fn read_page(&self, logical: PageId) -> Result<PageRef<'_>> {
        let page = self.resolve(logical)?;
        self.segment.pager().pin_shared(page)
    }

    /// Pins a version of `logical` private to this snapshot, for writing,
    /// creating it on first write.
    pub fn write_page(&self, logical: PageId) -> Result<PageMut<'_>> {
        let _dealloc = self.segment.deallocation_guard();
        let mut state = self.state.lock();
        let visible = self.resolve_locked(&mut state, logical)?;
        if state.own_pages.contains(&visible) {
            return self.segment.pager().pin_exclusive(visible);
        }

        let anchor = self.segment.get_page_entry_copy(logical)?;
        if anchor.owner.is_deallocation_deferred() {
            return Err(StrataError::Invalid("page has been deallocated"));
        }
        let source = self.segment.get_page_entry_copy(visible)?;
        let version = self
            .segment
            .allocate_page_id(&mut state.changes, anchor.owner)?
            .ok_or(StrataError::NoSpace)?;

        let pager = self.segment.pager();
        let mut target = pager.pin_exclusive(version)?;
        {
            let original = pager.pin_shared(visible)?;
            target.data_mut().copy_from_slice(original.data());
        }
        self.segment
            .init_page_entry(&mut state.changes, version, anchor.version_chain, self.csn)?;
        self.segment
            .set_page_successor(&mut state.changes, version, source.successor)?;
        self.segment
            .chain_page_entries(&mut state.changes, logical, version, None)?;
        state.own_pages.insert(version);
        state.resolved.put(logical, version);
        self.segment.metrics().version_created();
        debug!(
            logical = logical.0,
            from = visible.0,
            version = version.0,
            "snapshot.cow.new_version"
        );
        Ok(target)
    }

    /// Deallocates the logical page: freed at once when this snapshot
    /// created it, otherwise every version is tagged for reclamation.
    pub fn deallocate(&self, logical: PageId) -> Result<()> {
        let _dealloc = self.segment.deallocation_guard();
        let mut state = self.state.lock();
        let anchor = self.segment.get_page_entry_copy(logical)?;
        if state.own_pages.contains(&logical) && anchor.is_singleton(logical) {
            self.segment.deallocate_page(&mut state.changes, logical)?;
            state.own_pages.remove(&logical);
            state.resolved.pop(&logical);
            return Ok(());
        }
        let mut members = Vec::new();
        for link in self.chain(logical) {
            let link = link?;
            if state.own_pages.contains(&link.page) || link.entry.owner != PageOwnerId::UNCOMMITTED
            {
                members.push(link.page);
            }
        }
        for page in members {
            self.segment
                .defer_deallocation(&mut state.changes, page, self.csn)?;
        }
        state.resolved.pop(&logical);
        Ok(())
    }

    /// Appends every version of `src` to the version chain of `dest`, making
    /// `src`'s versions newer versions of `dest`.
    pub fn version_page(&self, dest: PageId, src: PageId) -> Result<()> {
        let _dealloc = self.segment.deallocation_guard();
        let mut state = self.state.lock();
        let dest_chain = self.chain(dest).collect::<Result<Vec<_>>>()?;
        let src_chain = self.chain(src).collect::<Result<Vec<_>>>()?;
        let newest_dest = dest_chain
            .iter()
            .map(|link| link.entry.allocation_csn)
            .max();
        let oldest_src = src_chain.iter().map(|link| link.entry.allocation_csn).min();
        assert!(
            oldest_src > newest_dest,
            "versions of page {src} must all be newer than those of page {dest}"
        );
        let Some(last_src) = src_chain.last().map(|link| link.page) else {
            return Ok(());
        };
        let old_dest_next = dest_chain[0].entry.version_chain;
        self.segment
            .chain_page_entries(&mut state.changes, dest, src, None)?;
        self.segment
            .chain_page_entries(&mut state.changes, last_src, old_dest_next, None)?;
        state.resolved.pop(&dest);
        state.resolved.pop(&src);
        Ok(())
    }

    /// Makes this snapshot's changes permanent under `commit_csn`.
    pub fn commit(self, commit_csn: Csn) -> Result<()> {
        let _dealloc = self.segment.deallocation_guard();
        let mut state = self.state.lock();
        self.segment.commit(&mut state.changes, commit_csn)
    }

    /// Discards this snapshot's changes.
    pub fn rollback(self) -> Result<()> {
        let _dealloc = self.segment.deallocation_guard();
        let mut state = self.state.lock();
        self.segment.rollback(&mut state.changes)
    }
}

impl Drop for SnapshotSegment {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.changes.is_empty() {
            return;
        }
        warn!(
            csn = self.csn.0,
            pages = state.changes.len(),
            "snapshot.drop.rollback"
        );
        let _dealloc = self.segment.deallocation_guard();
        if let Err(err) = self.segment.rollback(&mut state.changes) {
            warn!(error = %err, "snapshot.drop.rollback_failed");
        }
    }
}
