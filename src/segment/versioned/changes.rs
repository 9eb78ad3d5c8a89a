use std::collections::BTreeMap;

use crate::types::{PageId, PageOwnerId};

/// Last kind of metadata change a transaction made to a page entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModKind {
    /// The page was allocated by the transaction.
    Allocated,
    /// The page was freed by the transaction.
    Deallocated,
    /// Some other field of the entry changed.
    Modified,
}

/// Per-page record of the staged updates a transaction owes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ModifiedPageEntry {
    /// Extent-node stagings to release.
    pub update_count: u64,
    /// Segment-node stagings to release.
    pub allocation_count: u64,
    /// Most recent change kind; an allocation is never downgraded to
    /// [`ModKind::Modified`].
    pub last_mod: ModKind,
    /// Whether the transaction allocated the page.
    pub allocated_here: bool,
    /// Owner to install at commit in place of the provisional one.
    pub owner: PageOwnerId,
}

impl ModifiedPageEntry {
    fn new(last_mod: ModKind) -> Self {
        Self {
            update_count: 0,
            allocation_count: 0,
            last_mod,
            allocated_here: false,
            owner: PageOwnerId::UNALLOCATED,
        }
    }

    /// Net effect of the transaction on the extent's free counter, in
    /// allocated pages.
    pub fn net_allocations(&self) -> i64 {
        match (self.allocated_here, self.last_mod) {
            (true, ModKind::Deallocated) => 0,
            (true, _) => 1,
            (false, ModKind::Deallocated) => -1,
            (false, _) => 0,
        }
    }
}

/// Page entries touched by one transaction, in page order.
#[derive(Debug, Default)]
pub struct TxnChanges {
    pages: BTreeMap<PageId, ModifiedPageEntry>,
}

impl TxnChanges {
    /// Creates an empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Number of pages touched.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Record for `page`, if touched.
    pub fn get(&self, page: PageId) -> Option<&ModifiedPageEntry> {
        self.pages.get(&page)
    }

    /// Iterates records in page order.
    pub fn iter(&self) -> impl Iterator<Item = (PageId, &ModifiedPageEntry)> {
        self.pages.iter().map(|(page, entry)| (*page, entry))
    }

    pub(crate) fn record_allocation(&mut self, page: PageId, owner: PageOwnerId) {
        let entry = self
            .pages
            .entry(page)
            .or_insert_with(|| ModifiedPageEntry::new(ModKind::Allocated));
        entry.update_count += 1;
        entry.allocation_count += 1;
        entry.last_mod = ModKind::Allocated;
        entry.allocated_here = true;
        entry.owner = owner;
    }

    pub(crate) fn record_free(&mut self, page: PageId) {
        let entry = self
            .pages
            .entry(page)
            .or_insert_with(|| ModifiedPageEntry::new(ModKind::Deallocated));
        entry.update_count += 1;
        entry.allocation_count += 1;
        entry.last_mod = ModKind::Deallocated;
    }

    pub(crate) fn record_update(&mut self, page: PageId) {
        let entry = self
            .pages
            .entry(page)
            .or_insert_with(|| ModifiedPageEntry::new(ModKind::Modified));
        entry.update_count += 1;
    }

    pub(crate) fn take(&mut self) -> TxnChanges {
        std::mem::take(self)
    }
}
