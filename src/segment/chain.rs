use crate::segment::node::VersionedEntry;
use crate::types::{PageId, Result};

/// One member of a version chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainLink {
    /// Page holding this version.
    pub page: PageId,
    /// Entry describing it.
    pub entry: VersionedEntry,
    /// True for the page the walk started from.
    pub is_anchor: bool,
}

/// Walks the circular version chain starting at `start`, yielding each
/// member once.
///
/// The walk is bounded: a chain that has not closed after `limit` members is
/// corrupt and the cursor panics.
pub struct ChainCursor<F> {
    start: PageId,
    next: Option<PageId>,
    remaining: u64,
    fetch: F,
}

impl<F> ChainCursor<F>
where
    F: FnMut(PageId) -> Result<VersionedEntry>,
{
    /// Creates a cursor; `fetch` loads the entry of a page.
    pub fn new(start: PageId, limit: u64, fetch: F) -> Self {
        Self {
            start,
            next: Some(start),
            remaining: limit.max(1),
            fetch,
        }
    }

    /// First page of the walk.
    pub fn start(&self) -> PageId {
        self.start
    }
}

impl<F> Iterator for ChainCursor<F>
where
    F: FnMut(PageId) -> Result<VersionedEntry>,
{
    type Item = Result<ChainLink>;

    fn next(&mut self) -> Option<Self::Item> {
        let page = self.next.take()?;
        if self.remaining == 0 {
            panic!("version chain starting at {} failed to close", self.start);
        }
        self.remaining -= 1;
        let entry = match (self.fetch)(page) {
            Ok(entry) => entry,
            Err(err) => return Some(Err(err)),
        };
        assert!(
            entry.owner.is_allocated(),
            "version chain starting at {} reaches unallocated page {page}",
            self.start
        );
        assert!(
            !entry.version_chain.is_null(),
            "version chain starting at {} is cut at page {page}",
            self.start
        );
        if entry.version_chain != self.start {
            self.next = Some(entry.version_chain);
        }
        Some(Ok(ChainLink {
            page,
            entry,
            is_anchor: page == self.start,
        }))
    }
}

/// Collects a whole chain.
pub fn collect_chain<F>(start: PageId, limit: u64, fetch: F) -> Result<Vec<ChainLink>>
where
    F: FnMut(PageId) -> Result<VersionedEntry>,
{
    ChainCursor::new(start, limit, fetch).collect()
}
