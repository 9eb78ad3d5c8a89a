//! Persisted allocation node layouts and page entry shapes.
//!
//! Both node kinds are little-endian and occupy one page each:
//!
//! * segment allocation node: `next: u64 | extent_size: u64 | extent_count: u32`
//!   followed by one `u32` free counter per mapped extent;
//! * extent allocation node: one page entry per page of the extent, entry 0
//!   describing the node page itself.

use core::fmt::Debug;
use core::ops::Range;

use crate::primitives::bytes::le;
use crate::types::{Csn, PageId, PageOwnerId, NULL_CSN, NULL_PAGE_ID};

pub mod seg_header {
    //! Byte offsets for segment allocation node fields.
    use core::ops::Range;

    /// Next node in the chain.
    pub const NEXT: Range<usize> = 0..8;
    /// Pages per extent; zero on an unformatted page.
    pub const EXTENT_SIZE: Range<usize> = 8..16;
    /// Extents mapped by the node.
    pub const EXTENT_COUNT: Range<usize> = 16..20;
    /// Start of the per-extent free counters.
    pub const ENTRIES: usize = 20;
    /// Width of one free counter.
    pub const ENTRY_LEN: usize = 4;
}

/// Bytes a segment allocation node needs to map `count` extents.
pub const fn seg_node_len(count: u32) -> usize {
    seg_header::ENTRIES + count as usize * seg_header::ENTRY_LEN
}

/// View over a segment allocation node page.
pub struct SegAllocNode<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> SegAllocNode<B> {
    /// Wraps a page buffer.
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// Next node in the chain, or [`NULL_PAGE_ID`].
    pub fn next(&self) -> PageId {
        PageId(le::get_u64(&self.bytes()[seg_header::NEXT]))
    }

    /// Declared pages per extent; zero means the page was never formatted.
    pub fn extent_size(&self) -> u64 {
        le::get_u64(&self.bytes()[seg_header::EXTENT_SIZE])
    }

    /// Number of extents mapped by this node.
    pub fn extent_count(&self) -> u32 {
        le::get_u32(&self.bytes()[seg_header::EXTENT_COUNT])
    }

    /// Unallocated pages in the `rel`-th extent of this node.
    pub fn free_count(&self, rel: u32) -> u32 {
        le::get_u32(&self.bytes()[entry_range(rel)])
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SegAllocNode<B> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// Initializes an empty node.
    pub fn format(&mut self, pages_per_extent: u32) {
        self.bytes_mut().fill(0);
        self.set_next(NULL_PAGE_ID);
        le::put_u64(
            &mut self.bytes_mut()[seg_header::EXTENT_SIZE],
            pages_per_extent as u64,
        );
        self.set_extent_count(0);
    }

    /// Updates the forward link.
    pub fn set_next(&mut self, next: PageId) {
        le::put_u64(&mut self.bytes_mut()[seg_header::NEXT], next.0);
    }

    /// Updates the number of mapped extents.
    pub fn set_extent_count(&mut self, count: u32) {
        le::put_u32(&mut self.bytes_mut()[seg_header::EXTENT_COUNT], count);
    }

    /// Updates the free counter of the `rel`-th extent.
    pub fn set_free_count(&mut self, rel: u32, free: u32) {
        le::put_u32(&mut self.bytes_mut()[entry_range(rel)], free);
    }

    /// Applies a signed delta to a free counter, asserting it stays in
    /// `0..pages_per_extent`.
    pub fn adjust_free_count(&mut self, rel: u32, delta: i64, pages_per_extent: u32) {
        let next = self.free_count(rel) as i64 + delta;
        assert!(
            (0..pages_per_extent as i64).contains(&next),
            "extent free counter out of range: {next} (extent size {pages_per_extent})"
        );
        self.set_free_count(rel, next as u32);
    }
}

fn entry_range(rel: u32) -> Range<usize> {
    let start = seg_header::ENTRIES + rel as usize * seg_header::ENTRY_LEN;
    start..start + seg_header::ENTRY_LEN
}

/// Capabilities the generic allocator needs from a page entry.
pub trait PageEntry: Copy + Debug + Eq + Send + Sync + 'static {
    /// Encoded length in bytes.
    const LEN: usize;

    /// Decodes an entry from `src[..LEN]`.
    fn decode(src: &[u8]) -> Self;
    /// Encodes the entry into `dst[..LEN]`.
    fn encode(&self, dst: &mut [u8]);
    /// Entry describing a free page.
    fn unused() -> Self;
    /// Current owner.
    fn owner(&self) -> PageOwnerId;
    /// Replaces the owner.
    fn set_owner(&mut self, owner: PageOwnerId);
    /// Successor page in a linear page chain.
    fn successor(&self) -> PageId;
    /// Replaces the successor.
    fn set_successor(&mut self, successor: PageId);
    /// Claims a free entry for `page` on behalf of `owner`.
    fn claim(&mut self, page: PageId, owner: PageOwnerId);

    /// Resets the entry to the free state.
    fn mark_unused(&mut self) {
        *self = Self::unused();
    }
}

/// Entry of a non-versioned extent: `owner: u64 | successor: u64`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PlainEntry {
    /// Owning object.
    pub owner: PageOwnerId,
    /// Successor page.
    pub successor: PageId,
}

impl PageEntry for PlainEntry {
    const LEN: usize = 16;

    fn decode(src: &[u8]) -> Self {
        Self {
            owner: PageOwnerId(le::get_u64(&src[0..8])),
            successor: PageId(le::get_u64(&src[8..16])),
        }
    }

    fn encode(&self, dst: &mut [u8]) {
        le::put_u64(&mut dst[0..8], self.owner.0);
        le::put_u64(&mut dst[8..16], self.successor.0);
    }

    fn unused() -> Self {
        Self {
            owner: PageOwnerId::UNALLOCATED,
            successor: NULL_PAGE_ID,
        }
    }

    fn owner(&self) -> PageOwnerId {
        self.owner
    }

    fn set_owner(&mut self, owner: PageOwnerId) {
        self.owner = owner;
    }

    fn successor(&self) -> PageId {
        self.successor
    }

    fn set_successor(&mut self, successor: PageId) {
        self.successor = successor;
    }

    fn claim(&mut self, _page: PageId, owner: PageOwnerId) {
        self.owner = owner;
        self.successor = NULL_PAGE_ID;
    }
}

/// Entry of a versioned extent:
/// `owner: u64 | successor: u64 | allocation_csn: u64 | version_chain: u64`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VersionedEntry {
    /// Owning object, or a sentinel / deferred-deallocation marker.
    pub owner: PageOwnerId,
    /// Successor page.
    pub successor: PageId,
    /// CSN at which this version was created.
    pub allocation_csn: Csn,
    /// Next entry in the circular chain of versions of one logical page.
    pub version_chain: PageId,
}

impl VersionedEntry {
    /// True when no other version of the page exists.
    pub fn is_singleton(&self, page: PageId) -> bool {
        self.version_chain == page
    }
}

impl PageEntry for VersionedEntry {
    const LEN: usize = 32;

    fn decode(src: &[u8]) -> Self {
        Self {
            owner: PageOwnerId(le::get_u64(&src[0..8])),
            successor: PageId(le::get_u64(&src[8..16])),
            allocation_csn: Csn(le::get_u64(&src[16..24])),
            version_chain: PageId(le::get_u64(&src[24..32])),
        }
    }

    fn encode(&self, dst: &mut [u8]) {
        le::put_u64(&mut dst[0..8], self.owner.0);
        le::put_u64(&mut dst[8..16], self.successor.0);
        le::put_u64(&mut dst[16..24], self.allocation_csn.0);
        le::put_u64(&mut dst[24..32], self.version_chain.0);
    }

    fn unused() -> Self {
        Self {
            owner: PageOwnerId::UNALLOCATED,
            successor: NULL_PAGE_ID,
            allocation_csn: NULL_CSN,
            version_chain: NULL_PAGE_ID,
        }
    }

    fn owner(&self) -> PageOwnerId {
        self.owner
    }

    fn set_owner(&mut self, owner: PageOwnerId) {
        self.owner = owner;
    }

    fn successor(&self) -> PageId {
        self.successor
    }

    fn set_successor(&mut self, successor: PageId) {
        self.successor = successor;
    }

    fn claim(&mut self, page: PageId, owner: PageOwnerId) {
        self.owner = owner;
        self.successor = NULL_PAGE_ID;
        self.allocation_csn = NULL_CSN;
        self.version_chain = page;
    }
}

/// Reads entry `offset` of an extent allocation node.
pub fn read_entry<E: PageEntry>(page: &[u8], offset: u32) -> E {
    let start = offset as usize * E::LEN;
    E::decode(&page[start..start + E::LEN])
}

/// Writes entry `offset` of an extent allocation node.
pub fn write_entry<E: PageEntry>(page: &mut [u8], offset: u32, entry: &E) {
    let start = offset as usize * E::LEN;
    entry.encode(&mut page[start..start + E::LEN]);
}

/// Initializes an extent allocation node: entry 0 is the node itself and
/// stays anonymous, every other entry is free.
pub fn format_extent_node<E: PageEntry>(page: &mut [u8], pages_per_extent: u32) {
    page.fill(0);
    let mut header = E::unused();
    header.set_owner(PageOwnerId::ANONYMOUS);
    write_entry(page, 0, &header);
    let unused = E::unused();
    for offset in 1..pages_per_extent {
        write_entry(page, offset, &unused);
    }
}
