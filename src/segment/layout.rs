//! PageId arithmetic for extent-based segments.
//!
//! A segment is a sequence of allocation blocks. Each block starts with one
//! segment allocation node page followed by `extents_per_seg_alloc` extents of
//! `pages_per_extent` pages; the first page of every extent is its extent
//! allocation node.

use crate::types::PageId;

/// Absolute extent number within a segment.
pub type ExtentNum = u64;

/// Immutable shape of a segment, fixed at format time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExtentGeometry {
    pages_per_extent: u32,
    extents_per_seg_alloc: u32,
}

/// Where a page sits within the segment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageSlot {
    /// The page is a segment allocation node.
    SegAllocNode {
        /// Index of the allocation block.
        seg_index: u64,
    },
    /// The page lives inside an extent; offset 0 is the extent node itself.
    Extent {
        /// Index of the allocation block.
        seg_index: u64,
        /// Absolute extent number.
        extent: ExtentNum,
        /// Position of the page within the extent.
        offset: u32,
    },
}

impl ExtentGeometry {
    /// Builds a geometry; both counts must allow at least one data page.
    pub fn new(pages_per_extent: u32, extents_per_seg_alloc: u32) -> Self {
        assert!(pages_per_extent >= 2, "extent needs room for a data page");
        assert!(extents_per_seg_alloc >= 1, "allocation block needs an extent");
        Self {
            pages_per_extent,
            extents_per_seg_alloc,
        }
    }

    /// Pages per extent, including the extent node.
    pub fn pages_per_extent(&self) -> u32 {
        self.pages_per_extent
    }

    /// Extents mapped by one segment allocation node.
    pub fn extents_per_seg_alloc(&self) -> u32 {
        self.extents_per_seg_alloc
    }

    /// Pages spanned by one allocation block, including its node page.
    pub fn pages_per_seg_alloc(&self) -> u64 {
        self.pages_per_extent as u64 * self.extents_per_seg_alloc as u64 + 1
    }

    /// Page holding the segment allocation node of block `seg_index`.
    pub fn seg_alloc_page_id(&self, seg_index: u64) -> PageId {
        PageId(seg_index * self.pages_per_seg_alloc())
    }

    /// Allocation block that maps `extent`.
    pub fn seg_index_of(&self, extent: ExtentNum) -> u64 {
        extent / self.extents_per_seg_alloc as u64
    }

    /// Position of `extent` within its allocation block.
    pub fn relative_extent(&self, extent: ExtentNum) -> u32 {
        (extent % self.extents_per_seg_alloc as u64) as u32
    }

    /// Page holding the extent allocation node of `extent`.
    pub fn extent_alloc_page_id(&self, extent: ExtentNum) -> PageId {
        let seg_index = self.seg_index_of(extent);
        let rel = self.relative_extent(extent) as u64;
        PageId(
            self.seg_alloc_page_id(seg_index).0 + 1 + rel * self.pages_per_extent as u64,
        )
    }

    /// Exclusive end of `extent`, in pages; the store must reach this size.
    pub fn extent_end(&self, extent: ExtentNum) -> u64 {
        self.extent_alloc_page_id(extent).0 + self.pages_per_extent as u64
    }

    /// Composes the page id of `offset` within `extent`.
    pub fn make_page_id(&self, extent: ExtentNum, offset: u32) -> PageId {
        debug_assert!(offset < self.pages_per_extent);
        PageId(self.extent_alloc_page_id(extent).0 + offset as u64)
    }

    /// Decomposes a page id.
    pub fn split_page_id(&self, page: PageId) -> PageSlot {
        let per_block = self.pages_per_seg_alloc();
        let seg_index = page.0 / per_block;
        let in_block = page.0 % per_block;
        if in_block == 0 {
            return PageSlot::SegAllocNode { seg_index };
        }
        let in_block = in_block - 1;
        let extent = in_block / self.pages_per_extent as u64
            + self.extents_per_seg_alloc as u64 * seg_index;
        let offset = (in_block % self.pages_per_extent as u64) as u32;
        PageSlot::Extent {
            seg_index,
            extent,
            offset,
        }
    }

    /// Splits a page that must be a data page, panicking on node pages.
    pub fn split_data_page(&self, page: PageId) -> (u64, ExtentNum, u32) {
        match self.split_page_id(page) {
            PageSlot::Extent {
                seg_index,
                extent,
                offset,
            } if offset > 0 => (seg_index, extent, offset),
            other => panic!("page {page} is allocator metadata ({other:?}), not a data page"),
        }
    }
}
