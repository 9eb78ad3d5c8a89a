use crate::primitives::pager::PagerOptions;
use crate::segment::SegmentOptions;
use crate::store::StoreOptions;

/// Common options used when opening a store for administrative commands.
#[derive(Clone, Debug, Default)]
pub struct AdminOpenOptions {
    /// Pager configuration options.
    pub pager: PagerOptions,
    /// Pages per extent; derived from the page size when unset.
    pub pages_per_extent: Option<u32>,
    /// Extents per segment allocation node; derived from the page size when unset.
    pub extents_per_seg_alloc: Option<u32>,
    /// Whether `format` may overwrite an existing file.
    pub overwrite: bool,
}

impl AdminOpenOptions {
    pub(crate) fn store_options(&self) -> StoreOptions {
        let mut segment = SegmentOptions::default();
        if let Some(pages) = self.pages_per_extent {
            segment = segment.pages_per_extent(pages);
        }
        if let Some(extents) = self.extents_per_seg_alloc {
            segment = segment.extents_per_seg_alloc(extents);
        }
        StoreOptions::default()
            .pager(self.pager.clone())
            .segment(segment)
    }
}
