use std::sync::Arc;

use super::layout::ExtentGeometry;
use super::metrics::{default_metrics, SegmentMetrics};
use super::node::{seg_node_len, PageEntry};
use crate::types::{Result, StrataError};

/// Configuration options supplied when creating or opening a segment.
#[derive(Clone)]
pub struct SegmentOptions {
    /// Pages per extent, including the extent node. Defaults to as many
    /// entries as fit in one page.
    pub pages_per_extent: Option<u32>,
    /// Extents mapped by one segment allocation node. Defaults to as many
    /// free counters as fit in one page.
    pub extents_per_seg_alloc: Option<u32>,
    /// Capacity of the per-snapshot resolved-version cache.
    pub resolve_cache_capacity: usize,
    /// Optional metrics collection implementation.
    pub metrics: Option<Arc<dyn SegmentMetrics>>,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            pages_per_extent: None,
            extents_per_seg_alloc: None,
            resolve_cache_capacity: 256,
            metrics: None,
        }
    }
}

impl SegmentOptions {
    /// Overrides the number of pages per extent.
    pub fn pages_per_extent(mut self, pages: u32) -> Self {
        self.pages_per_extent = Some(pages);
        self
    }

    /// Overrides the number of extents per segment allocation node.
    pub fn extents_per_seg_alloc(mut self, extents: u32) -> Self {
        self.extents_per_seg_alloc = Some(extents);
        self
    }

    /// Sets the resolved-version cache capacity of each snapshot.
    pub fn resolve_cache_capacity(mut self, entries: usize) -> Self {
        self.resolve_cache_capacity = entries;
        self
    }

    /// Installs a metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn SegmentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub(crate) fn metrics_handle(&self) -> Arc<dyn SegmentMetrics> {
        self.metrics.clone().unwrap_or_else(default_metrics)
    }

    /// Resolves the geometry for entries of type `E` on pages of
    /// `page_size` bytes, validating any overrides.
    pub(crate) fn geometry<E: PageEntry>(&self, page_size: u32) -> Result<ExtentGeometry> {
        let page_size = page_size as usize;
        let max_pages_per_extent = (page_size / E::LEN) as u32;
        let max_extents = ((page_size - seg_node_len(0)) / 4) as u32;
        let pages_per_extent = self.pages_per_extent.unwrap_or(max_pages_per_extent);
        let extents = self.extents_per_seg_alloc.unwrap_or(max_extents);
        if pages_per_extent < 2 || pages_per_extent > max_pages_per_extent {
            return Err(StrataError::Invalid(
                "pages per extent must leave room for a data page and fit in one node page",
            ));
        }
        if extents == 0 || extents > max_extents {
            return Err(StrataError::Invalid(
                "extents per allocation node must be non-zero and fit in one node page",
            ));
        }
        Ok(ExtentGeometry::new(pages_per_extent, extents))
    }
}
