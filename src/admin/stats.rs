use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::{file_size, open_store};
use crate::admin::Result;

/// Snapshot of a store's geometry, page counters and cache activity.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// Segment shape.
    pub geometry: GeometrySection,
    /// Page counters.
    pub pages: PageSection,
    /// Pager cache activity.
    pub cache: CacheSection,
    /// Backing file details.
    pub filesystem: FilesystemStats,
}

/// Segment shape fixed at format time.
#[derive(Debug, Clone, Serialize)]
pub struct GeometrySection {
    /// Page size in bytes.
    pub page_size: u32,
    /// Pages per extent, including the extent node.
    pub pages_per_extent: u32,
    /// Extents mapped by each segment allocation node.
    pub extents_per_seg_alloc: u32,
}

/// Page counters of the versioned segment.
#[derive(Debug, Clone, Serialize)]
pub struct PageSection {
    /// Size of the store in pages.
    pub store_pages: u64,
    /// Data pages currently allocated.
    pub allocated: u64,
    /// Pages ever occupied, node pages included.
    pub high_water: u64,
    /// Scratch pages holding staged nodes.
    pub scratch_pages_in_use: u64,
}

/// Pager cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSection {
    /// Frames in the cache.
    pub cache_pages: usize,
    /// Pins served from the cache.
    pub hits: u64,
    /// Pins that loaded from the device.
    pub misses: u64,
    /// Frames evicted.
    pub evictions: u64,
    /// Dirty frames written back on eviction.
    pub dirty_writebacks: u64,
}

/// Backing file location and size.
#[derive(Debug, Clone, Serialize)]
pub struct FilesystemStats {
    /// Store file path.
    pub path: String,
    /// File size in bytes.
    pub size_bytes: u64,
}

pub fn stats(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<StatsReport> {
    let path = path.as_ref();
    let store = open_store(path, opts)?;
    let summary = store.stats();

    Ok(StatsReport {
        geometry: GeometrySection {
            page_size: summary.page_size,
            pages_per_extent: summary.pages_per_extent,
            extents_per_seg_alloc: summary.extents_per_seg_alloc,
        },
        pages: PageSection {
            store_pages: summary.store_pages,
            allocated: summary.counts.allocated,
            high_water: summary.counts.high_water,
            scratch_pages_in_use: summary.scratch_pages_in_use,
        },
        cache: CacheSection {
            cache_pages: opts.pager.cache_pages,
            hits: summary.cache.hits,
            misses: summary.cache.misses,
            evictions: summary.cache.evictions,
            dirty_writebacks: summary.cache.dirty_writebacks,
        },
        filesystem: FilesystemStats {
            path: path.display().to_string(),
            size_bytes: file_size(path)?,
        },
    })
}
