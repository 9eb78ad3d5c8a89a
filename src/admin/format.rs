use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;
use crate::admin::util::{ensure_parent_dir, file_size};
use crate::store::VersionedStore;

/// Outcome of formatting a new store.
#[derive(Debug, Clone, Serialize)]
pub struct FormatReport {
    /// Store file that was written.
    pub path: String,
    /// Page size in bytes.
    pub page_size: u32,
    /// Pages per extent, including the extent node.
    pub pages_per_extent: u32,
    /// Extents mapped by each segment allocation node.
    pub extents_per_seg_alloc: u32,
    /// Size of the formatted store in pages.
    pub store_pages: u64,
    /// Size of the store file in bytes.
    pub size_bytes: u64,
}

/// Creates an empty versioned store at `path`.
///
/// Refuses to replace an existing file unless `opts.overwrite` is set.
pub fn format(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<FormatReport> {
    let path = path.as_ref();
    if path.exists() && !opts.overwrite {
        return Err(AdminError::AlreadyExists(path.to_path_buf()));
    }
    ensure_parent_dir(path)?;
    let stats = {
        let store = VersionedStore::create(path, opts.store_options())?;
        store.stats()
    };
    info!(path = %path.display(), pages = stats.store_pages, "admin.format");
    Ok(FormatReport {
        path: path.display().to_string(),
        page_size: stats.page_size,
        pages_per_extent: stats.pages_per_extent,
        extents_per_seg_alloc: stats.extents_per_seg_alloc,
        store_pages: stats.store_pages,
        size_bytes: file_size(path)?,
    })
}
