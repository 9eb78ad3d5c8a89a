use std::fs;
use std::path::Path;

use crate::store::VersionedStore;

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;

/// Opens the store at `path`, failing when the file does not exist.
///
/// # Errors
///
/// Returns [`AdminError::MissingSegment`] for an absent file, or the core
/// error when the file does not hold a segment with the requested geometry.
pub fn open_store(path: &Path, opts: &AdminOpenOptions) -> Result<VersionedStore> {
    if !path.exists() {
        return Err(AdminError::missing_segment(path));
    }
    Ok(VersionedStore::open(path, opts.store_options())?)
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub(crate) fn file_size(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path)?.len())
}
