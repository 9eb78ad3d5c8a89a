#![forbid(unsafe_code)]

//! Store administration and maintenance utilities.
//!
//! This module provides administrative functions for managing strata stores:
//! formatting, statistics reporting, metadata verification and offline
//! reclamation of old page versions.

mod error;
mod format;
mod options;
mod reclaim;
mod stats;
mod util;
mod verify;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Creates an empty store.
pub use format::{format, FormatReport};

/// Configuration options for opening a store in admin mode.
pub use options::AdminOpenOptions;

/// Offline reclamation of page versions no snapshot can observe.
pub use reclaim::{reclaim, ReclaimOptions, ReclaimReport};

/// Statistics collection and reporting.
///
/// Gathers the segment geometry, page counters, cache activity and file size.
pub use stats::{stats, CacheSection, FilesystemStats, GeometrySection, PageSection, StatsReport};

/// Allocation metadata verification.
pub use verify::{verify, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport, VerifySeverity};

pub use crate::primitives::pager::PagerOptions;

/// Utility functions for opening store components.
pub use util::open_store;
