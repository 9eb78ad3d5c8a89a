use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_store;
use crate::admin::Result;
use crate::types::Csn;

/// Configuration for an offline reclamation pass.
#[derive(Clone, Copy, Debug)]
pub struct ReclaimOptions {
    /// Oldest snapshot CSN that must remain readable.
    pub oldest_active: Csn,
    /// Candidates gathered before each batch is freed.
    pub batch: usize,
}

impl Default for ReclaimOptions {
    fn default() -> Self {
        Self {
            oldest_active: Csn(u64::MAX),
            batch: 256,
        }
    }
}

/// Outcome of a reclamation pass.
#[derive(Clone, Debug, Serialize)]
pub struct ReclaimReport {
    /// Reclamation horizon.
    pub oldest_active: u64,
    /// Batches run.
    pub batches: u64,
    /// Candidate pages examined.
    pub candidates: u64,
    /// Versions freed.
    pub freed: u64,
    /// Allocated data pages before the pass.
    pub allocated_before: u64,
    /// Allocated data pages after the pass.
    pub allocated_after: u64,
}

/// Frees every page version older than `options.oldest_active` that no
/// snapshot can reach, then flushes the store.
pub fn reclaim(
    path: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    options: &ReclaimOptions,
) -> Result<ReclaimReport> {
    let store = open_store(path.as_ref(), opts)?;
    let allocated_before = store.segment().allocated_size_in_pages();
    let mut report = ReclaimReport {
        oldest_active: options.oldest_active.0,
        batches: 0,
        candidates: 0,
        freed: 0,
        allocated_before,
        allocated_after: allocated_before,
    };
    loop {
        let outcome = store.reclaim(options.oldest_active, options.batch.max(1))?;
        report.batches += 1;
        report.candidates += outcome.candidates;
        report.freed += outcome.freed;
        if !outcome.more {
            break;
        }
    }
    store.flush()?;
    report.allocated_after = store.segment().allocated_size_in_pages();
    info!(
        freed = report.freed,
        batches = report.batches,
        "admin.reclaim.complete"
    );
    Ok(report)
}
