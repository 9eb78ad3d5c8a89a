use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_store;
use crate::admin::Result;

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Recount the page counters from the segment allocation nodes only.
    Fast,
    /// Also walk every extent node and compare entries with free counters.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Non-critical issue that may indicate a problem.
    Warning,
    /// Critical issue indicating metadata corruption.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Warning,
            message: message.into(),
        }
    }
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Segment allocation nodes walked; zero for a fast pass.
    pub seg_nodes: u64,
    /// Extents walked; zero for a fast pass.
    pub extents: u64,
    /// Allocated data pages according to the free counters.
    pub allocated_pages: u64,
    /// Allocated data pages according to the extent entries; zero for a fast pass.
    pub allocated_entries: u64,
    /// Highest page ever occupied, node pages included.
    pub high_water: u64,
    /// Size of the store in pages.
    pub store_pages: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Whether verification passed without finding any issues.
    pub success: bool,
    /// List of issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the metadata examined.
    pub counts: VerifyCounts,
}

/// Verifies the allocation metadata of a versioned store.
///
/// - `VerifyLevel::Fast`: recount pages from the segment allocation nodes and
///   check them against the store size
/// - `VerifyLevel::Full`: additionally compare every extent's free counter
///   with its entries
///
/// # Errors
///
/// Returns an error if the store cannot be opened or if I/O operations fail.
/// Structural corruption found while opening is reported through the error.
pub fn verify(
    path: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    level: VerifyLevel,
) -> Result<VerifyReport> {
    let store = open_store(path.as_ref(), opts)?;
    let segment = store.segment();
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();

    let recount = segment.count_allocated_pages()?;
    counts.allocated_pages = recount.allocated;
    counts.high_water = recount.high_water;
    counts.store_pages = segment.pager().allocated_pages();
    if recount.high_water > counts.store_pages {
        push(
            &mut findings,
            VerifyFinding::error(format!(
                "high water {} exceeds store size {}",
                recount.high_water, counts.store_pages
            )),
        );
    }
    let in_use = store.scratch_pages_in_use();
    if in_use != 0 {
        push(
            &mut findings,
            VerifyFinding::warning(format!("{in_use} scratch pages in use with no transaction")),
        );
    }

    match level {
        VerifyLevel::Fast => {}
        VerifyLevel::Full => {
            let report = segment.verify()?;
            counts.seg_nodes = report.seg_nodes;
            counts.extents = report.extents;
            counts.allocated_entries = report.allocated_pages;
            for message in report.findings {
                push(&mut findings, VerifyFinding::error(message));
            }
            if report.allocated_pages != recount.allocated {
                push(
                    &mut findings,
                    VerifyFinding::error(format!(
                        "free counters account for {} pages but {} entries are allocated",
                        recount.allocated, report.allocated_pages
                    )),
                );
            }
        }
    }

    let success = !findings
        .iter()
        .any(|finding| matches!(finding.severity, VerifySeverity::Error));
    Ok(VerifyReport {
        level,
        success,
        findings,
        counts,
    })
}

fn push(findings: &mut Vec<VerifyFinding>, finding: VerifyFinding) {
    if findings.len() < MAX_FINDINGS {
        findings.push(finding);
    }
}
