//! Strata: a versioned page allocator.
//!
//! Pages of a linear store are handed out by extent-based allocation
//! segments. The versioned segment stages its allocation metadata per
//! transaction, so uncommitted allocations stay invisible until commit, and
//! keeps every logical page as a ring of versions stamped with commit
//! sequence numbers. Snapshots resolve a logical page to the version visible
//! at their CSN and copy on write; reclamation frees versions no active
//! snapshot can reach.
//!
//! Start from [`store::VersionedStore`].

#![warn(missing_docs)]

pub mod admin;
pub mod primitives;
pub mod segment;
pub mod store;
pub mod types;

pub use store::{ReclaimOutcome, StoreOptions, StoreStats, VersionedStore};
pub use types::{Csn, PageId, PageOwnerId, Result, StrataError};
