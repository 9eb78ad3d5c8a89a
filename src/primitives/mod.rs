//! Low-level primitives the allocation segments are built on.
//!
//! Includes fixed-width byte codecs, positioned device I/O, and the page
//! cache that pins, grows and discards pages of a linear store.

/// Fixed-width little-endian field codecs.
pub mod bytes;

/// I/O abstractions over block devices.
pub mod io;

/// Page cache over a linear block device.
///
/// Pins pages in shared or exclusive mode, grows the store on demand and
/// writes dirty frames back on eviction or flush.
pub mod pager;
