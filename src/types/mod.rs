//! Identifier newtypes, sentinels and the crate-wide error type.
#![forbid(unsafe_code)]

use std::fmt;

/// Logical page address within one segment.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

/// Sentinel for "no page".
pub const NULL_PAGE_ID: PageId = PageId(u64::MAX);

impl PageId {
    /// Returns true for the [`NULL_PAGE_ID`] sentinel.
    pub const fn is_null(self) -> bool {
        self.0 == NULL_PAGE_ID.0
    }
}

/// Physical block address on the backing device.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BlockId(pub u64);

/// Commit sequence number, used as the versioning timestamp.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Csn(pub u64);

/// Sentinel stored in entries that have no allocation CSN yet.
pub const NULL_CSN: Csn = Csn(u64::MAX);

/// Tag identifying the logical object owning an allocated page.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageOwnerId(pub u64);

impl PageOwnerId {
    /// Page is free.
    pub const UNALLOCATED: PageOwnerId = PageOwnerId(0);
    /// Allocated without a logical owner; used for allocator metadata pages.
    pub const ANONYMOUS: PageOwnerId = PageOwnerId(0x7fff_ffff_ffff_ffff);
    /// Provisionally allocated by a transaction that has not committed.
    pub const UNCOMMITTED: PageOwnerId = PageOwnerId(0x7fff_ffff_ffff_fffe);

    const DEALLOC_BIT: u64 = 1 << 63;

    /// Encodes the deallocation-deferred state for the given transaction.
    pub fn deallocation_deferred(csn: Csn) -> Self {
        assert!(
            csn.0 & Self::DEALLOC_BIT == 0,
            "csn does not fit in a deferred owner id"
        );
        PageOwnerId(Self::DEALLOC_BIT | csn.0)
    }

    /// Returns true if the page is allocated under any owner.
    pub const fn is_allocated(self) -> bool {
        self.0 != Self::UNALLOCATED.0
    }

    /// Returns true if the owner carries the deallocation-deferred bit.
    pub const fn is_deallocation_deferred(self) -> bool {
        self.0 & Self::DEALLOC_BIT != 0
    }

    /// Returns the deallocating transaction packed into a deferred owner id.
    pub fn deallocating_csn(self) -> Option<Csn> {
        if self.is_deallocation_deferred() {
            Some(Csn(self.0 & !Self::DEALLOC_BIT))
        } else {
            None
        }
    }
}

/// Errors surfaced by the storage core.
#[derive(thiserror::Error, Debug)]
pub enum StrataError {
    /// Failure from the backing device.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted metadata does not decode.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument outside the accepted domain.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The scratch segment could not grow to stage another node.
    #[error("scratch segment exhausted")]
    ScratchExhausted,
    /// The store could not grow to hold a new page version.
    #[error("no space left to create a page version")]
    NoSpace,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StrataError>;

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageOwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PageOwnerId::UNALLOCATED => f.write_str("unallocated"),
            PageOwnerId::ANONYMOUS => f.write_str("anonymous"),
            PageOwnerId::UNCOMMITTED => f.write_str("uncommitted"),
            other => match other.deallocating_csn() {
                Some(csn) => write!(f, "deferred@{csn}"),
                None => write!(f, "{:#x}", other.0),
            },
        }
    }
}

impl From<u64> for Csn {
    fn from(value: u64) -> Self {
        Csn(value)
    }
}
