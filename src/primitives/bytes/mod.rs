#![forbid(unsafe_code)]
//! Fixed-width field codecs for persisted allocation nodes.
//!
//! Node layouts are little-endian; callers slice the page with the `Range`
//! constants of each node kind and use these helpers on the slice.

pub mod le {
    //! Little-endian put/get over byte slices.

    use core::convert::TryInto;

    /// Writes `v` into the first eight bytes of `dst`.
    pub fn put_u64(dst: &mut [u8], v: u64) {
        dst[..8].copy_from_slice(&v.to_le_bytes());
    }

    /// Reads a u64 from the first eight bytes of `src`.
    pub fn get_u64(src: &[u8]) -> u64 {
        let bytes: [u8; 8] = src
            .get(..8)
            .and_then(|head| head.try_into().ok())
            .unwrap_or_else(|| panic!("u64 source shorter than 8 bytes (have {})", src.len()));
        u64::from_le_bytes(bytes)
    }

    /// Writes `v` into the first four bytes of `dst`.
    pub fn put_u32(dst: &mut [u8], v: u32) {
        dst[..4].copy_from_slice(&v.to_le_bytes());
    }

    /// Reads a u32 from the first four bytes of `src`.
    pub fn get_u32(src: &[u8]) -> u32 {
        let bytes: [u8; 4] = src
            .get(..4)
            .and_then(|head| head.try_into().ok())
            .unwrap_or_else(|| panic!("u32 source shorter than 4 bytes (have {})", src.len()));
        u32::from_le_bytes(bytes)
    }

}
