#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::types::{Result, StrataError};

/// Positioned I/O over a block device backing one page store.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` with bytes starting at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` starting at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current device length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the device holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Shrinks or extends the device to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
    /// Largest length the device can be extended to, if bounded.
    fn capacity_limit(&self) -> Option<u64> {
        None
    }
}

#[cfg(unix)]
mod platform {
    use std::{fs::File, io, os::unix::fs::FileExt};

    pub fn read_some(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.read_at(dst, off)
    }

    pub fn write_some(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.write_at(src, off)
    }
}

#[cfg(windows)]
mod platform {
    use std::{fs::File, io, os::windows::fs::FileExt};

    pub fn read_some(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.seek_read(dst, off)
    }

    pub fn write_some(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.seek_write(src, off)
    }
}

/// File-backed device using positional reads and writes.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens `path` read-write, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    fn read_exact(&self, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = platform::read_some(&self.inner, dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "positioned read reached EOF",
                ));
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    fn write_all(&self, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = platform::write_some(&self.inner, src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "positioned write made no progress",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.read_exact(off, dst).map_err(StrataError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.write_all(off, src).map_err(StrataError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(StrataError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(StrataError::from)
    }
}

/// Volatile device kept in memory.
///
/// Scratch segments live on one of these; tests use the optional ceiling to
/// exercise the "cannot grow" path of the allocator.
#[derive(Default)]
pub struct MemIo {
    bytes: Mutex<Vec<u8>>,
    limit: Option<u64>,
}

impl MemIo {
    /// Creates an empty, unbounded device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty device that refuses to grow past `limit` bytes.
    pub fn with_limit(limit: u64) -> Self {
        Self {
            bytes: Mutex::new(Vec::new()),
            limit: Some(limit),
        }
    }
}

impl FileIo for MemIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let start = off as usize;
        let end = start
            .checked_add(dst.len())
            .ok_or(StrataError::Invalid("read range overflow"))?;
        if end > bytes.len() {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "read past end of device").into());
        }
        dst.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let start = off as usize;
        let end = start
            .checked_add(src.len())
            .ok_or(StrataError::Invalid("write range overflow"))?;
        if let Some(limit) = self.limit {
            if end as u64 > limit {
                return Err(io::Error::new(ErrorKind::Other, "device limit reached").into());
            }
        }
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        if let Some(limit) = self.limit {
            if len > limit {
                return Err(StrataError::Invalid("device limit reached"));
            }
        }
        self.bytes.lock().resize(len as usize, 0);
        Ok(())
    }

    fn capacity_limit(&self) -> Option<u64> {
        self.limit
    }
}
