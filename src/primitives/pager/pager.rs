use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::frame::Frame;
use crate::primitives::io::{FileIo, MemIo, StdFileIo};
use crate::types::{BlockId, PageId, Result, StrataError};

/// Configuration options for a page store.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Size of each page in bytes.
    pub page_size: u32,
    /// Number of frames held by the cache.
    pub cache_pages: usize,
    /// Upper bound on the store size in pages; `None` grows with the device.
    pub max_pages: Option<u64>,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cache_pages: 1024,
            max_pages: None,
        }
    }
}

impl PagerOptions {
    /// Sets the page size.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the number of cached frames.
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Caps the store at `pages` pages.
    pub fn max_pages(mut self, pages: u64) -> Self {
        self.max_pages = Some(pages);
        self
    }
}

/// Statistics tracking cache activity.
#[derive(Default, Clone, Debug, Serialize)]
pub struct PagerStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of page evictions from cache.
    pub evictions: u64,
    /// Number of dirty pages written back.
    pub dirty_writebacks: u64,
    /// Number of pages dropped without write-back.
    pub discards: u64,
    /// Frames currently holding a page.
    pub cached_pages: u64,
    /// Frames currently holding nothing.
    pub unused_pages: u64,
    /// Size of the store in pages.
    pub allocated_pages: u64,
}

/// Lock mode requested when pinning a page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockMode {
    /// Many readers, no writer.
    Shared,
    /// Single writer.
    Exclusive,
}

struct FramePin<'a> {
    pager: &'a Pager,
    frame_idx: usize,
}

impl Drop for FramePin<'_> {
    fn drop(&mut self) {
        self.pager.release_frame(self.frame_idx);
    }
}

/// A page pinned in shared mode.
pub struct PageRef<'a> {
    /// Page identifier.
    pub id: PageId,
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
    _pin: FramePin<'a>,
}

impl PageRef<'_> {
    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        &self.guard
    }
}

/// A page pinned in exclusive mode. The frame is marked dirty when pinned.
pub struct PageMut<'a> {
    /// Page identifier.
    pub id: PageId,
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    _pin: FramePin<'a>,
}

impl PageMut<'_> {
    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        &self.guard
    }

    /// Returns the page bytes for modification.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

/// Either kind of pinned page.
pub enum PageHandle<'a> {
    /// Shared pin.
    Shared(PageRef<'a>),
    /// Exclusive pin.
    Exclusive(PageMut<'a>),
}

impl PageHandle<'_> {
    /// Page identifier.
    pub fn id(&self) -> PageId {
        match self {
            PageHandle::Shared(page) => page.id,
            PageHandle::Exclusive(page) => page.id,
        }
    }

    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        match self {
            PageHandle::Shared(page) => page.data(),
            PageHandle::Exclusive(page) => page.data(),
        }
    }
}

struct PagerInner {
    frames: Vec<Frame>,
    page_table: HashMap<PageId, usize>,
    unused: Vec<usize>,
    clock_hand: usize,
    allocated_pages: u64,
    stats: PagerStats,
}

impl PagerInner {
    fn new(cache_pages: usize, page_size: usize, allocated_pages: u64) -> Self {
        let capacity = cache_pages.max(1);
        let frames = (0..capacity).map(|_| Frame::new(page_size)).collect();
        Self {
            frames,
            page_table: HashMap::new(),
            unused: (0..capacity).rev().collect(),
            clock_hand: 0,
            allocated_pages,
            stats: PagerStats::default(),
        }
    }
}

/// Fixed-capacity page cache over a linear block device.
///
/// Pages are addressed linearly from zero. The store grows on request through
/// [`Pager::ensure_allocated`]; pages beyond the end of the device read as
/// zeroes until first written back.
pub struct Pager {
    io: Arc<dyn FileIo>,
    page_size: usize,
    max_pages: Option<u64>,
    inner: Mutex<PagerInner>,
}

impl Pager {
    /// Builds a pager over an existing device.
    pub fn new(io: Arc<dyn FileIo>, options: PagerOptions) -> Result<Self> {
        if options.page_size < 512 || !options.page_size.is_power_of_two() {
            return Err(StrataError::Invalid("page size must be a power of two >= 512"));
        }
        let page_size = options.page_size as usize;
        let allocated_pages = io.len()? / page_size as u64;
        Ok(Self {
            io,
            page_size,
            max_pages: options.max_pages,
            inner: Mutex::new(PagerInner::new(
                options.cache_pages,
                page_size,
                allocated_pages,
            )),
        })
    }

    /// Creates an empty file-backed store at `path`, discarding prior content.
    pub fn create(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        let io = StdFileIo::open(path.as_ref())?;
        io.truncate(0)?;
        info!(path = %path.as_ref().display(), page_size = options.page_size, "pager.create");
        Self::new(Arc::new(io), options)
    }

    /// Opens an existing file-backed store.
    pub fn open(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        let io = StdFileIo::open(path.as_ref())?;
        let pager = Self::new(Arc::new(io), options)?;
        info!(
            path = %path.as_ref().display(),
            pages = pager.allocated_pages(),
            "pager.open"
        );
        Ok(pager)
    }

    /// Creates a volatile store held in memory.
    pub fn in_memory(options: PagerOptions) -> Result<Self> {
        Self::new(Arc::new(MemIo::new()), options)
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size as u32
    }

    /// Current size of the store in pages.
    pub fn allocated_pages(&self) -> u64 {
        self.inner.lock().allocated_pages
    }

    /// Grows the store to at least `pages` pages.
    ///
    /// Returns `Ok(false)` when the configured ceiling or the device refuses
    /// the growth.
    pub fn ensure_allocated(&self, pages: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        if pages <= inner.allocated_pages {
            return Ok(true);
        }
        if self.max_pages.is_some_and(|max| pages > max) {
            debug!(requested = pages, "pager.grow.refused");
            return Ok(false);
        }
        let bytes = pages
            .checked_mul(self.page_size as u64)
            .ok_or(StrataError::Invalid("store size overflow"))?;
        if self.io.capacity_limit().is_some_and(|limit| bytes > limit) {
            debug!(requested = pages, "pager.grow.device_full");
            return Ok(false);
        }
        self.io.truncate(bytes)?;
        debug!(from = inner.allocated_pages, to = pages, "pager.grow");
        inner.allocated_pages = pages;
        Ok(true)
    }

    /// Maps a page id to its block on the device.
    pub fn translate(&self, id: PageId) -> BlockId {
        BlockId(id.0)
    }

    /// Pins a page with the requested lock mode.
    pub fn pin(&self, id: PageId, mode: LockMode) -> Result<PageHandle<'_>> {
        Ok(match mode {
            LockMode::Shared => PageHandle::Shared(self.pin_shared(id)?),
            LockMode::Exclusive => PageHandle::Exclusive(self.pin_exclusive(id)?),
        })
    }

    /// Pins a page for reading.
    pub fn pin_shared(&self, id: PageId) -> Result<PageRef<'_>> {
        let (idx, buf) = self.acquire_frame(id, false)?;
        let pin = FramePin {
            pager: self,
            frame_idx: idx,
        };
        let guard = buf.read_arc();
        Ok(PageRef {
            id,
            guard,
            _pin: pin,
        })
    }

    /// Pins a page for writing; the page is written back on eviction or flush.
    pub fn pin_exclusive(&self, id: PageId) -> Result<PageMut<'_>> {
        let (idx, buf) = self.acquire_frame(id, true)?;
        let pin = FramePin {
            pager: self,
            frame_idx: idx,
        };
        let guard = buf.write_arc();
        Ok(PageMut {
            id,
            guard,
            _pin: pin,
        })
    }

    /// Marks a cached page dirty so it is written back.
    pub fn mark_dirty(&self, id: PageId) {
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.page_table.get(&id) {
            inner.frames[idx].dirty = true;
        }
    }

    /// Drops a page from the cache without writing it back.
    pub fn discard(&self, id: PageId) {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.page_table.get(&id) else {
            return;
        };
        if inner.frames[idx].pin_count > 0 {
            warn!(page = id.0, "pager.discard.pinned");
            return;
        }
        inner.page_table.remove(&id);
        inner.frames[idx].reset();
        inner.unused.push(idx);
        inner.stats.discards += 1;
        debug!(page = id.0, "pager.discard");
    }

    /// Writes every dirty frame back and syncs the device.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut written = 0u64;
        for idx in 0..inner.frames.len() {
            if inner.frames[idx].dirty {
                self.write_back(&mut inner, idx)?;
                written += 1;
            }
        }
        self.io.sync_all()?;
        debug!(pages = written, "pager.flush");
        Ok(())
    }

    /// Returns a snapshot of cache statistics.
    pub fn stats(&self) -> PagerStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.cached_pages = inner.page_table.len() as u64;
        stats.unused_pages = inner.unused.len() as u64;
        stats.allocated_pages = inner.allocated_pages;
        stats
    }

    /// Number of frames currently holding no page.
    pub fn unused_pages(&self) -> usize {
        self.inner.lock().unused.len()
    }

    fn acquire_frame(
        &self,
        id: PageId,
        exclusive: bool,
    ) -> Result<(usize, Arc<parking_lot::RwLock<Box<[u8]>>>)> {
        let mut inner = self.inner.lock();
        if id.0 >= inner.allocated_pages {
            return Err(StrataError::Invalid("page beyond end of store"));
        }
        let idx = match inner.page_table.get(&id) {
            Some(&idx) => {
                inner.stats.hits += 1;
                idx
            }
            None => {
                inner.stats.misses += 1;
                self.load_frame(&mut inner, id)?
            }
        };
        let frame = &mut inner.frames[idx];
        frame.reference = true;
        frame.pin_count += 1;
        if exclusive {
            frame.dirty = true;
        }
        Ok((idx, frame.buf.clone()))
    }

    fn load_frame(&self, inner: &mut PagerInner, id: PageId) -> Result<usize> {
        let idx = match inner.unused.pop() {
            Some(idx) => idx,
            None => {
                let idx = self.choose_victim(inner)?;
                self.evict_frame(inner, idx)?;
                idx
            }
        };
        {
            let frame = &mut inner.frames[idx];
            let mut buf = frame.buf.write();
            let off = page_offset(id, self.page_size);
            if off + self.page_size as u64 <= self.io.len()? {
                self.io.read_at(off, &mut buf)?;
            } else {
                buf.fill(0);
            }
            frame.id = Some(id);
            frame.dirty = false;
            frame.reference = false;
            frame.pin_count = 0;
        }
        inner.page_table.insert(id, idx);
        Ok(idx)
    }

    fn choose_victim(&self, inner: &mut PagerInner) -> Result<usize> {
        let len = inner.frames.len();
        for _ in 0..len * 2 {
            let idx = inner.clock_hand;
            inner.clock_hand = (inner.clock_hand + 1) % len;
            let frame = &mut inner.frames[idx];
            if frame.pin_count > 0 {
                continue;
            }
            if frame.reference {
                frame.reference = false;
                continue;
            }
            return Ok(idx);
        }
        Err(StrataError::Invalid("page cache exhausted: every frame is pinned"))
    }

    fn evict_frame(&self, inner: &mut PagerInner, idx: usize) -> Result<()> {
        if inner.frames[idx].dirty {
            self.write_back(inner, idx)?;
        }
        if let Some(old) = inner.frames[idx].id {
            inner.page_table.remove(&old);
            debug!(page = old.0, "pager.evict");
        }
        inner.frames[idx].reset();
        inner.stats.evictions += 1;
        Ok(())
    }

    fn write_back(&self, inner: &mut PagerInner, idx: usize) -> Result<()> {
        let frame = &mut inner.frames[idx];
        if let Some(id) = frame.id {
            let buf = frame.buf.read();
            self.io.write_at(page_offset(id, self.page_size), &buf)?;
        }
        frame.dirty = false;
        inner.stats.dirty_writebacks += 1;
        Ok(())
    }

    fn release_frame(&self, frame_idx: usize) {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(frame_idx) {
            if frame.pin_count > 0 {
                frame.pin_count -= 1;
            }
        }
    }
}

fn page_offset(page: PageId, page_size: usize) -> u64 {
    page.0 * page_size as u64
}
