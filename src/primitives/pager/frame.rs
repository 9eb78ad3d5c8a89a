use parking_lot::RwLock;
use std::sync::Arc;

use crate::types::PageId;

/// One cache slot; `id == None` means the frame is unused.
pub struct Frame {
    pub id: Option<PageId>,
    pub buf: Arc<RwLock<Box<[u8]>>>,
    pub reference: bool,
    pub dirty: bool,
    pub pin_count: u32,
}

impl Frame {
    pub fn new(page_size: usize) -> Self {
        Self {
            id: None,
            buf: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            reference: false,
            dirty: false,
            pin_count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.id = None;
        self.reference = false;
        self.dirty = false;
        self.pin_count = 0;
    }
}
