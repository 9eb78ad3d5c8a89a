#![forbid(unsafe_code)]

mod frame;
mod pager;

pub use pager::{LockMode, PageHandle, PageMut, PageRef, Pager, PagerOptions, PagerStats};
