//! memory management. there's no paging here, just the break segment that libc's malloc grows into

mod brk;

pub use brk::*;
