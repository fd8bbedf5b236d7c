//! frame pointer stack traces, used on the fatal exception paths
//!
//! with frame pointers enabled, every frame pointer points at a pair of words:
//! `[fp]` is the return address of the frame, `[fp + 4]` is the caller's frame pointer.
//! the outermost frame has its frame pointer set to `NO_FRAME`

use crate::arch::{ContiguousRegion, NO_FRAME};
use log::info;
use volatile::Volatile;

/// a way to read words out of memory while walking the stack
pub trait FrameReader {
    /// reads the word at the given address, or None if it can't be read
    fn read_u32(&self, addr: usize) -> Option<u32>;
}

/// reads straight out of memory, but only inside the given region
pub struct RawMemory {
    region: ContiguousRegion,
}

impl RawMemory {
    /// # Safety
    ///
    /// every aligned word inside `region` must be mapped and readable
    pub unsafe fn new(region: ContiguousRegion) -> Self {
        Self { region }
    }
}

impl FrameReader for RawMemory {
    fn read_u32(&self, addr: usize) -> Option<u32> {
        if addr & 3 != 0 || !self.region.contains(addr) || !self.region.contains(addr + 3) {
            return None;
        }

        // safe since new() promised the whole region is readable
        Some(unsafe { Volatile::new_read_only(&*(addr as *const u32)).read() })
    }
}

/// one entry in a stack trace
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StackFrame {
    /// a frame that will return to the given address
    Call { return_address: usize },

    /// the chain ran into a frame pointer that can't be followed, the walk stops here
    Invalid { frame_pointer: usize },
}

/// iterator over the frames of a stack, innermost first
pub struct StackTrace<'a, R: FrameReader + ?Sized> {
    reader: &'a R,
    frame_pointer: usize,
    remaining: usize,
    done: bool,
}

impl<'a, R: FrameReader + ?Sized> StackTrace<'a, R> {
    /// starts walking at the given frame pointer, yielding at most `max_frames` frames
    pub fn new(reader: &'a R, frame_pointer: usize, max_frames: usize) -> Self {
        Self {
            reader,
            frame_pointer,
            remaining: max_frames,
            done: false,
        }
    }
}

impl<R: FrameReader + ?Sized> Iterator for StackTrace<'_, R> {
    type Item = StackFrame;

    fn next(&mut self) -> Option<StackFrame> {
        if self.done || self.remaining == 0 || self.frame_pointer == NO_FRAME as usize {
            return None;
        }

        let fp = self.frame_pointer;

        match (self.reader.read_u32(fp), self.reader.read_u32(fp.wrapping_add(4))) {
            (Some(return_address), Some(next)) => {
                self.remaining -= 1;
                self.frame_pointer = next as usize;
                Some(StackFrame::Call {
                    return_address: return_address as usize,
                })
            }
            _ => {
                self.done = true;
                Some(StackFrame::Invalid { frame_pointer: fp })
            }
        }
    }
}

/// prints a stack trace to the log
pub fn print_stack_trace<R: FrameReader + ?Sized>(reader: &R, frame_pointer: usize, max_frames: usize) {
    info!("-------- stack trace (innermost first) --------");

    for frame in StackTrace::new(reader, frame_pointer, max_frames) {
        match frame {
            StackFrame::Call { return_address } => info!("   {return_address:#010x}"),
            StackFrame::Invalid { frame_pointer } => info!("   (invalid frame pointer {frame_pointer:#010x})"),
        }
    }

    info!("----------------- end of trace -----------------");
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{collections::BTreeMap, vec::Vec};

    struct FakeStack(BTreeMap<usize, u32>);

    impl FrameReader for FakeStack {
        fn read_u32(&self, addr: usize) -> Option<u32> {
            self.0.get(&addr).copied()
        }
    }

    fn stack() -> FakeStack {
        let mut words = BTreeMap::new();
        words.insert(0x8cff_0000, 0x8c01_0100);
        words.insert(0x8cff_0004, 0x8cff_0040);
        words.insert(0x8cff_0040, 0x8c01_0200);
        words.insert(0x8cff_0044, 0x8cff_0080);
        words.insert(0x8cff_0080, 0x8c01_0300);
        words.insert(0x8cff_0084, NO_FRAME);
        FakeStack(words)
    }

    #[test]
    fn walks_to_outermost_frame() {
        let frames: Vec<_> = StackTrace::new(&stack(), 0x8cff_0000, 32).collect();

        assert_eq!(
            frames,
            [
                StackFrame::Call { return_address: 0x8c01_0100 },
                StackFrame::Call { return_address: 0x8c01_0200 },
                StackFrame::Call { return_address: 0x8c01_0300 },
            ]
        );
    }

    #[test]
    fn respects_depth_limit() {
        assert_eq!(StackTrace::new(&stack(), 0x8cff_0000, 2).count(), 2);
    }

    #[test]
    fn stops_at_bad_frame_pointer() {
        let mut stack = stack();
        stack.0.insert(0x8cff_0044, 0x1234);

        let frames: Vec<_> = StackTrace::new(&stack, 0x8cff_0000, 32).collect();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], StackFrame::Invalid { frame_pointer: 0x1234 });
    }

    #[test]
    fn fresh_context_has_no_frames() {
        assert_eq!(StackTrace::new(&stack(), NO_FRAME as usize, 32).count(), 0);
    }

    #[test]
    fn raw_memory_stays_in_region() {
        let words: Vec<u32> = alloc::vec![0xdead_beef, 0x1234_5678];
        let base = words.as_ptr() as usize;
        let memory = unsafe { RawMemory::new(ContiguousRegion::new(base, 8)) };

        assert_eq!(memory.read_u32(base), Some(0xdead_beef));
        assert_eq!(memory.read_u32(base + 4), Some(0x1234_5678));
        assert_eq!(memory.read_u32(base + 2), None);
        assert_eq!(memory.read_u32(base + 8), None);
    }
}
