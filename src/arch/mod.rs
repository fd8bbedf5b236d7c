pub mod sh4;

pub use sh4::*;

use crate::unwind::FrameReader;
use core::fmt;

/// describes a contiguous region of memory
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ContiguousRegion {
    /// the base address of this region
    pub base: usize,

    /// the length of this region
    pub length: usize,
}

impl ContiguousRegion {
    pub const fn new(base: usize, length: usize) -> Self {
        Self { base, length }
    }

    /// checks whether the given address lies inside this region
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.length
    }
}

impl fmt::Debug for ContiguousRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContiguousRegion")
            .field("base", &crate::FormatHex(self.base))
            .field("length", &crate::FormatHex(self.length))
            .finish()
    }
}

/// properties describing a CPU architecture and the board it sits on
#[derive(Debug)]
pub struct ArchProperties {
    /// physical RAM as seen through the cached mirror
    pub ram_region: ContiguousRegion,

    /// how much memory at the top of RAM is kept for the kernel stack
    pub kernel_stack_size: usize,

    /// alignment of every break segment allocation, in bytes
    pub alloc_align: usize,

    /// how many frames a stack trace will print at most
    pub max_stack_frames: usize,
}

impl ArchProperties {
    /// the first address past the end of RAM
    pub fn mem_top(&self) -> usize {
        self.ram_region.base + self.ram_region.length
    }
}

pub trait RegisterContext: Clone {
    /// creates a set of registers which, when switched to, will start running the provided function with the stack set to the provided stack pointer
    fn from_fn(func: usize, stack: usize, args: &[u32], is_user_mode: bool) -> Self;

    /// gets the value of the instruction pointer stored in this context
    fn instruction_pointer(&self) -> usize;

    /// gets the value of the stack pointer stored in this context
    fn stack_pointer(&self) -> usize;

    /// gets the value of the frame pointer stored in this context, used to walk the stack
    fn frame_pointer(&self) -> usize;
}

/// the parts of the CPU and its on-chip peripherals that the exception dispatcher touches
///
/// everything here is expected to be cheap and non-blocking, since it's called from inside exception handling.
/// reading memory through it is only used for stack traces on the way to a halt
pub trait Hardware: FrameReader + Send + Sync {
    /// reads the exception event register (EXPEVT)
    fn exception_event(&self) -> u32;

    /// reads the interrupt event register (INTEVT)
    fn interrupt_event(&self) -> u32;

    /// reads the trap register (TRA), which holds the TRAPA immediate shifted left by 2
    fn trap_code(&self) -> u32;

    /// reads the status register
    fn status(&self) -> u32;

    /// writes the status register verbatim
    fn set_status(&self, sr: u32);

    /// reads the vector base register
    fn vector_base(&self) -> usize;

    /// writes the vector base register
    fn set_vector_base(&self, vbr: usize);

    /// clears the underflow flag of the given on-chip timer channel
    fn clear_timer_underflow(&self, channel: usize);

    /// resumes execution from the given context
    ///
    /// on real hardware this never returns, it jumps straight into the register restore path of the vector stub
    fn resume(&self, context: *mut sh4::IrqContext);

    /// halts the CPU for good
    fn halt(&self) -> !;
}

/// save/restore style interrupt masking
///
/// this is not a counter! every disable() returns the status it replaced, and callers have to restore them in reverse order
pub trait InterruptMask {
    /// masks all ordinary interrupt sources, returning the previous status
    fn disable(&self) -> u32;

    /// unmasks all interrupt sources
    fn enable(&self);

    /// writes back a status previously returned by disable()
    fn restore(&self, previous: u32);
}
