//! the break segment: a bump pointer between the end of static data and the kernel stack
//!
//! ```text
//! start            current            end              max
//!   |--- in use ---|------ free ------|--- reserved ---|  kernel stack ...
//! ```
//!
//! `start <= current <= end <= max` always holds, anything that would break that fails without changing anything

use crate::{
    arch::{ArchProperties, InterruptMask},
    errno::{set_errno, ErrorCode, Errno},
};
use core::fmt;
use log::{debug, warn};
use spin::Mutex;

/// what a C caller gets back from a failed sbrk()
pub const SBRK_FAILED: *mut u8 = usize::MAX as *mut u8;

/// where the break segment lives
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BreakLayout {
    /// first address after the kernel's static data
    pub data_end: usize,

    /// first address past the end of RAM
    pub mem_top: usize,

    /// how much memory below mem_top is kept for the kernel stack
    pub stack_reserve: usize,
}

impl BreakLayout {
    /// the layout for a board, given where the linker put the end of static data
    pub fn from_properties(data_end: usize, properties: &ArchProperties) -> Self {
        Self {
            data_end,
            mem_top: properties.mem_top(),
            stack_reserve: properties.kernel_stack_size,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BrkError {
    /// the break would move past the end of the segment or before its start
    OutOfMemory,
}

impl ErrorCode for BrkError {
    fn code(&self) -> i32 {
        -1
    }
}

impl fmt::Display for BrkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "out of memory")
    }
}

impl From<BrkError> for Errno {
    fn from(_: BrkError) -> Self {
        Errno::OutOfMemory
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CapacityError {
    /// asked for more than there is between the start of the segment and the kernel stack
    ExceedsHardLimit,

    /// asked for less than is already handed out
    WouldTruncate,
}

impl ErrorCode for CapacityError {
    fn code(&self) -> i32 {
        match self {
            Self::ExceedsHardLimit => -1,
            Self::WouldTruncate => -2,
        }
    }
}

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExceedsHardLimit => write!(f, "capacity exceeds hard limit"),
            Self::WouldTruncate => write!(f, "capacity would truncate allocated memory"),
        }
    }
}

/// why a layout can't be turned into a break segment
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// the allocation alignment isn't a power of two
    BadAlignment(usize),

    /// the stack reservation leaves no room between the end of static data and the top of RAM
    NoRoom,
}

impl ErrorCode for LayoutError {
    fn code(&self) -> i32 {
        match self {
            Self::BadAlignment(_) => -1,
            Self::NoRoom => -2,
        }
    }
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAlignment(align) => write!(f, "alignment {align} isn't a power of two"),
            Self::NoRoom => write!(f, "no room for a break segment"),
        }
    }
}

impl From<LayoutError> for Errno {
    fn from(err: LayoutError) -> Self {
        match err {
            LayoutError::BadAlignment(_) => Errno::InvalidArgument,
            LayoutError::NoRoom => Errno::OutOfMemory,
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct Bounds {
    start: usize,
    current: usize,
    end: usize,
    max: usize,
}

impl Bounds {
    fn free(&self) -> usize {
        self.end - self.current
    }

    fn used(&self) -> usize {
        self.current - self.start
    }
}

/// rounds the magnitude of an increment up to a multiple of `align`, keeping its sign. None on overflow
fn round_increment(increment: isize, align: usize) -> Option<(bool, usize)> {
    let magnitude = increment.unsigned_abs().checked_add(align - 1)? & !(align - 1);
    Some((increment < 0, magnitude))
}

pub struct BreakSegment<M: InterruptMask + 'static> {
    mask: &'static M,
    align: usize,
    bounds: Mutex<Bounds>,
}

impl<M: InterruptMask + 'static> BreakSegment<M> {
    /// sets up the break segment for the given layout, zeroing all of it
    ///
    /// # Safety
    ///
    /// everything from `layout.data_end` up to `layout.mem_top - layout.stack_reserve` must be unused RAM that nothing else will touch
    pub unsafe fn new(layout: BreakLayout, align: usize, mask: &'static M) -> Result<Self, LayoutError> {
        if !align.is_power_of_two() {
            return Err(LayoutError::BadAlignment(align));
        }

        let start = layout.data_end.checked_add(align - 1).ok_or(LayoutError::NoRoom)? & !(align - 1);
        let max = layout
            .mem_top
            .checked_sub(layout.stack_reserve)
            .and_then(|top| top.checked_sub(1))
            .ok_or(LayoutError::NoRoom)?;
        let length = max.checked_sub(start).ok_or(LayoutError::NoRoom)?;

        core::ptr::write_bytes(start as *mut u8, 0, length);

        debug!("break segment @ {start:#x} - {max:#x} ({length} bytes)");

        Ok(Self {
            mask,
            align,
            bounds: Mutex::new(Bounds { start, current: start, end: max, max }),
        })
    }

    /// a copy of the bounds, taken with interrupts masked so an sbrk() from an exception handler can't find the lock held
    fn snapshot(&self) -> Bounds {
        let old = self.mask.disable();
        let bounds = *self.bounds.lock();
        self.mask.restore(old);
        bounds
    }

    /// moves the break by `increment` bytes (rounded up to the allocation alignment), returning where the break was before.
    /// an increment of 0 just returns the current break
    pub fn sbrk(&self, increment: isize) -> Result<*mut u8, BrkError> {
        let old = self.mask.disable();
        let result = self.move_break(increment);
        self.mask.restore(old);
        result
    }

    fn move_break(&self, increment: isize) -> Result<*mut u8, BrkError> {
        let mut bounds = self.bounds.lock();
        let previous = bounds.current;

        if increment == 0 {
            return Ok(previous as *mut u8);
        }

        let candidate = round_increment(increment, self.align).and_then(|(negative, magnitude)| {
            if negative {
                previous.checked_sub(magnitude)
            } else {
                previous.checked_add(magnitude)
            }
        });

        match candidate {
            Some(candidate) if candidate >= bounds.start && candidate <= bounds.end => {
                bounds.current = candidate;
                Ok(previous as *mut u8)
            }
            _ => {
                set_errno(Errno::OutOfMemory);
                warn!("out of memory: sbrk({increment}) with {} bytes free, {} used", bounds.free(), bounds.used());
                Err(BrkError::OutOfMemory)
            }
        }
    }

    /// moves the break to the given address
    pub fn brk(&self, new_position: usize) -> Result<(), BrkError> {
        let old = self.mask.disable();

        let current = self.bounds.lock().current;
        let result = self.move_break((new_position as isize).wrapping_sub(current as isize)).map(|_| ());

        self.mask.restore(old);
        result
    }

    /// moves the soft end of the segment so that `bytes` can be handed out in total, reserving everything past it
    pub fn set_capacity(&self, bytes: usize) -> Result<(), CapacityError> {
        let old = self.mask.disable();

        let result = {
            let mut bounds = self.bounds.lock();

            if bytes > bounds.max - bounds.start {
                Err(CapacityError::ExceedsHardLimit)
            } else if bytes < bounds.used() {
                Err(CapacityError::WouldTruncate)
            } else {
                bounds.end = bounds.start + bytes;
                Ok(())
            }
        };

        self.mask.restore(old);

        if let Err(err) = result {
            debug!("set_capacity({bytes:#x}) failed: {err}");
        }

        result
    }

    /// bytes left before the soft end
    pub fn free(&self) -> usize {
        self.snapshot().free()
    }

    /// bytes handed out so far
    pub fn used(&self) -> usize {
        self.snapshot().used()
    }

    /// the most the segment could ever hand out
    pub fn hard_capacity(&self) -> usize {
        let bounds = self.snapshot();
        bounds.max - bounds.start
    }

    /// how much the segment can hand out with the current soft end
    pub fn capacity(&self) -> usize {
        let bounds = self.snapshot();
        bounds.end - bounds.start
    }

    /// the first address of the segment
    pub fn start(&self) -> usize {
        self.snapshot().start
    }

    pub fn shutdown(&self) {
        let bounds = self.snapshot();
        debug!("break segment: {} bytes used, {} free, {} reserved", bounds.used(), bounds.free(), bounds.max - bounds.end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno::{errno, status};
    use alloc::{boxed::Box, vec};
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// counts how deep the masking currently is, so tests can check everything was restored
    #[derive(Default)]
    struct NestingMask {
        depth: AtomicUsize,
        calls: AtomicUsize,
    }

    impl InterruptMask for NestingMask {
        fn disable(&self) -> u32 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.depth.fetch_add(1, Ordering::SeqCst) as u32
        }

        fn enable(&self) {
            self.depth.store(0, Ordering::SeqCst);
        }

        fn restore(&self, previous: u32) {
            self.depth.store(previous as usize, Ordering::SeqCst);
        }
    }

    /// a break segment over a fresh leaked buffer with `size` bytes between start and max
    fn segment(size: usize) -> (BreakSegment<NestingMask>, &'static NestingMask) {
        let buffer: &'static mut [u32] = Box::leak(vec![0xdead_beef_u32; size / 4 + 4].into_boxed_slice());
        let base = buffer.as_mut_ptr() as usize;
        let mask: &'static NestingMask = Box::leak(Box::<NestingMask>::default());

        let layout = BreakLayout {
            data_end: base,
            mem_top: base + size + 0x100 + 1,
            stack_reserve: 0x100,
        };

        (unsafe { BreakSegment::new(layout, 4, mask) }.unwrap(), mask)
    }

    #[test]
    fn scenario_fill_exactly() {
        let (brk, mask) = segment(1024);
        let start = brk.start();
        assert_eq!(brk.hard_capacity(), 1024);

        assert_eq!(brk.sbrk(600), Ok(start as *mut u8));

        assert_eq!(brk.sbrk(500), Err(BrkError::OutOfMemory));
        assert_eq!(errno(), Errno::OutOfMemory);
        assert_eq!(brk.sbrk(0), Ok((start + 600) as *mut u8));

        assert_eq!(brk.sbrk(424), Ok((start + 600) as *mut u8));
        assert_eq!(brk.sbrk(0), Ok((start + 1024) as *mut u8));
        assert_eq!(brk.free(), 0);

        assert_eq!(mask.depth.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn growth_returns_previous_break() {
        let (brk, _) = segment(0x1000);
        let start = brk.start();
        let mut expected = start;

        for n in [1_isize, 3, 4, 5, 17, 64, 100] {
            let rounded = (n as usize + 3) & !3;

            assert_eq!(brk.sbrk(n), Ok(expected as *mut u8));
            expected += rounded;
            assert_eq!(brk.sbrk(0), Ok(expected as *mut u8));
        }

        assert_eq!(brk.used(), expected - start);
    }

    #[test]
    fn failures_change_nothing() {
        let (brk, _) = segment(256);
        brk.sbrk(64).unwrap();
        let before = brk.sbrk(0).unwrap();

        for n in [-65_isize, -128, 193, 256, isize::MAX, isize::MIN] {
            assert_eq!(brk.sbrk(n), Err(BrkError::OutOfMemory), "sbrk({n})");
            assert_eq!(brk.sbrk(0), Ok(before));
        }
    }

    #[test]
    fn negative_increments_round_away_from_zero() {
        let (brk, _) = segment(256);
        let start = brk.start();
        brk.sbrk(64).unwrap();

        assert_eq!(brk.sbrk(-3), Ok((start + 64) as *mut u8));
        assert_eq!(brk.sbrk(0), Ok((start + 60) as *mut u8));

        assert_eq!(brk.sbrk(-60), Ok((start + 60) as *mut u8));
        assert_eq!(brk.used(), 0);
        assert_eq!(brk.sbrk(-1), Err(BrkError::OutOfMemory));
    }

    #[test]
    fn start_is_aligned_and_segment_is_zeroed() {
        let buffer: &'static mut [u32] = Box::leak(vec![0xffff_ffff_u32; 40].into_boxed_slice());
        let base = buffer.as_mut_ptr() as usize;
        let mask: &'static NestingMask = Box::leak(Box::<NestingMask>::default());

        let layout = BreakLayout {
            data_end: base + 1,
            mem_top: base + 128 + 0x10 + 1,
            stack_reserve: 0x10,
        };
        let brk = unsafe { BreakSegment::new(layout, 4, mask) }.unwrap();

        assert_eq!(brk.start(), base + 4);
        assert_eq!(brk.hard_capacity(), 124);

        let bytes = unsafe { core::slice::from_raw_parts(brk.start() as *const u8, brk.hard_capacity()) };
        assert!(bytes.iter().all(|b| *b == 0));
        // the byte before start belongs to static data and is left alone
        assert_eq!(unsafe { *((base + 3) as *const u8) }, 0xff);
    }

    #[test]
    fn brk_moves_to_position() {
        let (brk, _) = segment(256);
        let start = brk.start();

        assert_eq!(brk.brk(start + 128), Ok(()));
        assert_eq!(brk.used(), 128);
        assert_eq!(brk.brk(start + 512), Err(BrkError::OutOfMemory));
        assert_eq!(brk.brk(start - 4), Err(BrkError::OutOfMemory));
        assert_eq!(brk.brk(start), Ok(()));
        assert_eq!(brk.used(), 0);
    }

    #[test]
    fn capacity_limits() {
        let (brk, mask) = segment(1024);
        brk.sbrk(256).unwrap();

        assert_eq!(brk.set_capacity(1025).map_err(|e| e.code()), Err(-1));
        assert_eq!(brk.set_capacity(255).map_err(|e| e.code()), Err(-2));
        assert_eq!(brk.capacity(), 1024);

        brk.set_capacity(512).unwrap();
        assert_eq!(brk.capacity(), 512);
        assert_eq!(brk.hard_capacity(), 1024);
        assert_eq!(brk.free(), 256);
        assert_eq!(brk.sbrk(260), Err(BrkError::OutOfMemory));

        // reclaiming the reserved region makes the same request succeed
        brk.set_capacity(1024).unwrap();
        assert!(brk.sbrk(260).is_ok());

        brk.set_capacity(brk.used()).unwrap();
        assert_eq!(brk.free(), 0);

        assert_eq!(mask.depth.load(Ordering::SeqCst), 0);
    }

    /// xorshift, so the random walk below is the same every run
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn range(&mut self, low: i64, high: i64) -> i64 {
            low + (self.next() % (high - low + 1) as u64) as i64
        }
    }

    #[test]
    fn random_walk_keeps_bounds() {
        let (brk, mask) = segment(512);
        let start = brk.start();
        let mut rng = Rng(0x5eed_1234_abcd_0001);

        // (current, end) as offsets from start, tracked alongside the real thing
        let (mut current, mut end) = (0_i64, 512_i64);

        for _ in 0..2000 {
            if rng.range(0, 3) == 0 {
                let bytes = rng.range(0, 600);
                let result = brk.set_capacity(bytes as usize);

                if bytes > 512 {
                    assert_eq!(result, Err(CapacityError::ExceedsHardLimit));
                } else if bytes < current {
                    assert_eq!(result, Err(CapacityError::WouldTruncate));
                } else {
                    assert_eq!(result, Ok(()));
                    end = bytes;
                }
            } else {
                let increment = rng.range(-300, 300);
                let rounded = increment.signum() * ((increment.abs() + 3) & !3);
                let result = brk.sbrk(increment as isize);

                if (0..=end).contains(&(current + rounded)) {
                    assert_eq!(result, Ok((start + current as usize) as *mut u8), "sbrk({increment})");
                    current += rounded;
                } else {
                    assert_eq!(result, Err(BrkError::OutOfMemory), "sbrk({increment})");
                }
            }

            let bounds = *brk.bounds.lock();
            assert_eq!(bounds.current - bounds.start, current as usize);
            assert_eq!(bounds.end - bounds.start, end as usize);
            assert!(bounds.start <= bounds.current && bounds.current <= bounds.end && bounds.end <= bounds.max);
        }

        assert_eq!(mask.depth.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn everything_is_masked() {
        let (brk, mask) = segment(64);

        brk.sbrk(4).unwrap();
        brk.brk(brk.start()).unwrap();
        brk.set_capacity(32).unwrap();
        brk.free();
        brk.used();
        brk.capacity();
        brk.hard_capacity();

        assert_eq!(mask.calls.load(Ordering::SeqCst), 8);
        assert_eq!(mask.depth.load(Ordering::SeqCst), 0);
    }

    /// checks the segment's lock is never held when masking starts or ends, i.e. it's only ever held while masked
    struct LockWatchingMask {
        segment: spin::Once<&'static BreakSegment<LockWatchingMask>>,
        masked: AtomicUsize,
        held_outside_mask: AtomicUsize,
    }

    impl LockWatchingMask {
        fn check(&self) {
            if let Some(segment) = self.segment.get() {
                if segment.bounds.is_locked() {
                    self.held_outside_mask.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    impl InterruptMask for LockWatchingMask {
        fn disable(&self) -> u32 {
            self.check();
            self.masked.fetch_add(1, Ordering::SeqCst);
            0
        }

        fn enable(&self) {}

        fn restore(&self, _previous: u32) {
            self.check();
        }
    }

    #[test]
    fn lock_only_held_while_masked() {
        let buffer: &'static mut [u32] = Box::leak(vec![0_u32; 80].into_boxed_slice());
        let base = buffer.as_mut_ptr() as usize;
        let mask: &'static LockWatchingMask = Box::leak(Box::new(LockWatchingMask {
            segment: spin::Once::new(),
            masked: AtomicUsize::new(0),
            held_outside_mask: AtomicUsize::new(0),
        }));

        let layout = BreakLayout {
            data_end: base,
            mem_top: base + 256 + 0x10 + 1,
            stack_reserve: 0x10,
        };
        let brk: &'static BreakSegment<LockWatchingMask> = Box::leak(Box::new(unsafe { BreakSegment::new(layout, 4, mask) }.unwrap()));
        mask.segment.call_once(|| brk);

        brk.sbrk(16).unwrap();
        let _ = brk.sbrk(4096);
        brk.brk(brk.start() + 8).unwrap();
        brk.set_capacity(128).unwrap();
        let _ = brk.set_capacity(4096);
        brk.free();
        brk.used();
        brk.capacity();
        brk.hard_capacity();
        brk.shutdown();

        assert_eq!(mask.masked.load(Ordering::SeqCst), 11);
        assert_eq!(mask.held_outside_mask.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bad_layouts_are_refused() {
        let mask: &'static NestingMask = Box::leak(Box::<NestingMask>::default());
        let layout = |data_end, mem_top, stack_reserve| BreakLayout { data_end, mem_top, stack_reserve };

        let cases = [
            // static data runs into the stack reservation
            (layout(0x8c80_0000, 0x8c80_0000, 0x10000), 4, LayoutError::NoRoom),
            // stack reservation bigger than all of memory
            (layout(0x1000, 0x8000, 0x10000), 4, LayoutError::NoRoom),
            // aligning data_end up wraps around
            (layout(usize::MAX - 1, usize::MAX, 0), 4, LayoutError::NoRoom),
            (layout(0x1000, 0x8000, 0x100), 3, LayoutError::BadAlignment(3)),
            (layout(0x1000, 0x8000, 0x100), 0, LayoutError::BadAlignment(0)),
        ];

        for (layout, align, error) in cases {
            assert_eq!(unsafe { BreakSegment::new(layout, align, mask) }.err(), Some(error), "{layout:?}");
        }

        assert_eq!(LayoutError::NoRoom.code(), -2);
        assert_eq!(Errno::from(LayoutError::BadAlignment(3)), Errno::InvalidArgument);
    }

    #[test]
    fn c_status_codes() {
        let (brk, _) = segment(64);

        assert_eq!(status(brk.brk(brk.start() + 32)), 0);
        assert_eq!(status(brk.brk(brk.start() + 4096)), -1);
        assert_eq!(status(brk.set_capacity(4096)), -1);
        assert_eq!(status(brk.set_capacity(16)), -2);
        assert_eq!(status(brk.set_capacity(64)), 0);
    }

    #[test]
    fn layout_from_properties() {
        let layout = BreakLayout::from_properties(0x8c10_0000, &crate::arch::PROPERTIES);

        assert_eq!(layout.mem_top, 0x8d00_0000);
        assert_eq!(layout.stack_reserve, 0x10000);
    }
}
