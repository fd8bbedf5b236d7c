//! fake hardware for unit tests

use crate::{
    arch::{Hardware, IrqContext},
    unwind::FrameReader,
};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use spin::Mutex;

/// records everything the dispatcher does to the hardware. halting panics with "halted"
#[derive(Default)]
pub struct MockHardware {
    expevt: AtomicU32,
    intevt: AtomicU32,
    tra: AtomicU32,
    sr: AtomicU32,
    vbr: AtomicUsize,
    status_writes: Mutex<Vec<u32>>,
    timer_clears: Mutex<Vec<usize>>,
    resumed: Mutex<Vec<usize>>,
}

impl MockHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// sets up EXPEVT as if the given exception had just been raised
    pub fn raise_exception(&self, code: u32) {
        self.expevt.store(code, Ordering::SeqCst);
    }

    /// sets up INTEVT as if the given interrupt had just been raised
    pub fn raise_interrupt(&self, code: u32) {
        self.intevt.store(code, Ordering::SeqCst);
    }

    /// sets up TRA the way `trapa #imm` would
    pub fn raise_trap(&self, vector: u8) {
        self.tra.store((vector as u32) << 2, Ordering::SeqCst);
    }

    /// every value written to SR, in order
    pub fn status_writes(&self) -> Vec<u32> {
        self.status_writes.lock().clone()
    }

    /// timer channels whose underflow flag got cleared, in order
    pub fn timer_clears(&self) -> Vec<usize> {
        self.timer_clears.lock().clone()
    }

    /// addresses of every context resumed from, in order
    pub fn resumed(&self) -> Vec<usize> {
        self.resumed.lock().clone()
    }
}

impl FrameReader for MockHardware {
    fn read_u32(&self, _addr: usize) -> Option<u32> {
        None
    }
}

impl Hardware for MockHardware {
    fn exception_event(&self) -> u32 {
        self.expevt.load(Ordering::SeqCst)
    }

    fn interrupt_event(&self) -> u32 {
        self.intevt.load(Ordering::SeqCst)
    }

    fn trap_code(&self) -> u32 {
        self.tra.load(Ordering::SeqCst)
    }

    fn status(&self) -> u32 {
        self.sr.load(Ordering::SeqCst)
    }

    fn set_status(&self, sr: u32) {
        self.sr.store(sr, Ordering::SeqCst);
        self.status_writes.lock().push(sr);
    }

    fn vector_base(&self) -> usize {
        self.vbr.load(Ordering::SeqCst)
    }

    fn set_vector_base(&self, vbr: usize) {
        self.vbr.store(vbr, Ordering::SeqCst);
    }

    fn clear_timer_underflow(&self, channel: usize) {
        self.timer_clears.lock().push(channel);
    }

    fn resume(&self, context: *mut IrqContext) {
        self.resumed.lock().push(context as usize);
    }

    fn halt(&self) -> ! {
        panic!("halted");
    }
}
