//! the Dreamcast: SH7091 CPU, 16 MiB of RAM at 0x0c000000
//!
//! the vector stub (in assembly, linked in by the board's startup code) saves the interrupted registers into whatever
//! `irq_active_context()` returns, calls `irq_handle_exception()` with the exception class and then restores from
//! `irq_active_context()` again

pub mod logger;

use crate::{
    arch::{Hardware, IrqContext, EXPEVT, INTEVT, PROPERTIES, TMU_TCR, TMU_TCR_UNF, TRA},
    errno::{set_errno, status, Errno},
    irq::{IrqCore, IrqError},
    logging,
    mm::{BreakLayout, BreakSegment, BrkError, LayoutError, SBRK_FAILED},
    unwind::{FrameReader, RawMemory},
};
use core::{fmt, ptr::addr_of};
use lazy_static::lazy_static;
use log::{info, LevelFilter};
use spin::Once;
use volatile::Volatile;

extern "C" {
    /// reads SR
    fn arch_get_sr() -> u32;

    /// writes SR
    fn arch_set_sr(sr: u32);

    /// reads VBR
    fn arch_get_vbr() -> usize;

    /// writes VBR
    fn arch_set_vbr(vbr: usize);

    /// loads every register from the given context and returns from exception into it
    fn arch_restore_context(context: *mut IrqContext) -> !;

    /// sleeps forever with interrupts masked
    fn arch_halt() -> !;

    /// start of the vector table in the vector stub
    static irq_vector_table: u8;

    /// end of static data, provided by the linker script
    static end: u8;
}

/// the real CPU
pub struct Sh4Hardware;

impl Sh4Hardware {
    unsafe fn read_register(addr: usize) -> u32 {
        Volatile::new_read_only(&*(addr as *const u32)).read()
    }
}

impl FrameReader for Sh4Hardware {
    fn read_u32(&self, addr: usize) -> Option<u32> {
        // all of RAM is mapped through P1, no MMU involved
        unsafe { RawMemory::new(PROPERTIES.ram_region) }.read_u32(addr)
    }
}

impl Hardware for Sh4Hardware {
    fn exception_event(&self) -> u32 {
        unsafe { Self::read_register(EXPEVT) }
    }

    fn interrupt_event(&self) -> u32 {
        unsafe { Self::read_register(INTEVT) }
    }

    fn trap_code(&self) -> u32 {
        unsafe { Self::read_register(TRA) }
    }

    fn status(&self) -> u32 {
        unsafe { arch_get_sr() }
    }

    fn set_status(&self, sr: u32) {
        unsafe { arch_set_sr(sr) }
    }

    fn vector_base(&self) -> usize {
        unsafe { arch_get_vbr() }
    }

    fn set_vector_base(&self, vbr: usize) {
        unsafe { arch_set_vbr(vbr) }
    }

    fn clear_timer_underflow(&self, channel: usize) {
        if let Some(&tcr) = TMU_TCR.get(channel) {
            unsafe { Volatile::new(&mut *(tcr as *mut u16)).update(|tcr| *tcr &= !TMU_TCR_UNF) }
        }
    }

    fn resume(&self, context: *mut IrqContext) {
        unsafe { arch_restore_context(context) }
    }

    fn halt(&self) -> ! {
        unsafe { arch_halt() }
    }
}

lazy_static! {
    /// the exception dispatcher
    pub static ref IRQ: IrqCore<Sh4Hardware> = IrqCore::new(Sh4Hardware, unsafe { addr_of!(irq_vector_table) as usize });
}

/// the break segment between static data and the kernel stack, set up by init()
pub static BREAK: Once<BreakSegment<IrqCore<Sh4Hardware>>> = Once::new();

/// what can go wrong bringing the board up
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitError {
    Irq(IrqError),
    Layout(LayoutError),
}

impl From<IrqError> for InitError {
    fn from(err: IrqError) -> Self {
        Self::Irq(err)
    }
}

impl From<LayoutError> for InitError {
    fn from(err: LayoutError) -> Self {
        Self::Layout(err)
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Irq(err) => write!(f, "{err}"),
            Self::Layout(err) => write!(f, "{err}"),
        }
    }
}

/// brings up logging, exception handling and the break segment, in that order
pub fn init(max_level: LevelFilter) -> Result<(), InitError> {
    // only fails if a logger was already installed, which is fine
    let _ = logging::init(&logger::SERIAL, max_level);

    info!("{} v{}", crate::NAME, crate::VERSION);

    IRQ.init()?;

    if BREAK.get().is_none() {
        let layout = BreakLayout::from_properties(unsafe { addr_of!(end) as usize }, &PROPERTIES);
        let segment = unsafe { BreakSegment::new(layout, PROPERTIES.alloc_align, &*IRQ) }?;
        BREAK.call_once(|| segment);
    }

    Ok(())
}

pub fn shutdown() {
    if let Some(segment) = BREAK.get() {
        segment.shutdown();
    }
    IRQ.shutdown();
}

/// the break segment, or out of memory if init() never set one up
fn break_segment() -> Result<&'static BreakSegment<IrqCore<Sh4Hardware>>, BrkError> {
    BREAK.get().ok_or_else(|| {
        set_errno(Errno::OutOfMemory);
        BrkError::OutOfMemory
    })
}

/// called by the vector stub once the interrupted registers are saved
#[no_mangle]
pub extern "C" fn irq_handle_exception(class: u32) {
    IRQ.handle_exception(class);
}

/// where the vector stub saves registers to and restores them from
#[no_mangle]
pub extern "C" fn irq_active_context() -> *mut IrqContext {
    IRQ.active_context().as_ptr()
}

/// newlib's heap grows through this
#[no_mangle]
pub extern "C" fn sbrk(increment: isize) -> *mut u8 {
    break_segment().and_then(|segment| segment.sbrk(increment)).unwrap_or(SBRK_FAILED)
}

/// moves the break to the given address. 0 on success, -1 if that's outside the segment
#[no_mangle]
pub extern "C" fn brk(new_position: *mut u8) -> i32 {
    status(break_segment().and_then(|segment| segment.brk(new_position as usize)))
}

/// 0 on success, -1 if `bytes` is past the kernel stack, -2 if it's less than what's already handed out
#[no_mangle]
pub extern "C" fn brk_set_capacity(bytes: usize) -> i32 {
    match break_segment() {
        Ok(segment) => status(segment.set_capacity(bytes)),
        Err(err) => status::<BrkError>(Err(err)),
    }
}
