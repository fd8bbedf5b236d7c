//! exception/interrupt dispatch core
//!
//! one `IrqCore` owns everything the dispatcher needs: the per-code handler table, the TRAPA sub-table,
//! the global handler slot, the "inside an exception" word and the pointer to the context that gets
//! saved into and resumed from. the vector stub calls `handle_exception()` with the interrupted
//! registers already saved into the active context

mod dispatch;
mod handler;

pub use dispatch::*;
pub use handler::*;

use crate::{
    arch::{ExceptionCode, Hardware, InterruptMask, IrqContext, StatusFlags},
    errno::{ErrorCode, Errno},
};
use alloc::{boxed::Box, sync::Arc};
use core::{
    cell::UnsafeCell,
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicPtr, AtomicU32, Ordering},
};
use log::{debug, trace};
use spin::{Mutex, RwLock};

/// errors returned by the registration and lifecycle calls
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IrqError {
    /// the code is out of range or doesn't have its low 4 bits clear
    InvalidCode(ExceptionCode),

    /// the code has its own registration call (double faults, see set_double_fault_handler())
    ReservedCode(ExceptionCode),

    /// TRAPA vectors only go up to 255
    InvalidTrapVector(u32),

    /// init() was called twice without a shutdown() in between
    AlreadyInitialized,
}

impl ErrorCode for IrqError {
    fn code(&self) -> i32 {
        match self {
            Self::InvalidCode(_) | Self::ReservedCode(_) | Self::InvalidTrapVector(_) => -1,
            Self::AlreadyInitialized => -2,
        }
    }
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCode(code) => write!(f, "invalid exception code {:#x}", code.0),
            Self::ReservedCode(code) => write!(f, "exception code {:#x} can't be registered with set_handler()", code.0),
            Self::InvalidTrapVector(vector) => write!(f, "invalid trap vector {vector:#x}"),
            Self::AlreadyInitialized => write!(f, "exception handling already initialized"),
        }
    }
}

impl From<IrqError> for Errno {
    fn from(err: IrqError) -> Self {
        match err {
            IrqError::InvalidCode(_) | IrqError::ReservedCode(_) | IrqError::InvalidTrapVector(_) => Errno::InvalidArgument,
            IrqError::AlreadyInitialized => Errno::Busy,
        }
    }
}

/// hardware state captured by init() and put back by shutdown()
#[derive(Debug, Copy, Clone)]
struct SavedState {
    status: u32,
    vector_base: usize,
}

/// storage for the context that's active when nobody has set a different one
struct ContextSlot(UnsafeCell<IrqContext>);

// only ever accessed through the active context pointer, under the same rules as any other context
unsafe impl Sync for ContextSlot {}

pub struct IrqCore<H: Hardware> {
    hardware: H,

    /// address of the vector table installed on init
    vector_base: usize,

    handlers: RwLock<HandlerTable<dyn IrqHandler>>,
    trap_handlers: RwLock<HandlerTable<dyn TrapHandler>>,
    global_handler: RwLock<Option<Arc<dyn IrqHandler>>>,
    double_fault_handler: RwLock<Option<Arc<dyn DoubleFaultHandler>>>,

    /// nonzero while an exception is being handled: the exception class in bits 16-19, the event code in bits 0-15
    inside_int: AtomicU32,

    /// the context the vector stub saves into and resumes from
    active_context: AtomicPtr<IrqContext>,
    default_context: Box<ContextSlot>,

    /// None until init() is called
    saved: Mutex<Option<SavedState>>,
}

impl<H: Hardware> IrqCore<H> {
    /// creates a new dispatch core that will install the given vector table when initialized
    pub fn new(hardware: H, vector_base: usize) -> Self {
        let default_context = Box::new(ContextSlot(UnsafeCell::new(IrqContext::default())));
        let active_context = AtomicPtr::new(default_context.0.get());

        Self {
            hardware,
            vector_base,
            handlers: RwLock::new(HandlerTable::new()),
            trap_handlers: RwLock::new(HandlerTable::new()),
            global_handler: RwLock::new(None),
            double_fault_handler: RwLock::new(None),
            inside_int: AtomicU32::new(0),
            active_context,
            default_context,
            saved: Mutex::new(None),
        }
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    /// sets up exception handling: saves the hardware state, masks interrupts, empties all tables and installs the vector table
    pub fn init(&self) -> Result<(), IrqError> {
        let mut saved = self.saved.lock();

        if saved.is_some() {
            return Err(IrqError::AlreadyInitialized);
        }

        let state = SavedState {
            status: self.disable(),
            vector_base: self.hardware.vector_base(),
        };

        self.handlers.write().clear();
        self.trap_handlers.write().clear();
        *self.global_handler.write() = None;
        *self.double_fault_handler.write() = None;
        self.inside_int.store(0, Ordering::SeqCst);
        self.active_context.store(self.default_context.0.get(), Ordering::SeqCst);

        self.hardware.set_vector_base(self.vector_base);

        debug!("vector table @ {:#x} (was {:#x}), status was {:#x}", self.vector_base, state.vector_base, state.status);

        *saved = Some(state);

        Ok(())
    }

    /// tears down exception handling and puts the vector base and status register back the way init() found them.
    /// does nothing if not initialized
    pub fn shutdown(&self) {
        let state = match self.saved.lock().take() {
            Some(state) => state,
            None => return,
        };

        self.disable();

        self.handlers.write().clear();
        self.trap_handlers.write().clear();
        *self.global_handler.write() = None;
        *self.double_fault_handler.write() = None;

        self.hardware.set_vector_base(state.vector_base);
        self.hardware.set_status(state.status);

        debug!("restored vector table @ {:#x}", state.vector_base);
    }

    /// whether init() has been called
    pub fn is_initialized(&self) -> bool {
        self.saved.lock().is_some()
    }

    /// runs `f` with interrupts masked. every lock on the tables is taken through here, so an exception can't
    /// come in and spin on a lock the code it interrupted is holding
    fn masked<T>(&self, f: impl FnOnce() -> T) -> T {
        let old = self.disable();
        let result = f();
        self.restore(old);
        result
    }

    /// sets or removes (when given None) the handler for an exception code
    pub fn set_handler(&self, code: ExceptionCode, handler: Option<Arc<dyn IrqHandler>>) -> Result<(), IrqError> {
        let index = handler_index(code)?;

        trace!("{} handler for {code}", if handler.is_some() { "setting" } else { "removing" });

        self.masked(|| self.handlers.write().set(index, handler));

        Ok(())
    }

    /// convenience wrapper around set_handler() for anything that can be a handler
    pub fn register<F: IrqHandler + 'static>(&self, code: ExceptionCode, handler: F) -> Result<(), IrqError> {
        self.set_handler(code, Some(Arc::new(handler)))
    }

    /// gets the handler registered for an exception code, if any
    pub fn get_handler(&self, code: ExceptionCode) -> Result<Option<Arc<dyn IrqHandler>>, IrqError> {
        let index = handler_index(code)?;

        Ok(self.masked(|| self.handlers.read().get(index)))
    }

    /// sets or removes the handler called before any other for every exception
    pub fn set_global_handler(&self, handler: Option<Arc<dyn IrqHandler>>) {
        self.masked(|| *self.global_handler.write() = handler);
    }

    pub fn get_global_handler(&self) -> Option<Arc<dyn IrqHandler>> {
        self.masked(|| self.global_handler.read().clone())
    }

    /// sets or removes the handler called when an exception comes in while another one is still being handled
    pub fn set_double_fault_handler(&self, handler: Option<Arc<dyn DoubleFaultHandler>>) {
        trace!("{} double fault handler", if handler.is_some() { "setting" } else { "removing" });

        self.masked(|| *self.double_fault_handler.write() = handler);
    }

    pub fn get_double_fault_handler(&self) -> Option<Arc<dyn DoubleFaultHandler>> {
        self.masked(|| self.double_fault_handler.read().clone())
    }

    /// sets or removes the handler for a TRAPA vector
    pub fn set_trap_handler(&self, vector: u32, handler: Option<Arc<dyn TrapHandler>>) -> Result<(), IrqError> {
        let index = trap_index(vector)?;

        self.masked(|| self.trap_handlers.write().set(index, handler));

        Ok(())
    }

    pub fn get_trap_handler(&self, vector: u32) -> Result<Option<Arc<dyn TrapHandler>>, IrqError> {
        let index = trap_index(vector)?;

        Ok(self.masked(|| self.trap_handlers.read().get(index)))
    }

    /// whether an exception is currently being handled
    pub fn inside_int(&self) -> bool {
        self.inside_int.load(Ordering::SeqCst) != 0
    }

    /// the code of the exception currently being handled, 0 if none is
    pub fn active_int(&self) -> u32 {
        self.inside_int.load(Ordering::SeqCst) & 0xffff
    }

    /// the context that will be resumed when exception handling finishes
    pub fn active_context(&self) -> NonNull<IrqContext> {
        // never null, it's only ever set from the default context or a NonNull
        unsafe { NonNull::new_unchecked(self.active_context.load(Ordering::SeqCst)) }
    }

    /// the context that's active when nothing else has been set
    pub fn default_context(&self) -> NonNull<IrqContext> {
        unsafe { NonNull::new_unchecked(self.default_context.0.get()) }
    }

    /// replaces the context that will be saved into and resumed from, returning the old one
    ///
    /// # Safety
    ///
    /// the context has to stay valid until it's replaced again. this should only be called with interrupts masked
    /// (which they are inside any handler) or before the vector table is installed
    pub unsafe fn set_active_context(&self, context: NonNull<IrqContext>) -> NonNull<IrqContext> {
        let old = self.active_context.swap(context.as_ptr(), Ordering::SeqCst);
        NonNull::new_unchecked(old)
    }

    /// finishes up as if an exception had just been handled, resuming whatever context is active.
    /// used to switch contexts without a real exception
    pub fn force_return(&self) {
        self.disable();
        self.inside_int.store(0, Ordering::SeqCst);
        self.hardware.resume(self.active_context.load(Ordering::SeqCst));
    }

    /// gets a reference to the active context for handlers to work on
    ///
    /// # Safety
    ///
    /// nothing else may be touching the active context, which holds inside exception handling on a single CPU.
    /// the double fault path must not use this, the interrupted handler still holds its reference
    unsafe fn context_mut(&self) -> &mut IrqContext {
        &mut *self.active_context.load(Ordering::SeqCst)
    }
}

impl<H: Hardware> InterruptMask for IrqCore<H> {
    fn disable(&self) -> u32 {
        let status = self.hardware.status();
        self.hardware.set_status((status & !StatusFlags::BL.bits()) | StatusFlags::IMask.bits());
        status
    }

    fn enable(&self) {
        let status = self.hardware.status();
        self.hardware.set_status(status & !(StatusFlags::BL | StatusFlags::IMask).bits());
    }

    fn restore(&self, previous: u32) {
        self.hardware.set_status(previous);
    }
}

fn handler_index(code: ExceptionCode) -> Result<usize, IrqError> {
    if !code.is_registrable() {
        Err(IrqError::InvalidCode(code))
    } else if code == ExceptionCode::DOUBLE_FAULT {
        Err(IrqError::ReservedCode(code))
    } else {
        Ok(code.index())
    }
}

fn trap_index(vector: u32) -> Result<usize, IrqError> {
    if (vector as usize) < TABLE_SIZE {
        Ok(vector as usize)
    } else {
        Err(IrqError::InvalidTrapVector(vector))
    }
}
