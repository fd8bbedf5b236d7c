use crate::arch::{ExceptionCode, IrqContext};
use aligned::{Aligned, A32};
use alloc::sync::Arc;
use core::ptr::NonNull;

/// how many slots each handler table has
pub const TABLE_SIZE: usize = 0x100;

/// what a handler did with the exception it was given
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IrqResult {
    /// the handler dealt with it, nothing further down the chain needs to
    Accepted,

    /// the handler looked at it and refuses to deal with it
    Rejected,

    /// the handler only observed it
    NotApplicable,
}

/// a handler for exceptions and interrupts
///
/// whatever a C-style API would pass as userdata lives in the implementing type (or the closure's captures)
///
/// `context` is the active context, borrowed for the duration of the call. if another exception comes in while the
/// handler runs, the double fault handler only gets a raw pointer to it, so this borrow stays the only one
pub trait IrqHandler: Send + Sync {
    fn handle(&self, code: ExceptionCode, context: &mut IrqContext) -> IrqResult;
}

impl<F> IrqHandler for F
where F: Fn(ExceptionCode, &mut IrqContext) -> IrqResult + Send + Sync
{
    fn handle(&self, code: ExceptionCode, context: &mut IrqContext) -> IrqResult {
        self(code, context)
    }
}

/// a handler for one TRAPA vector
pub trait TrapHandler: Send + Sync {
    fn handle(&self, vector: u8, context: &mut IrqContext) -> IrqResult;
}

impl<F> TrapHandler for F
where F: Fn(u8, &mut IrqContext) -> IrqResult + Send + Sync
{
    fn handle(&self, vector: u8, context: &mut IrqContext) -> IrqResult {
        self(vector, context)
    }
}

/// a handler for exceptions raised while another exception is still being handled
///
/// it gets a pointer instead of a reference, since the handler that was interrupted still holds a `&mut` to the
/// same context. reading or writing through it is only sound once that handler is known never to touch it again
/// (e.g. right before halting, or when switching away from it for good)
pub trait DoubleFaultHandler: Send + Sync {
    fn handle(&self, context: NonNull<IrqContext>);
}

impl<F> DoubleFaultHandler for F
where F: Fn(NonNull<IrqContext>) + Send + Sync
{
    fn handle(&self, context: NonNull<IrqContext>) {
        self(context)
    }
}

/// fixed size table of optional handlers
///
/// indices are checked by whoever computes them, anything out of range here is a bug
pub struct HandlerTable<T: ?Sized> {
    /// the slots themselves (aligned to a cache line, since they're read on every exception)
    slots: Aligned<A32, [Option<Arc<T>>; TABLE_SIZE]>,
}

impl<T: ?Sized> HandlerTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Aligned(core::array::from_fn(|_| None)),
        }
    }

    /// gets a new reference to the handler in the given slot, so it can be called without holding on to the table
    pub fn get(&self, index: usize) -> Option<Arc<T>> {
        self.slots[index].clone()
    }

    /// replaces the handler in the given slot, returning the old one
    pub fn set(&mut self, index: usize, handler: Option<Arc<T>>) -> Option<Arc<T>> {
        core::mem::replace(&mut self.slots[index], handler)
    }

    /// empties every slot
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// how many slots have a handler in them
    pub fn populated(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl<T: ?Sized> Default for HandlerTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
