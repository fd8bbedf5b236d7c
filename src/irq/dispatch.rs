use super::{IrqCore, IrqResult};
use crate::{
    arch::{ExceptionCode, Hardware, InterruptMask, IrqContext, RegisterContext, PROPERTIES},
    unwind::{print_stack_trace, FrameReader},
};
use core::sync::atomic::Ordering;
use log::{error, info, trace};
use num_enum::TryFromPrimitive;

/// which vector the stub came in through, tells the dispatcher where to find the event code
#[derive(Debug, TryFromPrimitive, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ExceptionClass {
    /// reset vector. never makes it here on working hardware
    Reset = 0,

    /// general exception vector (VBR + 0x100), code in EXPEVT
    General = 1,

    /// TLB miss vector (VBR + 0x400), code in EXPEVT
    TlbMiss = 2,

    /// interrupt vector (VBR + 0x600), code in INTEVT
    Interrupt = 3,
}

/// logs everything there is to know about an exception: the code, all registers and a stack trace
pub fn dump_context<R: FrameReader + ?Sized>(reader: &R, code: ExceptionCode, context: &IrqContext) {
    error!("exception {code} @ {:#010x}, pr {:#010x}", context.pc, context.pr);
    info!("{context:#?}");
    print_stack_trace(reader, context.frame_pointer(), PROPERTIES.max_stack_frames);
}

impl<H: Hardware> IrqCore<H> {
    /// entry point from the vector stub
    ///
    /// walks the handler chain for the exception that's just been raised: the global handler, timer bookkeeping, the
    /// handler for the specific code (or the trap table for TRAPA), and if none of that accepted it, the unhandled
    /// exception handler. if there's no unhandled exception handler, or an exception is raised while another one is
    /// still being handled and there's no double fault handler, this dumps everything it knows and halts
    pub fn handle_exception(&self, class: u32) {
        let class = match ExceptionClass::try_from(class) {
            Ok(ExceptionClass::Reset) => {
                error!("PANIC: reset exception reached the dispatcher");
                self.hardware.halt();
            }
            Ok(class) => class,
            Err(_) => {
                error!("PANIC: exception handler called with unknown class {class}");
                self.hardware.halt();
            }
        };

        let code = match class {
            ExceptionClass::Interrupt => ExceptionCode(self.hardware.interrupt_event()),
            _ => ExceptionCode(self.hardware.exception_event()),
        };

        if self.inside_int.load(Ordering::SeqCst) != 0 {
            self.double_fault(code);
            return;
        }

        self.inside_int.store(((class as u32 & 0xf) << 16) | (code.0 & 0xffff), Ordering::SeqCst);

        let mut handled = false;
        let mut chain_done = false;

        if let Some(global) = self.get_global_handler() {
            // safe since we're inside exception handling, see context_mut()
            let result = global.handle(code, unsafe { self.context_mut() });
            trace!("global handler: {result:?} for {code}");

            // having run at all counts, accepting also skips the specific handler
            handled = true;
            chain_done = result == IrqResult::Accepted;
        }

        if let Some(channel) = code.timer_channel() {
            self.hardware.clear_timer_underflow(channel);
            handled = true;
        }

        if !chain_done && self.dispatch_specific(code) == IrqResult::Accepted {
            handled = true;
        }

        if !handled {
            self.unhandled(code);
        }

        self.disable();
        self.inside_int.store(0, Ordering::SeqCst);
    }

    /// runs the handler registered for this code. TRAPA goes to the trap table unless something's registered for it directly
    fn dispatch_specific(&self, code: ExceptionCode) -> IrqResult {
        // bind before matching so the table lock is dropped before the handler runs
        let handler = self.handlers.read().get(code.index());

        if let Some(handler) = handler {
            let result = handler.handle(code, unsafe { self.context_mut() });
            trace!("handler: {result:?} for {code}");
            return result;
        }

        if code == ExceptionCode::TRAPA {
            let vector = ((self.hardware.trap_code() >> 2) & 0xff) as u8;
            let handler = self.trap_handlers.read().get(vector as usize);

            if let Some(handler) = handler {
                let result = handler.handle(vector, unsafe { self.context_mut() });
                trace!("trap handler: {result:?} for vector {vector:#x}");
                return result;
            }

            trace!("no trap handler for vector {vector:#x}");
        }

        IrqResult::NotApplicable
    }

    /// hands an exception nobody accepted to the unhandled exception handler, halting if there's none or it refuses
    fn unhandled(&self, code: ExceptionCode) {
        let handler = self.handlers.read().get(ExceptionCode::UNHANDLED.index());

        match handler {
            Some(handler) => {
                if handler.handle(code, unsafe { self.context_mut() }) == IrqResult::Rejected {
                    self.fatal(code, "unhandled exception rejected by its handler");
                }
            }
            None => self.fatal(code, "unhandled IRQ/exception"),
        }
    }

    /// an exception came in while we were still handling another one
    ///
    /// the handler that was interrupted still holds its `&mut` to the active context, so no reference to it is made here
    fn double_fault(&self, code: ExceptionCode) {
        // still the context of the exception that was interrupted
        let context = self.active_context();

        match self.get_double_fault_handler() {
            Some(handler) => handler.handle(context),
            None => {
                error!("PANIC: double fault, {code} raised while handling {:#06x}", self.active_int());

                // the interrupted handler never runs again after this, so copying out of the context is fine
                let snapshot = unsafe { context.as_ptr().read_volatile() };
                dump_context(&self.hardware, code, &snapshot);

                self.hardware.halt();
            }
        }
    }

    fn fatal(&self, code: ExceptionCode, reason: &str) -> ! {
        error!("PANIC: {reason}");
        dump_context(&self.hardware, code, unsafe { self.context_mut() });

        self.inside_int.store(0, Ordering::SeqCst);
        self.hardware.halt();
    }
}
