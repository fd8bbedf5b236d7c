use super::StatusFlags;
use crate::{arch::RegisterContext, FormatHex};
use core::fmt;

/// value put in the frame pointer of a fresh context, meaning there's no caller frame above it
pub const NO_FRAME: u32 = 0xffff_ffff;

/// how many arguments are passed in registers (r4-r7)
pub const MAX_REGISTER_ARGS: usize = 4;

/// index of the frame pointer in the general purpose registers
pub const FRAME_POINTER: usize = 14;

/// index of the stack pointer in the general purpose registers
pub const STACK_POINTER: usize = 15;

/// first argument/return value register
const FIRST_ARG: usize = 4;

/// P1-P4 address bits, cleared from user mode stack pointers so they land in U0
const PRIVILEGED_ADDRESS_BITS: u32 = 0xf000_0000;

/// status register a fresh context starts with: privileged, all maskable interrupts masked
pub fn initial_status() -> u32 {
    (StatusFlags::MD | StatusFlags::IMask).bits()
}

/// full register file of the CPU at the moment of interruption
///
/// the vector stub saves into and restores from whichever of these is currently active
#[repr(C, align(32))]
#[derive(Default, Copy, Clone, PartialEq)]
pub struct IrqContext {
    /// general purpose registers r0-r15. r14 is the frame pointer, r15 the stack pointer
    pub r: [u32; 16],

    /// program counter
    pub pc: u32,

    /// procedure return address
    pub pr: u32,

    /// global base register
    pub gbr: u32,

    /// vector base register
    pub vbr: u32,

    /// multiply-accumulate high
    pub mach: u32,

    /// multiply-accumulate low
    pub macl: u32,

    /// status register
    pub sr: u32,

    /// FPU communication register
    pub fpul: u32,

    /// the floating point bank not currently selected by FPSCR.FR
    pub frbank: [u32; 16],

    /// the floating point bank currently selected
    pub fr: [u32; 16],

    /// FPU status/control register
    pub fpscr: u32,
}

impl IrqContext {
    /// sets up this context so that resuming it starts `routine` on the given stack
    ///
    /// only the registers that matter for a fresh start are written: the general and floating point registers
    /// are zeroed, pc/pr/sr/r14/r15 are set and up to 4 arguments are copied into r4-r7. anything past that is ignored
    pub fn create(&mut self, stack_pointer: usize, routine: usize, args: &[u32], is_user_mode: bool) {
        self.r = [0; 16];
        self.fr = [0; 16];
        self.frbank = [0; 16];

        self.pc = routine as u32;
        self.pr = 0;
        self.sr = initial_status();
        self.r[STACK_POINTER] = stack_pointer as u32;
        self.r[FRAME_POINTER] = NO_FRAME;

        for (reg, arg) in self.r[FIRST_ARG..FIRST_ARG + MAX_REGISTER_ARGS].iter_mut().zip(args) {
            *reg = *arg;
        }

        if is_user_mode {
            self.sr &= !StatusFlags::MD.bits();
            self.r[STACK_POINTER] &= !PRIVILEGED_ADDRESS_BITS;
        }
    }

    /// address this context returns to when the running routine finishes
    pub fn return_address(&self) -> usize {
        self.pr as usize
    }

    /// gets one of the register-passed arguments
    pub fn argument(&self, num: usize) -> Option<u32> {
        if num < MAX_REGISTER_ARGS {
            Some(self.r[FIRST_ARG + num])
        } else {
            None
        }
    }

    /// sets the value the interrupted code sees as the result of a call (r0)
    pub fn set_return_value(&mut self, value: u32) {
        self.r[0] = value;
    }

    /// whether this context runs in privileged mode
    pub fn is_privileged(&self) -> bool {
        self.sr & StatusFlags::MD.bits() != 0
    }
}

impl RegisterContext for IrqContext {
    fn from_fn(func: usize, stack: usize, args: &[u32], is_user_mode: bool) -> Self {
        let mut context = Self::default();
        context.create(stack, func, args, is_user_mode);
        context
    }

    fn instruction_pointer(&self) -> usize {
        self.pc as usize
    }

    fn stack_pointer(&self) -> usize {
        self.r[STACK_POINTER] as usize
    }

    fn frame_pointer(&self) -> usize {
        self.r[FRAME_POINTER] as usize
    }
}

struct HexRegisters<'a>(&'a [u32]);

impl fmt::Debug for HexRegisters<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter().map(|r| FormatHex(*r))).finish()
    }
}

impl fmt::Debug for IrqContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqContext")
            .field("r", &HexRegisters(&self.r))
            .field("pc", &FormatHex(self.pc))
            .field("pr", &FormatHex(self.pr))
            .field("gbr", &FormatHex(self.gbr))
            .field("vbr", &FormatHex(self.vbr))
            .field("mach", &FormatHex(self.mach))
            .field("macl", &FormatHex(self.macl))
            .field("sr", &FormatHex(self.sr))
            .field("fpul", &FormatHex(self.fpul))
            .field("frbank", &HexRegisters(&self.frbank))
            .field("fr", &HexRegisters(&self.fr))
            .field("fpscr", &FormatHex(self.fpscr))
            .finish()
    }
}
