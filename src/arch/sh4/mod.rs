//! SH4 exception model: event codes, status register layout and on-chip register addresses

mod context;

pub use context::*;

use super::{ArchProperties, ContiguousRegion};
use bitmask_enum::bitmask;
use core::fmt;
use num_enum::TryFromPrimitive;

/// trap register, holds the TRAPA immediate << 2
pub const TRA: usize = 0xff00_0020;

/// exception event register
pub const EXPEVT: usize = 0xff00_0024;

/// interrupt event register
pub const INTEVT: usize = 0xff00_0028;

/// timer control registers for TMU channels 0-2
pub const TMU_TCR: [usize; 3] = [0xffd8_0010, 0xffd8_001c, 0xffd8_0028];

/// underflow flag in a timer control register
pub const TMU_TCR_UNF: u16 = 0x100;

pub static PROPERTIES: ArchProperties = ArchProperties {
    // 16 MiB of main RAM, P1 mirror
    ram_region: ContiguousRegion::new(0x8c00_0000, 0x0100_0000),
    kernel_stack_size: 0x10000,
    alloc_align: 4,
    max_stack_frames: 32,
};

/// status register bits
#[bitmask(u32)]
pub enum StatusFlags {
    /// result of compare/test instructions
    T = 1 << 0,

    /// saturation for multiply-accumulate
    S = 1 << 1,

    /// interrupt mask level, 4 bits wide. all set masks every maskable source
    IMask = 0xf << 4,

    /// divide step flags
    Q = 1 << 8,
    M = 1 << 9,

    /// FPU disable
    FD = 1 << 15,

    /// block exceptions and interrupts
    BL = 1 << 28,

    /// register bank select
    RB = 1 << 29,

    /// privileged mode
    MD = 1 << 30,
}

/// every event code the CPU can report through EXPEVT/INTEVT, plus the two soft codes the dispatcher raises on its own
///
/// some codes are shared between a read and a write flavour of the same fault, those are named after the read side
#[derive(Debug, TryFromPrimitive, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Exception {
    PowerOnReset = 0x000,
    ManualReset = 0x020,
    TlbMissRead = 0x040,
    TlbMissWrite = 0x060,
    InitialPageWrite = 0x080,
    TlbProtectionRead = 0x0a0,
    TlbProtectionWrite = 0x0c0,
    AddressErrorRead = 0x0e0,
    AddressErrorWrite = 0x100,
    Fpu = 0x120,
    TlbMultipleHit = 0x140,
    /// unconditional trap (TRAPA), sub-dispatched through the trap table
    Trapa = 0x160,
    IllegalInstruction = 0x180,
    SlotIllegalInstruction = 0x1a0,
    NonMaskableInterrupt = 0x1c0,
    UserBreak = 0x1e0,
    Irl0 = 0x200,
    Irl1 = 0x220,
    Irl2 = 0x240,
    Irl3 = 0x260,
    Irl4 = 0x280,
    Irl5 = 0x2a0,
    Irl6 = 0x2c0,
    Irl7 = 0x2e0,
    Irl8 = 0x300,
    Irl9 = 0x320,
    IrlA = 0x340,
    IrlB = 0x360,
    IrlC = 0x380,
    IrlD = 0x3a0,
    IrlE = 0x3c0,
    Tmu0Underflow = 0x400,
    Tmu1Underflow = 0x420,
    Tmu2Underflow = 0x440,
    Tmu2InputCapture = 0x460,
    RtcAlarm = 0x480,
    RtcPeriodic = 0x4a0,
    RtcCarry = 0x4c0,
    SciError = 0x4e0,
    SciReceive = 0x500,
    SciTransmit = 0x520,
    SciTransmitEnd = 0x540,
    Watchdog = 0x560,
    RefreshCompareMatch = 0x580,
    RefreshOverflow = 0x5a0,
    Udi = 0x600,
    Gpio = 0x620,
    DmaTransferEnd0 = 0x640,
    DmaTransferEnd1 = 0x660,
    DmaTransferEnd2 = 0x680,
    DmaTransferEnd3 = 0x6a0,
    DmaError = 0x6c0,
    ScifError = 0x700,
    ScifReceive = 0x720,
    ScifBreak = 0x740,
    ScifTransmit = 0x760,
    GeneralFpuDisable = 0x800,
    SlotFpuDisable = 0x820,
    /// raised by the dispatcher when nothing in the chain accepted an exception
    UnhandledException = 0xfe0,
    /// raised by the dispatcher when an exception arrives while another one is being handled
    DoubleFault = 0xff0,
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PowerOnReset => "power-on reset",
            Self::ManualReset => "manual reset",
            Self::TlbMissRead => "TLB miss (read)",
            Self::TlbMissWrite => "TLB miss (write)",
            Self::InitialPageWrite => "initial page write",
            Self::TlbProtectionRead => "TLB protection violation (read)",
            Self::TlbProtectionWrite => "TLB protection violation (write)",
            Self::AddressErrorRead => "address error (read)",
            Self::AddressErrorWrite => "address error (write)",
            Self::Fpu => "floating-point exception",
            Self::TlbMultipleHit => "TLB multiple hit",
            Self::Trapa => "unconditional trap",
            Self::IllegalInstruction => "illegal instruction",
            Self::SlotIllegalInstruction => "slot illegal instruction",
            Self::NonMaskableInterrupt => "non-maskable interrupt",
            Self::UserBreak => "user break",
            Self::Irl0
            | Self::Irl1
            | Self::Irl2
            | Self::Irl3
            | Self::Irl4
            | Self::Irl5
            | Self::Irl6
            | Self::Irl7
            | Self::Irl8
            | Self::Irl9
            | Self::IrlA
            | Self::IrlB
            | Self::IrlC
            | Self::IrlD
            | Self::IrlE => "external interrupt",
            Self::Tmu0Underflow => "TMU0 underflow",
            Self::Tmu1Underflow => "TMU1 underflow",
            Self::Tmu2Underflow => "TMU2 underflow",
            Self::Tmu2InputCapture => "TMU2 input capture",
            Self::RtcAlarm => "RTC alarm",
            Self::RtcPeriodic => "RTC periodic",
            Self::RtcCarry => "RTC carry",
            Self::SciError => "SCI receive error",
            Self::SciReceive => "SCI receive",
            Self::SciTransmit => "SCI transmit",
            Self::SciTransmitEnd => "SCI transmit end",
            Self::Watchdog => "watchdog interval timer",
            Self::RefreshCompareMatch => "refresh compare match",
            Self::RefreshOverflow => "refresh counter overflow",
            Self::Udi => "user debug interface",
            Self::Gpio => "GPIO",
            Self::DmaTransferEnd0 => "DMA transfer end (channel 0)",
            Self::DmaTransferEnd1 => "DMA transfer end (channel 1)",
            Self::DmaTransferEnd2 => "DMA transfer end (channel 2)",
            Self::DmaTransferEnd3 => "DMA transfer end (channel 3)",
            Self::DmaError => "DMA address error",
            Self::ScifError => "SCIF receive error",
            Self::ScifReceive => "SCIF receive",
            Self::ScifBreak => "SCIF break",
            Self::ScifTransmit => "SCIF transmit",
            Self::GeneralFpuDisable => "FPU disabled",
            Self::SlotFpuDisable => "FPU disabled (delay slot)",
            Self::UnhandledException => "unhandled exception",
            Self::DoubleFault => "double fault",
        };
        write!(f, "{name}")
    }
}

/// a raw event code as read from EXPEVT/INTEVT
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ExceptionCode(pub u32);

impl ExceptionCode {
    pub const TRAPA: Self = Self(Exception::Trapa as u32);
    pub const UNHANDLED: Self = Self(Exception::UnhandledException as u32);
    pub const DOUBLE_FAULT: Self = Self(Exception::DoubleFault as u32);

    /// one past the highest code a handler can be registered for
    pub const LIMIT: u32 = 0x1000;

    /// whether a handler can be registered for this code: in range, with the low 4 bits clear
    pub fn is_registrable(&self) -> bool {
        self.0 < Self::LIMIT && self.0 & 0xf == 0
    }

    /// the handler table slot this code maps to
    pub fn index(&self) -> usize {
        (self.0 >> 4) as usize
    }

    /// looks this code up in the list of known exceptions
    pub fn kind(&self) -> Option<Exception> {
        Exception::try_from(self.0).ok()
    }

    /// if this is a periodic timer underflow, which TMU channel raised it
    pub fn timer_channel(&self) -> Option<usize> {
        match self.kind() {
            Some(Exception::Tmu0Underflow) => Some(0),
            Some(Exception::Tmu1Underflow) => Some(1),
            Some(Exception::Tmu2Underflow) => Some(2),
            _ => None,
        }
    }
}

impl From<Exception> for ExceptionCode {
    fn from(exception: Exception) -> Self {
        Self(exception as u32)
    }
}

impl fmt::Debug for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExceptionCode({:#06x})", self.0)
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{:#06x} ({kind})", self.0),
            None => write!(f, "{:#06x} (unknown)", self.0),
        }
    }
}
