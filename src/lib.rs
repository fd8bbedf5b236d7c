//! exception dispatch and break segment core for an SH4 console kernel

#![cfg_attr(not(test), no_std)]
#![allow(clippy::missing_safety_doc)] // dont really want to write safety docs yet

extern crate alloc;

pub mod arch;
pub mod errno;
pub mod irq;
pub mod logging;
pub mod mm;
pub mod platform;
pub mod unwind;

#[cfg(test)]
pub(crate) mod testing;

use core::{fmt, fmt::LowerHex};

pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// formats the wrapped value as hex when debug printed, used for register dumps
pub struct FormatHex<T: LowerHex>(pub T);

impl<T: LowerHex> fmt::Debug for FormatHex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
