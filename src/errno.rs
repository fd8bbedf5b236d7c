//! process-wide error number, numbered the way newlib expects

use core::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};
use num_enum::FromPrimitive;

/// error number and message
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, Default)]
pub enum Errno {
    #[default]
    /// no error (:
    None = 0,
    /// EPERM (operation not permitted)
    OperationNotPermitted = 1,
    /// ENOMEM (out of memory)
    OutOfMemory = 12,
    /// EFAULT (bad address)
    BadAddress = 14,
    /// EBUSY (device or resource busy)
    Busy = 16,
    /// EINVAL (invalid argument)
    InvalidArgument = 22,
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "no error",
                Self::OperationNotPermitted => "operation not permitted",
                Self::OutOfMemory => "out of memory",
                Self::BadAddress => "bad address",
                Self::Busy => "device or resource busy",
                Self::InvalidArgument => "invalid argument",
            }
        )
    }
}

static ERRNO: AtomicU32 = AtomicU32::new(0);

/// sets the process-wide error number
pub fn set_errno(errno: Errno) {
    ERRNO.store(errno as u32, Ordering::Relaxed);
}

/// gets the process-wide error number
pub fn errno() -> Errno {
    Errno::from_primitive(ERRNO.load(Ordering::Relaxed))
}

/// errors that have a negative number a C caller sees instead
pub trait ErrorCode {
    fn code(&self) -> i32;
}

/// turns a result into the 0-or-negative status a C caller expects
pub fn status<E: ErrorCode>(result: Result<(), E>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}
