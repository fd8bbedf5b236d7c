//! board support. only the board layer touches real hardware, everything else goes through `arch::Hardware`

#[cfg(feature = "platform-dreamcast")]
pub mod dreamcast;
