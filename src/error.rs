use std::io;
use thiserror::Error;

use crate::memory::descriptor::MemKind;

#[derive(Error, Debug)]
pub enum MemError {
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid device handle: {0}")]
    InvalidHandle(String),
    #[error("Out of device memory")]
    OutOfMemory,
    #[error("Device range 0x{addr:x}+0x{size:x} is outside the valid window")]
    RangeInvalid { addr: u64, size: u64 },
    #[error("Driver Error: {0}")]
    Driver(String),
    #[error("{op} is not supported in {mode} mode")]
    UnsupportedMode { op: &'static str, mode: &'static str },
    #[error("Source and destination are the same chip (dev {0})")]
    SameChip(u32),
    #[error("CDMA only spans one card: src bdf 0x{src_bdf:x}, dst bdf 0x{dst_bdf:x}")]
    CrossCardUnsupported { src_bdf: u32, dst_bdf: u32 },
    #[error("Guard region overwritten past 0x{addr:x}+0x{size:x}")]
    GuardCorruption { addr: u64, size: u64 },
    #[error("No allocation recorded at 0x{0:x}")]
    NotFound(u64),
    #[error("Descriptor type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch { expected: MemKind, found: MemKind },
    #[error("Not supported: {0}")]
    NotSupported(String),
    #[error("Kernel launch failed: {0}")]
    KernelLaunch(String),
}

impl MemError {
    /// Maps a failed driver call onto the error taxonomy.
    pub fn from_driver(op: &str, err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOMEM) => MemError::OutOfMemory,
            Some(libc::EBADF) => MemError::InvalidHandle(format!("{op}: {err}")),
            _ => MemError::Driver(format!("{op}: {err}")),
        }
    }
}

pub type MemResult<T> = Result<T, MemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errno_mapping() {
        let oom = MemError::from_driver("alloc", io::Error::from_raw_os_error(libc::ENOMEM));
        assert!(matches!(oom, MemError::OutOfMemory));

        let badf = MemError::from_driver("free", io::Error::from_raw_os_error(libc::EBADF));
        assert!(matches!(badf, MemError::InvalidHandle(_)));

        let other = MemError::from_driver("memcpy", io::Error::from_raw_os_error(libc::EIO));
        match other {
            MemError::Driver(msg) => assert!(msg.starts_with("memcpy")),
            e => panic!("unexpected {e:?}"),
        }
    }
}
