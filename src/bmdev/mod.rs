//! Raw driver layer: ioctl ABI, the real character device and the in-process simulator.

pub mod cmodel;
pub mod device;
pub mod ioctl;

use std::fmt;
use std::io;
use std::ptr::NonNull;

use ioctl::{
    DeviceMemArgs, DeviceMemArgsU64, GmemAddr, HeapStatByte, IonAllocationData, MemcpyInfo,
    MemcpyP2pInfo, MiscInfo,
};

/// The ioctl-shaped dispatch surface of one accelerator.
///
/// Every method mirrors one driver command; the simulated backend exposes the same call shapes.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    fn misc_info(&self) -> io::Result<MiscInfo>;

    fn alloc_gmem(&self, args: &mut IonAllocationData) -> io::Result<()>;

    fn free_gmem(&self, args: &mut DeviceMemArgs) -> io::Result<()>;

    fn free_gmem_u64(&self, args: &mut DeviceMemArgsU64) -> io::Result<()>;

    /// Closes the buffer-sharing handle returned by `alloc_gmem`.
    fn close_dmabuf(&self, fd: i32) -> io::Result<()>;

    /// Issues one DMA copy and blocks until it completes.
    ///
    /// # Safety
    /// For host-side directions, `info.host_addr` must point to `info.size` bytes that are
    /// readable (HOST2CHIP) or writable (CHIP2HOST) for the duration of the call.
    unsafe fn memcpy(&self, info: &mut MemcpyInfo) -> io::Result<()>;

    fn memcpy_p2p(&self, info: &mut MemcpyP2pInfo) -> io::Result<()>;

    /// Invalidates the cache span packed into `para`.
    fn invalidate(&self, para: u64) -> io::Result<()>;

    /// Flushes the cache span packed into `para`.
    fn flush(&self, para: u64) -> io::Result<()>;

    fn gmem_addr(&self, args: &mut GmemAddr) -> io::Result<()>;

    fn total_gmem(&self) -> io::Result<u64>;

    fn avail_gmem(&self) -> io::Result<u64>;

    fn heap_num(&self) -> io::Result<u32>;

    fn heap_stat(&self, args: &mut HeapStatByte) -> io::Result<()>;

    /// Maps `len` bytes of device memory at mmap offset `offset` into the process.
    fn mmap(&self, offset: u64, len: usize) -> io::Result<NonNull<u8>>;

    /// # Safety
    /// `ptr`/`len` must come from a prior `mmap` on this backend and must not be used afterwards.
    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// True when no physical hardware backs this device.
    fn is_simulated(&self) -> bool {
        false
    }
}
