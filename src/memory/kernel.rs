//! Device-side memory kernels: the launch seam and their parameter blocks.

use crate::error::{MemError, MemResult};
use std::mem::size_of;
use std::path::Path;

pub const MEMORY_OP_KEY: &str = "memory_op.so";

pub const SG_API_MEMCPY: &str = "sg_api_memcpy";
pub const SG_API_MEMCPY_WSTRIDE: &str = "sg_api_memcpy_wstride";
pub const SG_API_MEMCPY_BYTE: &str = "sg_api_memcpy_byte";
pub const SG_API_MEMSET: &str = "sg_api_memset";

/// Opaque handle to a loaded device module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleHandle(pub u64);

/// Loads device modules and runs their functions synchronously.
pub trait KernelLauncher: Send + Sync {
    /// # Errors
    /// Returns `KernelLaunch` if the module cannot be loaded.
    fn load_module(&self, path: &Path, key: &str) -> MemResult<ModuleHandle>;

    /// Runs `function` with a POD parameter block and waits for it to finish.
    ///
    /// # Errors
    /// Returns `KernelLaunch` if the function is unknown or fails on the device.
    fn launch(&self, module: ModuleHandle, function: &str, params: &[u8]) -> MemResult<()>;
}

// ===============================================================================================
// Parameter Blocks
// ===============================================================================================

/// `sg_api_memcpy`: copies `count` dwords.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MemcpyParams {
    pub src_global_offset: u64,
    pub dst_global_offset: u64,
    pub n: i32,
    pub src_nstride: i32,
    pub dst_nstride: i32,
    pub count: i32,
}

/// `sg_api_memcpy_wstride`: copies `count` elements of `format_size` bytes.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MemcpyStrideParams {
    pub src_addr: u64,
    pub dst_addr: u64,
    pub src_stride: i32,
    pub dst_stride: i32,
    pub count: i32,
    pub format_size: i32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MemcpyByteParams {
    pub src_addr: u64,
    pub dst_addr: u64,
    pub size: u64,
}

/// `sg_api_memset`: fills `height * width` bytes with the low `mode` bytes of `value`.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MemsetParams {
    pub global_offset: u64,
    pub height: u32,
    pub width: u32,
    pub mode: i32,
    pub value: i32,
}

const _: () = assert!(size_of::<MemcpyParams>() == 32);
const _: () = assert!(size_of::<MemcpyStrideParams>() == 32);
const _: () = assert!(size_of::<MemcpyByteParams>() == 24);
const _: () = assert!(size_of::<MemsetParams>() == 24);

/// Marker for the padding-free `#[repr(C)]` parameter blocks above.
///
/// # Safety
/// Implementors must have no padding bytes and no invalid bit patterns.
pub unsafe trait KernelParams: Copy {}

unsafe impl KernelParams for MemcpyParams {}
unsafe impl KernelParams for MemcpyStrideParams {}
unsafe impl KernelParams for MemcpyByteParams {}
unsafe impl KernelParams for MemsetParams {}

/// Views a parameter block as the bytes handed to the launcher.
pub fn param_bytes<T: KernelParams>(params: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts((params as *const T).cast::<u8>(), size_of::<T>()) }
}

/// Reads a parameter block back out of launcher bytes.
///
/// # Errors
/// Returns `KernelLaunch` if `bytes` has the wrong length.
pub fn decode_params<T: KernelParams>(bytes: &[u8]) -> MemResult<T> {
    if bytes.len() != size_of::<T>() {
        return Err(MemError::KernelLaunch(format!(
            "parameter block is {} bytes, expected {}",
            bytes.len(),
            size_of::<T>()
        )));
    }
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}
