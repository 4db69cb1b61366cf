//! Device-to-device copies and fills, executed by device-side kernels.

use crate::context::DeviceContext;
use crate::error::{MemError, MemResult};
use crate::memory::descriptor::{MemKind, MemoryDescriptor};
use crate::memory::kernel::{
    KernelLauncher, KernelParams, MEMORY_OP_KEY, MemcpyByteParams, MemcpyParams,
    MemcpyStrideParams, MemsetParams, ModuleHandle, SG_API_MEMCPY, SG_API_MEMCPY_BYTE,
    SG_API_MEMCPY_WSTRIDE, SG_API_MEMSET, param_bytes,
};
use crate::memory::width::SizeWidth;
use crate::utils::chunks;

/// Dwords moved per `sg_api_memcpy` launch.
pub const D2D_CHUNK_DWORDS: u64 = 0x1000_0000;
/// Bytes touched per stride, byte-copy or memset launch.
pub const KERNEL_CHUNK: u64 = 0x4000_0000;

const DWORD: u64 = 4;

/// The memory-op module, loaded once for all launches of one operation.
struct MemoryOps<'a> {
    ctx: &'a DeviceContext,
    kernels: &'a dyn KernelLauncher,
    module: ModuleHandle,
}

impl<'a> MemoryOps<'a> {
    fn load(ctx: &'a DeviceContext) -> MemResult<Self> {
        let kernels = ctx.kernels()?;
        let module = kernels.load_module(&ctx.config().kernel_module, MEMORY_OP_KEY)?;
        Ok(Self {
            ctx,
            kernels,
            module,
        })
    }

    fn launch<P: KernelParams>(&self, function: &str, params: &P) -> MemResult<()> {
        log::trace!("dev {}: launch {function}", self.ctx.dev_id());
        self.kernels.launch(self.module, function, param_bytes(params))
    }
}

fn to_i32(value: u64, what: &str) -> MemResult<i32> {
    i32::try_from(value)
        .map_err(|_| MemError::InvalidArgument(format!("{what} {value} exceeds i32")))
}

/// Checks kind and window of `mem` and that `offset + len` stays inside it.
fn device_span<W: SizeWidth>(
    ctx: &DeviceContext,
    mem: &MemoryDescriptor<W>,
    offset: u64,
    len: u64,
    op: &str,
) -> MemResult<u64> {
    ctx.expect_kind(mem, MemKind::Device, op)?;
    ctx.check_range(mem.raw_addr(), mem.size_u64())?;
    match offset.checked_add(len) {
        Some(end) if end <= mem.size_u64() => Ok(mem.raw_addr() + offset),
        _ => {
            log::error!(
                "{op}: 0x{offset:x}+0x{len:x} exceeds device buffer of 0x{:x}",
                mem.size_u64()
            );
            Err(MemError::InvalidArgument(format!(
                "{op}: range exceeds the 0x{:x}-byte device buffer",
                mem.size_u64()
            )))
        }
    }
}

// ===============================================================================================
// Copies
// ===============================================================================================

/// Copies `len_dwords` 4-byte words from `src + src_offset` to `dst + dst_offset`.
///
/// Offsets are in bytes.
///
/// # Errors
/// `InvalidArgument` if either range exceeds its buffer, `RangeInvalid` for out-of-window
/// buffers, `NotSupported` without a kernel launcher, or a launch failure.
pub fn memcpy_d2d<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &MemoryDescriptor<W>,
    dst_offset: u64,
    src: &MemoryDescriptor<W>,
    src_offset: u64,
    len_dwords: u64,
) -> MemResult<()> {
    let bytes = len_dwords
        .checked_mul(DWORD)
        .ok_or_else(|| MemError::InvalidArgument(format!("{len_dwords} dwords overflows")))?;
    let dst_addr = device_span(ctx, dst, dst_offset, bytes, "memcpy_d2d")?;
    let src_addr = device_span(ctx, src, src_offset, bytes, "memcpy_d2d")?;
    if len_dwords == 0 {
        return Ok(());
    }

    let ops = MemoryOps::load(ctx)?;
    for (off, count) in chunks(len_dwords, D2D_CHUNK_DWORDS) {
        let nstride = to_i32(count, "dword count")?;
        let params = MemcpyParams {
            src_global_offset: src_addr + off * DWORD,
            dst_global_offset: dst_addr + off * DWORD,
            n: 1,
            src_nstride: nstride,
            dst_nstride: nstride,
            count: nstride,
        };
        ops.launch(SG_API_MEMCPY, &params)?;
    }
    Ok(())
}

/// Copies `count` elements of `format_size` bytes, reading every `src_stride`-th element of
/// `src` and writing every `dst_stride`-th element of `dst`.
///
/// Supported shapes: `dst_stride == 1` with any `src_stride`, or byte elements widened with
/// `dst_stride == 4, src_stride == 1`.
///
/// # Errors
/// `InvalidArgument` for an unsupported shape or a buffer too small for `count` elements;
/// otherwise as [`memcpy_d2d`].
pub fn memcpy_d2d_stride<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &MemoryDescriptor<W>,
    dst_stride: u64,
    src: &MemoryDescriptor<W>,
    src_stride: u64,
    count: u64,
    format_size: u32,
) -> MemResult<()> {
    let widening = dst_stride == 4 && src_stride == 1 && format_size == 1;
    if src_stride < 1 || (dst_stride != 1 && !widening) {
        log::error!("stride not supported, dst_stride:{dst_stride}, src_stride:{src_stride}");
        return Err(MemError::InvalidArgument(format!(
            "stride {src_stride} -> {dst_stride} is not supported"
        )));
    }
    if !matches!(format_size, 1 | 2 | 4) {
        log::error!("format_size only support 1/2/4, not support {format_size}");
        return Err(MemError::InvalidArgument(format!("format size {format_size}")));
    }
    let fmt = u64::from(format_size);

    let span = |stride: u64| {
        count
            .checked_mul(stride)
            .and_then(|n| n.checked_mul(fmt))
            .ok_or_else(|| MemError::InvalidArgument("strided span overflows".into()))
    };
    let dst_addr = device_span(ctx, dst, 0, span(dst_stride)?, "memcpy_d2d_stride")?;
    let src_addr = device_span(ctx, src, 0, span(src_stride)?, "memcpy_d2d_stride")?;
    if count == 0 {
        return Ok(());
    }

    let per_launch = KERNEL_CHUNK / dst_stride.max(src_stride) / fmt;
    if per_launch == 0 {
        return Err(MemError::InvalidArgument(format!(
            "stride {} of {fmt}-byte elements spans more than one launch",
            dst_stride.max(src_stride)
        )));
    }
    let src_stride_i = to_i32(src_stride, "stride")?;
    let dst_stride_i = to_i32(dst_stride, "stride")?;

    let ops = MemoryOps::load(ctx)?;
    for (first, n) in chunks(count, per_launch) {
        let params = MemcpyStrideParams {
            src_addr: src_addr + first * src_stride * fmt,
            dst_addr: dst_addr + first * dst_stride * fmt,
            src_stride: src_stride_i,
            dst_stride: dst_stride_i,
            count: to_i32(n, "count")?,
            format_size: format_size as i32,
        };
        ops.launch(SG_API_MEMCPY_WSTRIDE, &params)?;
    }
    Ok(())
}

/// Copies `size` bytes from `src + src_offset` to `dst + dst_offset` at byte granularity.
///
/// # Errors
/// As [`memcpy_d2d`].
pub fn memcpy_d2d_byte<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &MemoryDescriptor<W>,
    dst_offset: u64,
    src: &MemoryDescriptor<W>,
    src_offset: u64,
    size: u64,
) -> MemResult<()> {
    let dst_addr = device_span(ctx, dst, dst_offset, size, "memcpy_d2d_byte")?;
    let src_addr = device_span(ctx, src, src_offset, size, "memcpy_d2d_byte")?;
    if size == 0 {
        return Ok(());
    }

    let ops = MemoryOps::load(ctx)?;
    for (off, len) in chunks(size, KERNEL_CHUNK) {
        let params = MemcpyByteParams {
            src_addr: src_addr + off,
            dst_addr: dst_addr + off,
            size: len,
        };
        ops.launch(SG_API_MEMCPY_BYTE, &params)?;
    }
    Ok(())
}

// ===============================================================================================
// Fill
// ===============================================================================================

/// Fills `mem` with the low `mode` bytes of `value` (little-endian), repeated.
///
/// # Errors
/// `InvalidArgument` if `mode` is not 1..=4 or does not divide the buffer size; otherwise as
/// [`memcpy_d2d`].
pub fn memset_device_ext<W: SizeWidth>(
    ctx: &DeviceContext,
    value: u32,
    mode: u32,
    mem: &MemoryDescriptor<W>,
) -> MemResult<()> {
    if !(1..=4).contains(&mode) {
        log::error!("input wrong memset mode = {mode}");
        return Err(MemError::InvalidArgument(format!("memset mode {mode}")));
    }
    let size = mem.size_u64();
    if size % u64::from(mode) != 0 {
        log::error!("memset mode {mode} is mismatch with size {size}");
        return Err(MemError::InvalidArgument(format!(
            "memset mode {mode} does not divide size {size}"
        )));
    }
    let addr = device_span(ctx, mem, 0, size, "memset")?;
    if size == 0 {
        return Ok(());
    }

    let pattern = match mode {
        4 => value,
        m => value & ((1u32 << (8 * m)) - 1),
    };
    // Every launch must start on a pattern boundary.
    let chunk = KERNEL_CHUNK / u64::from(mode) * u64::from(mode);
    let ops = MemoryOps::load(ctx)?;
    for (off, len) in chunks(size, chunk) {
        let params = MemsetParams {
            global_offset: addr + off,
            height: 1,
            width: len as u32,
            mode: mode as i32,
            value: pattern as i32,
        };
        ops.launch(SG_API_MEMSET, &params)?;
    }
    Ok(())
}

/// Fills `mem` with the 4-byte `value`.
///
/// # Errors
/// As [`memset_device_ext`].
pub fn memset_device<W: SizeWidth>(
    ctx: &DeviceContext,
    value: u32,
    mem: &MemoryDescriptor<W>,
) -> MemResult<()> {
    memset_device_ext(ctx, value, 4, mem)
}
