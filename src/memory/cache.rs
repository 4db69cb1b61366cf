//! Invalidate/flush of device memory ranges.
//!
//! The driver takes a single `u64`: the cache-line index of the start address in the high 32 bits,
//! and the length plus the start's offset within its line in the low 32 bits.

use crate::context::DeviceContext;
use crate::error::{MemError, MemResult};
use crate::memory::descriptor::{MemKind, MemoryDescriptor};
use crate::memory::width::SizeWidth;
use crate::profile::MemOp;
use crate::utils::chunks;

pub const CACHE_LINE_SIZE: u64 = 64;

// Keeps `len + line_offset` inside the low 32 bits of the packed word.
const CACHE_OP_CHUNK: u64 = 1 << 31;

/// One cache maintenance request, before packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSpan {
    pub line_addr: u64,
    pub len: u32,
    pub line_offset: u32,
}

impl CacheSpan {
    /// Returns `None` if `len` plus the sub-line offset does not fit 32 bits.
    #[must_use]
    pub fn new(addr: u64, len: u64) -> Option<Self> {
        let line_offset = addr & (CACHE_LINE_SIZE - 1);
        let low = u32::try_from(len.checked_add(line_offset)?).ok()?;
        Some(Self {
            line_addr: addr & !(CACHE_LINE_SIZE - 1),
            len: low - line_offset as u32,
            line_offset: line_offset as u32,
        })
    }

    #[must_use]
    pub const fn pack(self) -> u64 {
        ((self.line_addr >> 6) << 32) + self.len as u64 + self.line_offset as u64
    }
}

#[derive(Clone, Copy)]
enum CacheOp {
    Invalidate,
    Flush,
}

impl CacheOp {
    const fn name(self) -> &'static str {
        match self {
            Self::Invalidate => "invalidate",
            Self::Flush => "flush",
        }
    }

    const fn mem_op(self) -> MemOp {
        match self {
            Self::Invalidate => MemOp::Invalidate,
            Self::Flush => MemOp::Flush,
        }
    }
}

fn maintain(ctx: &DeviceContext, op: CacheOp, addr: u64, size: u64) -> MemResult<()> {
    if ctx.is_simulated() {
        return Ok(());
    }
    ctx.require_soc_like(op.name())?;
    ctx.check_range(addr, size)?;

    ctx.profile(|p| p.mem_begin());
    for (off, len) in chunks(size, CACHE_OP_CHUNK) {
        let span = CacheSpan::new(addr + off, len)
            .ok_or_else(|| MemError::InvalidArgument(format!("{} length 0x{len:x}", op.name())))?;
        log::trace!("{} 0x{:x}+0x{len:x}", op.name(), addr + off);
        let res = match op {
            CacheOp::Invalidate => ctx.backend().invalidate(span.pack()),
            CacheOp::Flush => ctx.backend().flush(span.pack()),
        };
        res.map_err(|e| MemError::from_driver(op.name(), e))?;
    }
    ctx.profile(|p| p.mem_end(op.mem_op(), addr, size));
    Ok(())
}

pub(crate) fn invalidate_range(ctx: &DeviceContext, addr: u64, size: u64) -> MemResult<()> {
    maintain(ctx, CacheOp::Invalidate, addr, size)
}

pub(crate) fn flush_range(ctx: &DeviceContext, addr: u64, size: u64) -> MemResult<()> {
    maintain(ctx, CacheOp::Flush, addr, size)
}

fn partial_range<W: SizeWidth>(
    ctx: &DeviceContext,
    mem: &MemoryDescriptor<W>,
    offset: u64,
    len: u64,
) -> MemResult<u64> {
    ctx.expect_kind(mem, MemKind::Device, "cache maintenance")?;
    match offset.checked_add(len) {
        Some(end) if end <= mem.size_u64() => Ok(mem.raw_addr() + offset),
        _ => Err(MemError::InvalidArgument(format!(
            "range 0x{offset:x}+0x{len:x} exceeds buffer of 0x{:x}",
            mem.size_u64()
        ))),
    }
}

/// Invalidates the cached view of a whole device buffer.
///
/// # Errors
/// `UnsupportedMode` in PCIe mode, `RangeInvalid` outside the chip's windows, or a driver error.
pub fn invalidate_device_mem<W: SizeWidth>(
    ctx: &DeviceContext,
    mem: &MemoryDescriptor<W>,
) -> MemResult<()> {
    invalidate_device_mem_partial(ctx, mem, 0, mem.size_u64())
}

/// # Errors
/// As [`invalidate_device_mem`], plus `InvalidArgument` when the range leaves the buffer.
pub fn invalidate_device_mem_partial<W: SizeWidth>(
    ctx: &DeviceContext,
    mem: &MemoryDescriptor<W>,
    offset: u64,
    len: u64,
) -> MemResult<()> {
    let addr = partial_range(ctx, mem, offset, len)?;
    invalidate_range(ctx, addr, len)
}

/// Writes back cached host writes to a whole device buffer.
///
/// # Errors
/// `UnsupportedMode` in PCIe mode, `RangeInvalid` outside the chip's windows, or a driver error.
pub fn flush_device_mem<W: SizeWidth>(
    ctx: &DeviceContext,
    mem: &MemoryDescriptor<W>,
) -> MemResult<()> {
    flush_device_mem_partial(ctx, mem, 0, mem.size_u64())
}

/// # Errors
/// As [`flush_device_mem`], plus `InvalidArgument` when the range leaves the buffer.
pub fn flush_device_mem_partial<W: SizeWidth>(
    ctx: &DeviceContext,
    mem: &MemoryDescriptor<W>,
    offset: u64,
    len: u64,
) -> MemResult<()> {
    let addr = partial_range(ctx, mem, offset, len)?;
    flush_range(ctx, addr, len)
}
