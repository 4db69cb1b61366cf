//! Device buffer allocation and release.
//!
//! Every entry point funnels into [`allocate`] / [`free`]. The address-keyed pair
//! [`malloc_device_mem`] / [`free_device_mem`] additionally tracks descriptors in the context's
//! registry so callers only need to keep the address.

use crate::bmdev::ioctl::{
    ANY_HEAP_MASK, BM_MEM_TYPE_DEVICE, DeviceMemArgs, DeviceMemArgsU64, HeapStatByte,
    ION_MAX_HEAP_CNT, IonAllocationData,
};
use crate::context::{ChipModel, DeviceContext, OperatingMode};
use crate::error::{MemError, MemResult};
use crate::memory::cache;
use crate::memory::descriptor::{DeviceMemU64, MemKind, MemoryDescriptor};
use crate::memory::guard::{self, GUARD_SIZE};
use crate::memory::registry::AllocationRecord;
use crate::memory::width::SizeWidth;
use crate::profile::MemOp;
use crate::utils::align_up;

/// Lowest device address the driver ever hands out.
const GMEM_FREE_LOW: u64 = 0x1_0000_0000;
/// Highest device address accepted by the driver free path.
const GMEM_FREE_HIGH: u64 = 0x5_0000_0000;

const NEURON_WARN_SIZE: u64 = 0x4_0000_0000;

// ===============================================================================================
// Core
// ===============================================================================================

/// Allocates `size` bytes from the first heap in `heap_mask` with room.
///
/// # Errors
/// `InvalidArgument` for an empty mask, `NotSupported` if `size` does not fit `W`,
/// `OutOfMemory` when no heap in the mask has room, or a driver failure.
pub fn allocate<W: SizeWidth>(
    ctx: &DeviceContext,
    size: u64,
    heap_mask: u32,
) -> MemResult<MemoryDescriptor<W>> {
    if heap_mask == 0 {
        return Err(MemError::InvalidArgument("heap mask is empty".into()));
    }

    // 1. Round and check the logical size
    let size = if ctx.chip() == ChipModel::Bm1682 && !ctx.is_simulated() {
        align_up(size, 4)
    } else {
        size
    };
    let logical = W::from_u64(size).ok_or_else(|| {
        log::error!("malloc device size 0x{size:x} does not fit a {} descriptor", W::NAME);
        MemError::NotSupported(format!("size 0x{size:x} exceeds {} descriptor", W::NAME))
    })?;
    let request = if ctx.config().mem_guard {
        size.checked_add(GUARD_SIZE)
            .ok_or_else(|| MemError::InvalidArgument(format!("size 0x{size:x} overflows")))?
    } else {
        size
    };

    // 2. Ask the driver
    ctx.profile(|p| p.mem_begin());
    let mut args = IonAllocationData {
        len: request,
        heap_id_mask: heap_mask,
        ..Default::default()
    };
    ctx.backend().alloc_gmem(&mut args).map_err(|e| {
        log::error!(
            "alloc gmem failed, dev_id = {}, size = 0x{request:x}: {e}",
            ctx.dev_id()
        );
        MemError::from_driver("alloc gmem", e)
    })?;
    let mem =
        MemoryDescriptor::from_device(args.paddr, logical).with_allocation(args.heap_id, args.fd);
    ctx.profile(|p| p.mem_end(MemOp::Alloc, args.paddr, request));

    // 3. Fresh SoC memory may still be cached on the host side
    if ctx.mode() == OperatingMode::Soc
        && !ctx.is_simulated()
        && let Err(e) = cache::invalidate_range(ctx, args.paddr, request)
    {
        log::warn!("invalidate of new buffer 0x{:x} failed: {e}", args.paddr);
    }

    // 4. Guard trailer
    if ctx.config().mem_guard
        && let Err(e) = guard::write_guard(ctx, args.paddr, size)
    {
        log::warn!("mem guard set data failed! addr=0x{:x}, size={size}: {e}", args.paddr);
    }

    log::debug!(
        "dev {}: alloc 0x{size:x} bytes at 0x{:x} (heap {}, fd {})",
        ctx.dev_id(),
        args.paddr,
        args.heap_id,
        args.fd
    );
    Ok(mem)
}

/// Releases a buffer returned by [`allocate`] or any `malloc_*` entry point.
///
/// # Errors
/// `TypeMismatch` under strict checking, `GuardCorruption` when the guard policy returns errors,
/// `RangeInvalid` for addresses the driver never hands out, `InvalidHandle` or `NotFound` for
/// buffers already released, or a driver failure.
pub fn free<W: SizeWidth>(ctx: &DeviceContext, mem: &MemoryDescriptor<W>) -> MemResult<()> {
    ctx.expect_kind(mem, MemKind::Device, "free")?;
    let addr = mem.raw_addr();
    let size = mem.size_u64();

    // 1. Guard trailer
    let release = if ctx.config().mem_guard {
        guard::check_guard(ctx, addr, size)?;
        size + GUARD_SIZE
    } else {
        size
    };
    let narrow_release = if W::WIDE {
        None
    } else {
        Some(u32::try_from(release).map_err(|_| {
            MemError::NotSupported(format!("size 0x{release:x} exceeds u32 descriptor"))
        })?)
    };

    // 2. Address plausibility
    if !ctx.is_simulated() && !(GMEM_FREE_LOW..=GMEM_FREE_HIGH).contains(&addr) {
        log::error!("free gmem addr 0x{addr:x} is invalid");
        return Err(MemError::RangeInvalid { addr, size });
    }

    // 3. Buffer-sharing handle, then the heap block
    if mem.dmabuf_fd() >= 0 {
        ctx.backend()
            .close_dmabuf(mem.dmabuf_fd())
            .map_err(|e| MemError::from_driver("close dmabuf", e))?;
    }

    let flags = DeviceMemArgs::pack_flags(BM_MEM_TYPE_DEVICE, mem.heap_id());
    let fd = mem.dmabuf_fd();
    ctx.profile(|p| p.mem_begin());
    let freed = match narrow_release {
        Some(size) => {
            let mut args = DeviceMemArgs {
                device_addr: addr,
                dmabuf_fd: fd,
                flags,
                size,
                ..Default::default()
            };
            ctx.backend().free_gmem(&mut args)
        }
        None => {
            let mut args = DeviceMemArgsU64 {
                device_addr: addr,
                dmabuf_fd: fd,
                flags,
                size: release,
                ..Default::default()
            };
            ctx.backend().free_gmem_u64(&mut args)
        }
    };
    freed.map_err(|e| match e.raw_os_error() {
        Some(libc::ENOENT) => MemError::NotFound(addr),
        _ => MemError::from_driver("free gmem", e),
    })?;
    ctx.profile(|p| p.mem_end(MemOp::Free, addr, release));

    log::debug!("dev {}: free 0x{size:x} bytes at 0x{addr:x}", ctx.dev_id());
    Ok(())
}

// ===============================================================================================
// Descriptor-keyed Entry Points
// ===============================================================================================

/// # Errors
/// As [`allocate`].
pub fn malloc_device_byte<W: SizeWidth>(
    ctx: &DeviceContext,
    size: u64,
) -> MemResult<MemoryDescriptor<W>> {
    allocate(ctx, size, ANY_HEAP_MASK)
}

/// # Errors
/// As [`allocate`], plus `InvalidArgument` for a heap id with no mask bit.
pub fn malloc_device_byte_heap<W: SizeWidth>(
    ctx: &DeviceContext,
    heap_id: u32,
    size: u64,
) -> MemResult<MemoryDescriptor<W>> {
    allocate(ctx, size, heap_mask_of(heap_id)?)
}

/// # Errors
/// As [`allocate`].
pub fn malloc_device_byte_heap_mask<W: SizeWidth>(
    ctx: &DeviceContext,
    heap_mask: u32,
    size: u64,
) -> MemResult<MemoryDescriptor<W>> {
    allocate(ctx, size, heap_mask)
}

/// Allocates an `n*c*h*w` tensor of 4-byte elements.
///
/// # Errors
/// As [`allocate`]; `InvalidArgument` if the shape overflows.
pub fn malloc_neuron_device<W: SizeWidth>(
    ctx: &DeviceContext,
    n: u64,
    c: u64,
    h: u64,
    w: u64,
) -> MemResult<MemoryDescriptor<W>> {
    let size = [c, h, w, 4]
        .into_iter()
        .try_fold(n, u64::checked_mul)
        .ok_or_else(|| MemError::InvalidArgument("neuron shape overflows".into()))?;
    if size >= NEURON_WARN_SIZE {
        log::warn!("malloc neuron device size 0x{size:x} is 16GiB or more");
    }
    allocate(ctx, size, ANY_HEAP_MASK)
}

/// Allocates `count` 4-byte words.
///
/// # Errors
/// As [`allocate`]; `InvalidArgument` if the size overflows.
pub fn malloc_device_dword<W: SizeWidth>(
    ctx: &DeviceContext,
    count: u64,
) -> MemResult<MemoryDescriptor<W>> {
    let size = count
        .checked_mul(4)
        .ok_or_else(|| MemError::InvalidArgument("dword count overflows".into()))?;
    allocate(ctx, size, ANY_HEAP_MASK)
}

/// # Errors
/// As [`free`].
pub fn free_device<W: SizeWidth>(ctx: &DeviceContext, mem: &MemoryDescriptor<W>) -> MemResult<()> {
    free(ctx, mem)
}

// ===============================================================================================
// Address-keyed Entry Points
// ===============================================================================================

fn heap_mask_of(heap_id: u32) -> MemResult<u32> {
    1u32.checked_shl(heap_id)
        .ok_or_else(|| MemError::InvalidArgument(format!("heap id {heap_id}")))
}

/// Allocates from `heap_id` and records the buffer so it can be freed by address.
///
/// # Errors
/// As [`allocate`].
pub fn malloc_device_mem(ctx: &DeviceContext, heap_id: u32, size: u64) -> MemResult<u64> {
    malloc_device_mem_mask(ctx, heap_mask_of(heap_id)?, size)
}

/// Allocates from any heap in `heap_mask` and records the buffer so it can be freed by address.
///
/// # Errors
/// As [`allocate`].
pub fn malloc_device_mem_mask(ctx: &DeviceContext, heap_mask: u32, size: u64) -> MemResult<u64> {
    let descriptor: DeviceMemU64 = allocate(ctx, size, heap_mask)?;
    let address = descriptor.raw_addr();
    if !ctx.registry().insert(AllocationRecord {
        address,
        descriptor,
    }) {
        if let Err(e) = free(ctx, &descriptor) {
            log::warn!("releasing duplicate 0x{address:x} failed: {e}");
        }
        return Err(MemError::Driver(format!(
            "address 0x{address:x} is already tracked"
        )));
    }
    Ok(address)
}

/// Releases a buffer returned by [`malloc_device_mem`].
///
/// # Errors
/// `NotFound` for addresses not tracked by this context; otherwise as [`free`]. A buffer whose
/// guard check fails stays tracked.
pub fn free_device_mem(ctx: &DeviceContext, addr: u64) -> MemResult<()> {
    let Some(record) = ctx.registry().remove(addr) else {
        log::warn!("free_device_mem: 0x{addr:x} is not a tracked allocation");
        return Err(MemError::NotFound(addr));
    };
    match free(ctx, &record.descriptor) {
        Err(e @ MemError::GuardCorruption { .. }) => {
            ctx.registry().insert(record);
            Err(e)
        }
        other => other,
    }
}

// ===============================================================================================
// Heap Queries
// ===============================================================================================

/// Heap that backs `mem`.
///
/// # Errors
/// `TypeMismatch`/`RangeInvalid` for unsuitable descriptors, `InvalidArgument` for an
/// out-of-range heap id on hardware.
pub fn get_gmem_heap_id<W: SizeWidth>(
    ctx: &DeviceContext,
    mem: &MemoryDescriptor<W>,
) -> MemResult<u32> {
    if mem.kind() != MemKind::Device {
        log::error!("get_gmem_heap_id: mem type is illegal");
        return Err(MemError::TypeMismatch {
            expected: MemKind::Device,
            found: mem.kind(),
        });
    }
    ctx.check_range(mem.raw_addr(), mem.size_u64())?;
    if ctx.is_simulated() {
        return Ok(0);
    }
    let heap_id = mem.heap_id();
    if heap_id > ION_MAX_HEAP_CNT {
        log::error!("heap id {heap_id} is illegal");
        return Err(MemError::InvalidArgument(format!("heap id {heap_id}")));
    }
    Ok(heap_id)
}

/// # Errors
/// Driver failure.
pub fn total_heap_num(ctx: &DeviceContext) -> MemResult<u32> {
    ctx.backend()
        .heap_num()
        .map_err(|e| MemError::from_driver("get heap num", e))
}

/// # Errors
/// `InvalidArgument` for an unknown heap, or a driver failure.
pub fn heap_stat_byte_by_id(ctx: &DeviceContext, heap_id: u32) -> MemResult<HeapStatByte> {
    let heap_num = total_heap_num(ctx)?;
    if heap_id >= heap_num {
        return Err(MemError::InvalidArgument(format!(
            "heap id {heap_id} of {heap_num}"
        )));
    }
    let mut stat = HeapStatByte {
        heap_id,
        ..Default::default()
    };
    ctx.backend()
        .heap_stat(&mut stat)
        .map_err(|e| MemError::from_driver("get heap stat", e))?;
    Ok(stat)
}

/// # Errors
/// Driver failure.
pub fn total_gmem(ctx: &DeviceContext) -> MemResult<u64> {
    ctx.backend()
        .total_gmem()
        .map_err(|e| MemError::from_driver("total gmem", e))
}

/// # Errors
/// Driver failure.
pub fn avail_gmem(ctx: &DeviceContext) -> MemResult<u64> {
    ctx.backend()
        .avail_gmem()
        .map_err(|e| MemError::from_driver("avail gmem", e))
}
