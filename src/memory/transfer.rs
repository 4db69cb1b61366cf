//! Host/device copies and the strategy that carries each one.
//!
//! | mode  | host -> device         | device -> host                              |
//! |-------|------------------------|---------------------------------------------|
//! | PCIe  | DMA ioctl              | DMA ioctl                                   |
//! | SoC   | DMA ioctl              | mmap fast path, DMA for small/unaligned head |
//! | Mixed | mmap + memcpy + flush  | mmap + invalidate + memcpy                  |
//!
//! DMA copies are split into fixed-size chunks issued in address order; the first failing chunk
//! fails the whole copy.

use crate::bmdev::ioctl::{
    BMLIB_NOT_USE_IOMMU, CHIP2CHIP, CHIP2HOST, HOST2CHIP, MemcpyInfo, MemcpyP2pInfo,
};
use crate::context::{DeviceContext, OperatingMode};
use crate::error::{MemError, MemResult};
use crate::memory::allocator;
use crate::memory::cache;
use crate::memory::descriptor::{MemKind, MemoryDescriptor};
use crate::memory::mapping;
use crate::memory::router::{self, CdmaEngine};
use crate::memory::validator;
use crate::memory::width::SizeWidth;
use crate::utils::{PAGE_SIZE, chunks};

/// Largest single DMA request on the regular copy path.
pub const MEMCPY_CHUNK: u64 = 0x1000_0000;
/// Largest single DMA request on the SMMU-backed poll path.
pub const SMMU_CHUNK: u64 = 0x80_0000;

/// How a device-to-host copy is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One or more DMA ioctls.
    Normal,
    /// mmap, invalidate, memcpy.
    Fast,
    /// DMA for the unaligned head, fast path for the page-aligned rest.
    Split,
    /// mmap of the enclosing pages plus cache maintenance.
    Mix,
}

#[must_use]
pub const fn s2d_strategy(mode: OperatingMode) -> Strategy {
    match mode {
        OperatingMode::Pcie | OperatingMode::Soc => Strategy::Normal,
        OperatingMode::Mixed => Strategy::Mix,
    }
}

#[must_use]
pub const fn d2s_strategy(mode: OperatingMode, addr: u64, size: u64) -> Strategy {
    match mode {
        OperatingMode::Pcie => Strategy::Normal,
        OperatingMode::Mixed => Strategy::Mix,
        OperatingMode::Soc => {
            if validator::page_aligned(addr) {
                Strategy::Fast
            } else if size <= PAGE_SIZE {
                Strategy::Normal
            } else {
                Strategy::Split
            }
        }
    }
}

// ===============================================================================================
// DMA Path
// ===============================================================================================

#[derive(Debug, Clone, Copy)]
struct Dma {
    dir: u32,
    intr: bool,
    chunk: u64,
}

impl Dma {
    fn new(ctx: &DeviceContext, dir: u32) -> Self {
        Self {
            dir,
            intr: ctx.config().use_interrupt,
            chunk: MEMCPY_CHUNK,
        }
    }

    const fn poll(mut self) -> Self {
        self.intr = false;
        self
    }

    const fn chunk(mut self, chunk: u64) -> Self {
        self.chunk = chunk;
        self
    }

    /// # Safety
    /// `host` must be valid for `size` bytes in the direction of the copy.
    unsafe fn run(
        self,
        ctx: &DeviceContext,
        host: *mut u8,
        device: u64,
        size: u64,
    ) -> MemResult<()> {
        let op = if self.dir == HOST2CHIP { "memcpy s2d" } else { "memcpy d2s" };
        for (off, len) in chunks(size, self.chunk) {
            let mut info = MemcpyInfo {
                host_addr: host as usize as u64 + off,
                device_addr: device + off,
                src_device_addr: 0,
                size: len,
                dir: self.dir,
                intr: self.intr,
                cdma_iommu_mode: ctx.config().cdma_iommu_mode,
            };
            log::trace!("{op}: device 0x{:x} size 0x{len:x}", info.device_addr);

            ctx.profile(|p| p.memcpy_begin());
            let res = unsafe { ctx.backend().memcpy(&mut info) };
            ctx.profile(|p| p.memcpy_end(info.host_addr, info.device_addr, len, self.dir));
            res.map_err(|e| MemError::from_driver(op, e))?;
        }
        Ok(())
    }

    fn to_device(self, ctx: &DeviceContext, device: u64, src: &[u8]) -> MemResult<()> {
        // The driver only reads through the pointer for HOST2CHIP.
        unsafe { self.run(ctx, src.as_ptr().cast_mut(), device, src.len() as u64) }
    }

    fn to_host(self, ctx: &DeviceContext, dst: &mut [u8], device: u64) -> MemResult<()> {
        unsafe { self.run(ctx, dst.as_mut_ptr(), device, dst.len() as u64) }
    }
}

// ===============================================================================================
// Mapped Paths
// ===============================================================================================

fn d2s_fast(ctx: &DeviceContext, dst: &mut [u8], addr: u64) -> MemResult<()> {
    if dst.is_empty() {
        return Ok(());
    }
    let size = dst.len() as u64;
    let map = mapping::map_device_range(ctx, addr, size)?;
    cache::invalidate_range(ctx, addr, size)?;
    dst.copy_from_slice(map.as_slice());
    map.unmap()
}

fn d2s_mix(ctx: &DeviceContext, dst: &mut [u8], addr: u64) -> MemResult<()> {
    if dst.is_empty() {
        return Ok(());
    }
    let size = dst.len() as u64;
    let map = mapping::map_device_range_mix(ctx, addr, size)?;
    cache::invalidate_range(ctx, addr, size)?;
    dst.copy_from_slice(map.as_slice());
    map.unmap()
}

fn s2d_mix(ctx: &DeviceContext, addr: u64, src: &[u8]) -> MemResult<()> {
    if src.is_empty() {
        return Ok(());
    }
    let size = src.len() as u64;
    let mut map = mapping::map_device_range_mix(ctx, addr, size)?;
    map.as_mut_slice().copy_from_slice(src);
    cache::flush_range(ctx, addr, size)?;
    map.unmap()
}

// ===============================================================================================
// Raw Dispatch
// ===============================================================================================

/// Copies `src` to device address `addr` using the strategy of the current mode.
pub(crate) fn write_device(ctx: &DeviceContext, addr: u64, src: &[u8]) -> MemResult<()> {
    let size = src.len() as u64;
    ctx.check_range(addr, size)?;
    let strategy = s2d_strategy(ctx.mode());
    log::trace!("s2d 0x{addr:x}+0x{size:x} via {strategy:?}");
    match strategy {
        Strategy::Mix => s2d_mix(ctx, addr, src),
        _ => Dma::new(ctx, HOST2CHIP).to_device(ctx, addr, src),
    }
}

/// Fills `dst` from device address `addr` using the strategy of the current mode.
pub(crate) fn read_device(ctx: &DeviceContext, dst: &mut [u8], addr: u64) -> MemResult<()> {
    let size = dst.len() as u64;
    ctx.check_range(addr, size)?;
    let strategy = d2s_strategy(ctx.mode(), addr, size);
    log::trace!("d2s 0x{addr:x}+0x{size:x} via {strategy:?}");
    match strategy {
        Strategy::Normal => Dma::new(ctx, CHIP2HOST).to_host(ctx, dst, addr),
        Strategy::Fast => d2s_fast(ctx, dst, addr),
        Strategy::Mix => d2s_mix(ctx, dst, addr),
        Strategy::Split => {
            let head = PAGE_SIZE - (addr & (PAGE_SIZE - 1));
            let aligned = (addr + PAGE_SIZE) & !(PAGE_SIZE - 1);
            let (head_buf, rest) = dst.split_at_mut(head as usize);
            Dma::new(ctx, CHIP2HOST).to_host(ctx, head_buf, addr)?;
            d2s_fast(ctx, rest, aligned)
        }
    }
}

// ===============================================================================================
// Argument Checks
// ===============================================================================================

fn host_len(have: usize, need: u64, what: &str) -> MemResult<usize> {
    match usize::try_from(need) {
        Ok(n) if n <= have => Ok(n),
        _ => Err(MemError::InvalidArgument(format!(
            "{what} buffer of 0x{have:x} bytes is shorter than 0x{need:x}"
        ))),
    }
}

/// Device address of `[offset, offset + size)` inside `mem`.
fn sub_range<W: SizeWidth>(mem: &MemoryDescriptor<W>, offset: u64, size: u64) -> MemResult<u64> {
    match offset.checked_add(size) {
        Some(end) if end <= mem.size_u64() => Ok(mem.raw_addr() + offset),
        _ => {
            log::error!(
                "range 0x{offset:x}+0x{size:x} exceeds device buffer of 0x{:x}",
                mem.size_u64()
            );
            Err(MemError::InvalidArgument(format!(
                "range 0x{offset:x}+0x{size:x} exceeds device buffer of 0x{:x}",
                mem.size_u64()
            )))
        }
    }
}

// ===============================================================================================
// Host <-> Device
// ===============================================================================================

/// Copies the first `dst.size()` bytes of `src` into the device buffer.
///
/// # Errors
/// `InvalidArgument` if `src` is too short, `RangeInvalid`, or a driver failure.
pub fn memcpy_s2d<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &MemoryDescriptor<W>,
    src: &[u8],
) -> MemResult<()> {
    ctx.expect_kind(dst, MemKind::Device, "memcpy_s2d")?;
    let n = host_len(src.len(), dst.size_u64(), "source")?;
    write_device(ctx, dst.raw_addr(), &src[..n])
}

/// Fills the first `src.size()` bytes of `dst` from the device buffer.
///
/// # Errors
/// `InvalidArgument` if `dst` is too short, `RangeInvalid`, `UnsupportedMode`, or a driver failure.
pub fn memcpy_d2s<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &mut [u8],
    src: &MemoryDescriptor<W>,
) -> MemResult<()> {
    ctx.expect_kind(src, MemKind::Device, "memcpy_d2s")?;
    let n = host_len(dst.len(), src.size_u64(), "destination")?;
    read_device(ctx, &mut dst[..n], src.raw_addr())
}

/// Host-to-device DMA with polled completion, regardless of mode.
///
/// # Errors
/// As [`memcpy_s2d`].
pub fn memcpy_s2d_poll<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &MemoryDescriptor<W>,
    src: &[u8],
) -> MemResult<()> {
    ctx.expect_kind(dst, MemKind::Device, "memcpy_s2d_poll")?;
    let n = host_len(src.len(), dst.size_u64(), "source")?;
    ctx.check_range(dst.raw_addr(), dst.size_u64())?;
    Dma::new(ctx, HOST2CHIP).poll().to_device(ctx, dst.raw_addr(), &src[..n])
}

/// Device-to-host DMA of the first `size` bytes with polled completion. PCIe mode only.
///
/// # Errors
/// `UnsupportedMode` outside PCIe mode; otherwise as [`memcpy_d2s`].
pub fn memcpy_d2s_poll<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &mut [u8],
    src: &MemoryDescriptor<W>,
    size: u64,
) -> MemResult<()> {
    poll_d2s(ctx, dst, src, size, MEMCPY_CHUNK, "memcpy_d2s_poll")
}

/// Host-to-device copy in 8 MiB polled chunks for SMMU-backed host memory.
///
/// # Errors
/// As [`memcpy_s2d`].
pub fn smmu_s2d_poll<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &MemoryDescriptor<W>,
    src: &[u8],
) -> MemResult<()> {
    ctx.expect_kind(dst, MemKind::Device, "smmu_s2d_poll")?;
    let n = host_len(src.len(), dst.size_u64(), "source")?;
    ctx.check_range(dst.raw_addr(), dst.size_u64())?;
    Dma::new(ctx, HOST2CHIP)
        .poll()
        .chunk(SMMU_CHUNK)
        .to_device(ctx, dst.raw_addr(), &src[..n])
}

/// Device-to-host copy of the first `size` bytes in 8 MiB polled chunks. PCIe mode only.
///
/// # Errors
/// `UnsupportedMode` outside PCIe mode; otherwise as [`memcpy_d2s`].
pub fn smmu_d2s_poll<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &mut [u8],
    src: &MemoryDescriptor<W>,
    size: u64,
) -> MemResult<()> {
    poll_d2s(ctx, dst, src, size, SMMU_CHUNK, "smmu_d2s_poll")
}

fn poll_d2s<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &mut [u8],
    src: &MemoryDescriptor<W>,
    size: u64,
    chunk: u64,
    op: &'static str,
) -> MemResult<()> {
    ctx.expect_kind(src, MemKind::Device, op)?;
    let addr = sub_range(src, 0, size)?;
    let n = host_len(dst.len(), size, "destination")?;
    ctx.check_range(src.raw_addr(), src.size_u64())?;
    if ctx.mode() != OperatingMode::Pcie {
        log::error!("{op} is only supported in PCIe mode");
        return Err(MemError::UnsupportedMode {
            op,
            mode: ctx.mode().name(),
        });
    }
    Dma::new(ctx, CHIP2HOST)
        .poll()
        .chunk(chunk)
        .to_host(ctx, &mut dst[..n], addr)
}

/// Copies `size` bytes of `src` to `offset` bytes into the device buffer.
///
/// # Errors
/// `InvalidArgument` if the range leaves the buffer; otherwise as [`memcpy_s2d`].
pub fn memcpy_s2d_partial_offset<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &MemoryDescriptor<W>,
    src: &[u8],
    size: u64,
    offset: u64,
) -> MemResult<()> {
    ctx.expect_kind(dst, MemKind::Device, "memcpy_s2d_partial")?;
    let addr = sub_range(dst, offset, size)?;
    let n = host_len(src.len(), size, "source")?;
    write_device(ctx, addr, &src[..n])
}

/// # Errors
/// As [`memcpy_s2d_partial_offset`].
pub fn memcpy_s2d_partial<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &MemoryDescriptor<W>,
    src: &[u8],
    size: u64,
) -> MemResult<()> {
    memcpy_s2d_partial_offset(ctx, dst, src, size, 0)
}

/// Copies `size` bytes starting `offset` bytes into the device buffer.
///
/// # Errors
/// `InvalidArgument` if the range leaves the buffer; otherwise as [`memcpy_d2s`].
pub fn memcpy_d2s_partial_offset<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &mut [u8],
    src: &MemoryDescriptor<W>,
    size: u64,
    offset: u64,
) -> MemResult<()> {
    ctx.expect_kind(src, MemKind::Device, "memcpy_d2s_partial")?;
    let addr = sub_range(src, offset, size)?;
    let n = host_len(dst.len(), size, "destination")?;
    read_device(ctx, &mut dst[..n], addr)
}

/// # Errors
/// As [`memcpy_d2s_partial_offset`].
pub fn memcpy_d2s_partial<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &mut [u8],
    src: &MemoryDescriptor<W>,
    size: u64,
) -> MemResult<()> {
    memcpy_d2s_partial_offset(ctx, dst, src, size, 0)
}

fn check_pieces<W: SizeWidth>(
    mem: &MemoryDescriptor<W>,
    lens: impl Iterator<Item = usize>,
    op: &str,
) -> MemResult<()> {
    let total = mem.size_u64();
    let mut sum = 0u64;
    for len in lens {
        sum = sum.saturating_add(len as u64);
        if sum > total {
            log::error!("{op}: sum 0x{sum:x} exceeds total 0x{total:x}");
            return Err(MemError::InvalidArgument(format!(
                "{op}: pieces exceed the 0x{total:x}-byte device buffer"
            )));
        }
    }
    Ok(())
}

/// Copies each host piece in turn to consecutive device addresses starting at `dst`.
///
/// # Errors
/// `InvalidArgument` if the pieces together exceed `dst`; the first failing piece otherwise.
pub fn memcpy_s2d_gather<W: SizeWidth>(
    ctx: &DeviceContext,
    dst: &MemoryDescriptor<W>,
    pieces: &[&[u8]],
) -> MemResult<()> {
    ctx.expect_kind(dst, MemKind::Device, "memcpy_s2d_gather")?;
    check_pieces(dst, pieces.iter().map(|p| p.len()), "memcpy_s2d_gather")?;

    let mut addr = dst.raw_addr();
    for piece in pieces {
        write_device(ctx, addr, piece).inspect_err(|e| {
            log::error!("memcpy_s2d_gather failed at device 0x{addr:x}: {e}");
        })?;
        addr += piece.len() as u64;
    }
    Ok(())
}

/// Fills each host piece in turn from consecutive device addresses starting at `src`.
///
/// # Errors
/// `InvalidArgument` if the pieces together exceed `src`; the first failing piece otherwise.
pub fn memcpy_d2s_scatter<W: SizeWidth>(
    ctx: &DeviceContext,
    src: &MemoryDescriptor<W>,
    pieces: &mut [&mut [u8]],
) -> MemResult<()> {
    ctx.expect_kind(src, MemKind::Device, "memcpy_d2s_scatter")?;
    check_pieces(src, pieces.iter().map(|p| p.len()), "memcpy_d2s_scatter")?;

    let mut addr = src.raw_addr();
    for piece in pieces.iter_mut() {
        read_device(ctx, piece, addr).inspect_err(|e| {
            log::error!("memcpy_d2s_scatter failed at device 0x{addr:x}: {e}");
        })?;
        addr += piece.len() as u64;
    }
    Ok(())
}

// ===============================================================================================
// Device <-> Device across chips
// ===============================================================================================

/// Peer-to-peer copy of `dst.size()` bytes between two different devices.
///
/// # Errors
/// `SameChip` if both contexts are the same device; otherwise `RangeInvalid` or a driver failure.
pub fn memcpy_p2p<W: SizeWidth>(
    src_ctx: &DeviceContext,
    src: &MemoryDescriptor<W>,
    dst_ctx: &DeviceContext,
    dst: &MemoryDescriptor<W>,
) -> MemResult<()> {
    if src_ctx.is_simulated() || dst_ctx.is_simulated() {
        return Ok(());
    }
    src_ctx.check_range(src.raw_addr(), src.size_u64())?;
    dst_ctx.check_range(dst.raw_addr(), dst.size_u64())?;
    if src_ctx.dev_id() == dst_ctx.dev_id() {
        log::error!("src chip and dst chip is the same");
        return Err(MemError::SameChip(src_ctx.dev_id()));
    }

    let mut info = MemcpyP2pInfo {
        src_device_addr: src.raw_addr(),
        dst_device_addr: dst.raw_addr(),
        dst_num: dst_ctx.dev_id(),
        size: dst.size_u64(),
        intr: false,
        cdma_iommu_mode: src_ctx.config().cdma_iommu_mode,
    };
    src_ctx
        .backend()
        .memcpy_p2p(&mut info)
        .map_err(|e| MemError::from_driver("memcpy p2p", e))
}

/// CDMA copy of `src.size()` bytes between two functions of the same card.
///
/// The source device's engine runs the copy unless `force_dst_engine` is set.
///
/// # Errors
/// `NotSupported` on a simulated device, `CrossCardUnsupported`, or a driver failure.
pub fn memcpy_c2c<W: SizeWidth>(
    src_ctx: &DeviceContext,
    dst_ctx: &DeviceContext,
    src: &MemoryDescriptor<W>,
    dst: &MemoryDescriptor<W>,
    force_dst_engine: bool,
) -> MemResult<()> {
    if src_ctx.is_simulated() || dst_ctx.is_simulated() {
        return Err(MemError::NotSupported(
            "chip-to-chip copy on a simulated device".into(),
        ));
    }
    src_ctx.check_range(src.raw_addr(), src.size_u64())?;
    dst_ctx.check_range(dst.raw_addr(), dst.size_u64())?;

    let route = router::route(
        src_ctx,
        dst_ctx,
        src.raw_addr(),
        dst.raw_addr(),
        force_dst_engine,
    )?;
    let engine = match route.engine {
        CdmaEngine::Source => src_ctx,
        CdmaEngine::Destination => dst_ctx,
    };

    let mut info = MemcpyInfo {
        host_addr: 0,
        device_addr: route.dst_addr,
        src_device_addr: route.src_addr,
        size: src.size_u64(),
        dir: CHIP2CHIP,
        intr: engine.config().use_interrupt,
        cdma_iommu_mode: BMLIB_NOT_USE_IOMMU,
    };
    // No host memory is touched in CHIP2CHIP.
    unsafe { engine.backend().memcpy(&mut info) }
        .map_err(|e| MemError::from_driver("memcpy c2c", e))
}

// ===============================================================================================
// System Descriptor Conversion
// ===============================================================================================

/// # Safety
/// `sys` must point to at least `mem.size()` readable bytes.
unsafe fn upload<W: SizeWidth>(
    ctx: &DeviceContext,
    mem: MemoryDescriptor<W>,
    sys: &MemoryDescriptor<W>,
) -> MemResult<MemoryDescriptor<W>> {
    let len = usize::try_from(mem.size_u64())
        .map_err(|_| MemError::InvalidArgument("buffer larger than the address space".into()))?;
    let src = unsafe { std::slice::from_raw_parts(sys.raw_addr() as usize as *const u8, len) };
    if let Err(e) = memcpy_s2d(ctx, &mem, src) {
        log::error!("memcpy_s2d into new buffer 0x{:x} failed: {e}", mem.raw_addr());
        if let Err(free_err) = allocator::free_device(ctx, &mem) {
            log::warn!("releasing 0x{:x} failed: {free_err}", mem.raw_addr());
        }
        return Err(e);
    }
    Ok(mem)
}

fn require_system<W: SizeWidth>(sys: &MemoryDescriptor<W>) -> MemResult<()> {
    if sys.kind() != MemKind::System {
        log::error!("mem type is illegal: {:?} is not a system descriptor", sys.kind());
        return Err(MemError::InvalidArgument("expected a system descriptor".into()));
    }
    Ok(())
}

/// Allocates an `n*c*h*w` float buffer and, with `need_copy`, uploads the host data behind `sys`.
///
/// # Errors
/// `InvalidArgument` if `sys` is not a system descriptor; allocation or copy failures.
///
/// # Safety
/// With `need_copy`, `sys` must point to at least `n*c*h*w*4` readable bytes.
pub unsafe fn convert_system_to_device_neuron<W: SizeWidth>(
    ctx: &DeviceContext,
    sys: &MemoryDescriptor<W>,
    need_copy: bool,
    n: u64,
    c: u64,
    h: u64,
    w: u64,
) -> MemResult<MemoryDescriptor<W>> {
    require_system(sys)?;
    let mem = allocator::malloc_neuron_device(ctx, n, c, h, w)?;
    if !need_copy {
        return Ok(mem);
    }
    unsafe { upload(ctx, mem, sys) }
}

/// Byte-sized variant of [`convert_system_to_device_neuron`].
///
/// # Errors
/// As [`convert_system_to_device_neuron`].
///
/// # Safety
/// With `need_copy`, `sys` must point to at least `n*c*h*w` readable bytes.
pub unsafe fn convert_system_to_device_neuron_byte<W: SizeWidth>(
    ctx: &DeviceContext,
    sys: &MemoryDescriptor<W>,
    need_copy: bool,
    n: u64,
    c: u64,
    h: u64,
    w: u64,
) -> MemResult<MemoryDescriptor<W>> {
    require_system(sys)?;
    let size = [c, h, w]
        .into_iter()
        .try_fold(n, u64::checked_mul)
        .ok_or_else(|| MemError::InvalidArgument("neuron shape overflows".into()))?;
    let mem = allocator::malloc_device_byte(ctx, size)?;
    if !need_copy {
        return Ok(mem);
    }
    unsafe { upload(ctx, mem, sys) }
}

/// Allocates `coeff_count` dwords and, with `need_copy`, uploads the host data behind `sys`.
///
/// # Errors
/// As [`convert_system_to_device_neuron`].
///
/// # Safety
/// With `need_copy`, `sys` must point to at least `coeff_count * 4` readable bytes.
pub unsafe fn convert_system_to_device_coeff<W: SizeWidth>(
    ctx: &DeviceContext,
    sys: &MemoryDescriptor<W>,
    need_copy: bool,
    coeff_count: u64,
) -> MemResult<MemoryDescriptor<W>> {
    require_system(sys)?;
    let mem = allocator::malloc_device_dword(ctx, coeff_count)?;
    if !need_copy {
        return Ok(mem);
    }
    unsafe { upload(ctx, mem, sys) }
}

/// Byte-sized variant of [`convert_system_to_device_coeff`].
///
/// # Errors
/// As [`convert_system_to_device_neuron`].
///
/// # Safety
/// With `need_copy`, `sys` must point to at least `coeff_count` readable bytes.
pub unsafe fn convert_system_to_device_coeff_byte<W: SizeWidth>(
    ctx: &DeviceContext,
    sys: &MemoryDescriptor<W>,
    need_copy: bool,
    coeff_count: u64,
) -> MemResult<MemoryDescriptor<W>> {
    require_system(sys)?;
    let mem = allocator::malloc_device_byte(ctx, coeff_count)?;
    if !need_copy {
        return Ok(mem);
    }
    unsafe { upload(ctx, mem, sys) }
}
