use crate::bmdev::ioctl::{BMDEV_MMAP_NO_CACHE, GmemAddr};
use crate::context::DeviceContext;
use crate::error::{MemError, MemResult};
use crate::memory::descriptor::{MemKind, MemoryDescriptor};
use crate::memory::validator;
use crate::memory::width::SizeWidth;
use crate::utils::{PAGE_SIZE, align_down, align_up};
use std::ptr::NonNull;

/// Page-granular window covering an arbitrary device range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapWindow {
    pub aligned_addr: u64,
    pub aligned_len: u64,
    /// Distance from `aligned_addr` to the requested start.
    pub sub_page_offset: u64,
}

impl MapWindow {
    /// Returns `None` if the range, rounded out to pages, runs past the end of the address space.
    #[must_use]
    pub const fn new(addr: u64, size: u64) -> Option<Self> {
        let Some(end) = addr.checked_add(size) else {
            return None;
        };
        if end > u64::MAX - (PAGE_SIZE - 1) {
            return None;
        }
        let aligned_addr = align_down(addr, PAGE_SIZE);
        Some(Self {
            aligned_addr,
            aligned_len: align_up(end, PAGE_SIZE) - aligned_addr,
            sub_page_offset: addr - aligned_addr,
        })
    }
}

/// A device range mapped into this process. Unmapped on drop.
#[derive(Debug)]
pub struct DeviceMapping<'a> {
    ctx: &'a DeviceContext,
    base: NonNull<u8>,
    map_len: usize,
    offset: usize,
    len: usize,
    device_addr: u64,
    mapped: bool,
}

impl DeviceMapping<'_> {
    /// Host address of the first requested byte.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.offset) }
    }

    /// Length of the requested range in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn device_addr(&self) -> u64 {
        self.device_addr
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr(), self.len) }
    }

    /// Unmaps now, reporting failure instead of logging it.
    ///
    /// # Errors
    /// Returns a driver error if `munmap` fails.
    pub fn unmap(mut self) -> MemResult<()> {
        self.release()
    }

    fn release(&mut self) -> MemResult<()> {
        if !self.mapped {
            return Ok(());
        }
        self.mapped = false;
        unsafe { self.ctx.backend().munmap(self.base, self.map_len) }
            .map_err(|e| MemError::from_driver("munmap", e))
    }
}

impl Drop for DeviceMapping<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("unmap of device 0x{:x} failed: {e}", self.device_addr);
        }
    }
}

fn map_range(
    ctx: &DeviceContext,
    addr: u64,
    size: u64,
    flags: u64,
    mix: bool,
) -> MemResult<DeviceMapping<'_>> {
    ctx.require_soc_like("mmap")?;
    ctx.check_range(addr, size)?;
    if size == 0 {
        return Err(MemError::InvalidArgument("cannot map an empty range".into()));
    }

    if !mix && !validator::page_aligned(addr) {
        log::error!("mmap address 0x{addr:x} is not page aligned");
        return Err(MemError::RangeInvalid { addr, size });
    }
    let window = MapWindow::new(addr, size).ok_or_else(|| {
        log::error!("mmap range 0x{addr:x}+0x{size:x} overflows");
        MemError::RangeInvalid { addr, size }
    })?;

    let too_big = || MemError::InvalidArgument(format!("mapping of 0x{size:x} bytes"));
    let map_len = usize::try_from(window.aligned_len).map_err(|_| too_big())?;
    let offset = usize::try_from(window.sub_page_offset).map_err(|_| too_big())?;
    let len = usize::try_from(size).map_err(|_| too_big())?;

    let base = ctx
        .backend()
        .mmap(window.aligned_addr | flags, map_len)
        .map_err(|e| MemError::from_driver("mmap", e))?;
    log::trace!(
        "mapped device 0x{:x}+0x{map_len:x} at {:p}",
        window.aligned_addr,
        base
    );

    Ok(DeviceMapping {
        ctx,
        base,
        map_len,
        offset,
        len,
        device_addr: addr,
        mapped: true,
    })
}

pub(crate) fn map_device_range(
    ctx: &DeviceContext,
    addr: u64,
    size: u64,
) -> MemResult<DeviceMapping<'_>> {
    map_range(ctx, addr, size, 0, false)
}

pub(crate) fn map_device_range_mix(
    ctx: &DeviceContext,
    addr: u64,
    size: u64,
) -> MemResult<DeviceMapping<'_>> {
    map_range(ctx, addr, size, 0, true)
}

/// Maps a page-aligned device buffer, cached.
///
/// # Errors
/// `UnsupportedMode` in PCIe mode; `RangeInvalid` if the address is unaligned or out of window.
pub fn mmap_device_mem<'a, W: SizeWidth>(
    ctx: &'a DeviceContext,
    mem: &MemoryDescriptor<W>,
) -> MemResult<DeviceMapping<'a>> {
    ctx.expect_kind(mem, MemKind::Device, "mmap")?;
    map_range(ctx, mem.raw_addr(), mem.size_u64(), 0, false)
}

/// Maps a page-aligned device buffer with caching disabled.
///
/// # Errors
/// As [`mmap_device_mem`].
pub fn mmap_device_mem_no_cache<'a, W: SizeWidth>(
    ctx: &'a DeviceContext,
    mem: &MemoryDescriptor<W>,
) -> MemResult<DeviceMapping<'a>> {
    ctx.expect_kind(mem, MemKind::Device, "mmap")?;
    map_range(ctx, mem.raw_addr(), mem.size_u64(), BMDEV_MMAP_NO_CACHE, false)
}

/// Maps a device buffer at any alignment. The enclosing pages are mapped and
/// [`DeviceMapping::as_ptr`] points at the buffer's first byte.
///
/// # Errors
/// `UnsupportedMode` in PCIe mode; `RangeInvalid` if out of window.
pub fn mmap_device_mem_mix<'a, W: SizeWidth>(
    ctx: &'a DeviceContext,
    mem: &MemoryDescriptor<W>,
) -> MemResult<DeviceMapping<'a>> {
    ctx.expect_kind(mem, MemKind::Device, "mmap")?;
    map_range(ctx, mem.raw_addr(), mem.size_u64(), 0, true)
}

/// Releases any mapping returned by the `mmap_device_mem*` family.
///
/// # Errors
/// Returns a driver error if `munmap` fails.
pub fn unmap_device_mem(mapping: DeviceMapping<'_>) -> MemResult<()> {
    mapping.unmap()
}

/// Translates a mapped host address back to its device-physical address.
///
/// # Errors
/// `UnsupportedMode` in PCIe mode, or a driver error for unmapped addresses.
pub fn vir_to_phy(ctx: &DeviceContext, vaddr: *const u8) -> MemResult<u64> {
    ctx.require_soc_like("vir_to_phy")?;
    let mut args = GmemAddr {
        vir_addr: vaddr as usize as u64,
        phy_addr: 0,
    };
    ctx.backend()
        .gmem_addr(&mut args)
        .map_err(|e| MemError::from_driver("gmem addr", e))?;
    Ok(args.phy_addr)
}
