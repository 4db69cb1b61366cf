//! In-process emulation of one accelerator ("cmodel").
//!
//! Global memory starts at [`GLOBAL_MEM_START_ADDR`] and is split into fixed heap regions, each
//! managed by a first-fit free list. Memory is stored sparsely by page, so large heaps cost nothing
//! until written. Cache maintenance is accepted and ignored; mmap hands out a host shadow buffer
//! that is written back on unmap.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bmdev::DeviceBackend;
use crate::bmdev::ioctl::{
    BMDEV_MMAP_NO_CACHE, CHIP2HOST, DeviceMemArgs, DeviceMemArgsU64, GmemAddr, HOST2CHIP,
    HeapStatByte, IonAllocationData, MemcpyInfo, MemcpyP2pInfo, MiscInfo,
};
use crate::context::OperatingMode;
use crate::error::{MemError, MemResult};
use crate::memory::kernel::{
    KernelLauncher, MemcpyByteParams, MemcpyParams, MemcpyStrideParams, MemsetParams, ModuleHandle,
    SG_API_MEMCPY, SG_API_MEMCPY_BYTE, SG_API_MEMCPY_WSTRIDE, SG_API_MEMSET, decode_params,
};
use crate::utils::{PAGE_SIZE, align_up};

pub const GLOBAL_MEM_START_ADDR: u64 = 0x1_0000_0000;

/// Returned by the pool when no heap in the mask can satisfy a request.
pub const MEM_POOL_ADDR_INVALID: u64 = u64::MAX;

const DEFAULT_HEAP_SIZE: u64 = 256 << 20;

#[derive(Debug, Clone, Copy)]
struct HeapRegion {
    start: u64,
    size: u64,
}

impl HeapRegion {
    fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.start && addr.saturating_add(len) <= self.start + self.size
    }
}

#[derive(Debug, Clone, Copy)]
struct LiveBlock {
    len: u64,
    heap: usize,
    fd: i32,
}

#[derive(Debug)]
struct ShadowMap {
    addr: u64,
    buf: Box<[u8]>,
}

#[derive(Debug, Default)]
struct PoolState {
    pages: HashMap<u64, Box<[u8]>>,
    free: Vec<BTreeMap<u64, u64>>,
    live: BTreeMap<u64, LiveBlock>,
    open_fds: HashMap<i32, u64>,
    next_fd: i32,
    maps: HashMap<usize, ShadowMap>,
}

impl PoolState {
    fn write(&mut self, mut addr: u64, mut data: &[u8]) {
        while !data.is_empty() {
            let page = addr / PAGE_SIZE;
            let off = (addr % PAGE_SIZE) as usize;
            let n = data.len().min(PAGE_SIZE as usize - off);
            let buf = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            buf[off..off + n].copy_from_slice(&data[..n]);
            addr += n as u64;
            data = &data[n..];
        }
    }

    fn read(&self, mut addr: u64, mut out: &mut [u8]) {
        while !out.is_empty() {
            let page = addr / PAGE_SIZE;
            let off = (addr % PAGE_SIZE) as usize;
            let n = out.len().min(PAGE_SIZE as usize - off);
            let (head, tail) = out.split_at_mut(n);
            match self.pages.get(&page) {
                Some(buf) => head.copy_from_slice(&buf[off..off + n]),
                None => head.fill(0),
            }
            addr += n as u64;
            out = tail;
        }
    }

    fn take_first_fit(&mut self, heap: usize, len: u64) -> Option<u64> {
        let free = &mut self.free[heap];
        let (&start, &block) = free.iter().find(|&(_, &block)| block >= len)?;
        free.remove(&start);
        if block > len {
            free.insert(start + len, block - len);
        }
        Some(start)
    }

    fn give_back(&mut self, heap: usize, start: u64, len: u64) {
        let free = &mut self.free[heap];
        let mut start = start;
        let mut len = len;

        let before = free.range(..start).next_back().map(|(&k, &v)| (k, v));
        if let Some((prev, prev_len)) = before
            && prev + prev_len == start
        {
            free.remove(&prev);
            start = prev;
            len += prev_len;
        }
        if let Some(&next_len) = free.get(&(start + len)) {
            free.remove(&(start + len));
            len += next_len;
        }
        free.insert(start, len);
    }
}

/// Configuration for a [`Cmodel`] instance.
#[derive(Debug, Clone)]
pub struct CmodelBuilder {
    chip_id: u32,
    mode: OperatingMode,
    domain_bdf: i32,
    heap_sizes: Vec<u64>,
}

impl Default for CmodelBuilder {
    fn default() -> Self {
        Self {
            chip_id: 0x1684,
            mode: OperatingMode::Pcie,
            domain_bdf: 0,
            heap_sizes: vec![DEFAULT_HEAP_SIZE; 3],
        }
    }
}

impl CmodelBuilder {
    #[must_use]
    pub const fn chip_id(mut self, chip_id: u32) -> Self {
        self.chip_id = chip_id;
        self
    }

    #[must_use]
    pub const fn mode(mut self, mode: OperatingMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub const fn domain_bdf(mut self, bdf: i32) -> Self {
        self.domain_bdf = bdf;
        self
    }

    /// One entry per heap; heaps are laid out back to back from the global memory base.
    #[must_use]
    pub fn heap_sizes(mut self, sizes: &[u64]) -> Self {
        self.heap_sizes = sizes.to_vec();
        self
    }

    #[must_use]
    pub fn build(self) -> Cmodel {
        let mut heaps = Vec::with_capacity(self.heap_sizes.len());
        let mut state = PoolState {
            next_fd: 1000,
            ..PoolState::default()
        };
        let mut cursor = GLOBAL_MEM_START_ADDR;
        for &size in &self.heap_sizes {
            let size = align_up(size, PAGE_SIZE);
            heaps.push(HeapRegion {
                start: cursor,
                size,
            });
            let mut free = BTreeMap::new();
            if size > 0 {
                free.insert(cursor, size);
            }
            state.free.push(free);
            cursor += size;
        }

        let info = MiscInfo {
            pcie_soc_mode: self.mode.as_raw(),
            chipid: self.chip_id,
            domain_bdf: self.domain_bdf,
            ..MiscInfo::default()
        };

        Cmodel {
            info,
            heaps,
            state: Mutex::new(state),
        }
    }
}

/// Simulated device backend.
#[derive(Debug)]
pub struct Cmodel {
    info: MiscInfo,
    heaps: Vec<HeapRegion>,
    state: Mutex<PoolState>,
}

impl Default for Cmodel {
    fn default() -> Self {
        CmodelBuilder::default().build()
    }
}

impl Cmodel {
    #[must_use]
    pub fn builder() -> CmodelBuilder {
        CmodelBuilder::default()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_global_mem(&self, addr: u64, len: u64) -> bool {
        self.heaps.iter().any(|h| h.contains(addr, len))
    }

    /// Reserves `len` bytes from the first heap in `mask` with room, page-granular.
    ///
    /// Returns `(address, heap)` or `MEM_POOL_ADDR_INVALID` when nothing fits.
    fn pool_alloc(&self, state: &mut PoolState, len: u64, mask: u32) -> (u64, usize) {
        let reserve = align_up(len.max(1), PAGE_SIZE);
        for heap in 0..self.heaps.len() {
            if heap >= 32 || mask & (1 << heap) == 0 {
                continue;
            }
            if let Some(addr) = state.take_first_fit(heap, reserve) {
                return (addr, heap);
            }
        }
        (MEM_POOL_ADDR_INVALID, 0)
    }

    fn release(&self, addr: u64) -> io::Result<()> {
        let mut state = self.lock();
        let Some(block) = state.live.remove(&addr) else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        state.open_fds.remove(&block.fd);
        state.give_back(block.heap, addr, block.len);
        Ok(())
    }

    /// Copies `len` bytes between two device ranges.
    pub(crate) fn copy_within(&self, src: u64, dst: u64, len: u64) -> io::Result<()> {
        if !self.in_global_mem(src, len) || !self.in_global_mem(dst, len) {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }
        let len = usize::try_from(len).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let mut state = self.lock();
        let mut tmp = vec![0u8; len];
        state.read(src, &mut tmp);
        state.write(dst, &tmp);
        Ok(())
    }

    /// Strided element copy as performed by the `wstride` kernel.
    pub(crate) fn copy_strided(&self, p: &MemcpyStrideParams) -> io::Result<()> {
        let fmt = u64::try_from(p.format_size).unwrap_or(0);
        let src_stride = u64::try_from(p.src_stride).unwrap_or(0);
        let dst_stride = u64::try_from(p.dst_stride).unwrap_or(0);
        let count = u64::try_from(p.count).unwrap_or(0);
        if fmt == 0 || src_stride == 0 || dst_stride == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if !self.in_global_mem(p.src_addr, count * src_stride * fmt)
            || !self.in_global_mem(p.dst_addr, count * dst_stride * fmt)
        {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }

        let mut state = self.lock();
        let mut elem = vec![0u8; fmt as usize];
        for i in 0..count {
            state.read(p.src_addr + i * src_stride * fmt, &mut elem);
            state.write(p.dst_addr + i * dst_stride * fmt, &elem);
        }
        Ok(())
    }

    /// Fills a device range with the low `mode` bytes of `value`, repeated.
    pub(crate) fn fill(&self, p: &MemsetParams) -> io::Result<()> {
        let mode = usize::try_from(p.mode).unwrap_or(0);
        let len = u64::from(p.height) * u64::from(p.width);
        if !(1..=4).contains(&mode) || len % mode as u64 != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if !self.in_global_mem(p.global_offset, len) {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }
        let pattern = p.value.to_le_bytes();
        let bytes: Vec<u8> = pattern[..mode]
            .iter()
            .copied()
            .cycle()
            .take(len as usize)
            .collect();
        self.lock().write(p.global_offset, &bytes);
        Ok(())
    }

    /// Number of live allocations.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.lock().live.len()
    }
}

impl DeviceBackend for Cmodel {
    fn misc_info(&self) -> io::Result<MiscInfo> {
        Ok(self.info)
    }

    fn alloc_gmem(&self, args: &mut IonAllocationData) -> io::Result<()> {
        let mut state = self.lock();
        let (addr, heap) = self.pool_alloc(&mut state, args.len, args.heap_id_mask);
        if addr == MEM_POOL_ADDR_INVALID {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }

        let fd = state.next_fd;
        state.next_fd += 1;
        state.open_fds.insert(fd, addr);
        state.live.insert(
            addr,
            LiveBlock {
                len: align_up(args.len.max(1), PAGE_SIZE),
                heap,
                fd,
            },
        );

        args.paddr = addr;
        args.fd = fd;
        args.heap_id = heap as u32;
        Ok(())
    }

    fn free_gmem(&self, args: &mut DeviceMemArgs) -> io::Result<()> {
        self.release(args.device_addr)
    }

    fn free_gmem_u64(&self, args: &mut DeviceMemArgsU64) -> io::Result<()> {
        self.release(args.device_addr)
    }

    fn close_dmabuf(&self, fd: i32) -> io::Result<()> {
        match self.lock().open_fds.remove(&fd) {
            Some(_) => Ok(()),
            None => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    unsafe fn memcpy(&self, info: &mut MemcpyInfo) -> io::Result<()> {
        if !self.in_global_mem(info.device_addr, info.size) {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }
        let len =
            usize::try_from(info.size).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let host = info.host_addr as usize as *mut u8;
        if host.is_null() && len > 0 {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }

        match info.dir {
            HOST2CHIP => {
                let src = unsafe { std::slice::from_raw_parts(host.cast_const(), len) };
                self.lock().write(info.device_addr, src);
                Ok(())
            }
            CHIP2HOST => {
                let dst = unsafe { std::slice::from_raw_parts_mut(host, len) };
                self.lock().read(info.device_addr, dst);
                Ok(())
            }
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn memcpy_p2p(&self, _info: &mut MemcpyP2pInfo) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP))
    }

    fn invalidate(&self, _para: u64) -> io::Result<()> {
        Ok(())
    }

    fn flush(&self, _para: u64) -> io::Result<()> {
        Ok(())
    }

    fn gmem_addr(&self, args: &mut GmemAddr) -> io::Result<()> {
        let state = self.lock();
        let vir = args.vir_addr as usize;
        let hit = state
            .maps
            .iter()
            .find(|&(&base, map)| vir >= base && vir < base + map.buf.len());
        match hit {
            Some((&base, map)) => {
                args.phy_addr = map.addr + (vir - base) as u64;
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn total_gmem(&self) -> io::Result<u64> {
        Ok(self.heaps.iter().map(|h| h.size).sum())
    }

    fn avail_gmem(&self) -> io::Result<u64> {
        let state = self.lock();
        Ok(state.free.iter().flat_map(|f| f.values()).sum())
    }

    fn heap_num(&self) -> io::Result<u32> {
        Ok(self.heaps.len() as u32)
    }

    fn heap_stat(&self, args: &mut HeapStatByte) -> io::Result<()> {
        let heap = args.heap_id as usize;
        let Some(region) = self.heaps.get(heap) else {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        };
        let avail: u64 = self.lock().free[heap].values().sum();
        args.mem_total = region.size;
        args.mem_avail = avail;
        args.mem_used = region.size - avail;
        args.mem_start_addr = region.start;
        Ok(())
    }

    fn mmap(&self, offset: u64, len: usize) -> io::Result<NonNull<u8>> {
        let addr = offset & !BMDEV_MMAP_NO_CACHE;
        if len == 0 || !self.in_global_mem(addr, len as u64) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let mut state = self.lock();
        let mut buf = vec![0u8; len].into_boxed_slice();
        state.read(addr, &mut buf);
        let ptr = NonNull::new(buf.as_mut_ptr())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        state.maps.insert(ptr.as_ptr() as usize, ShadowMap { addr, buf });
        Ok(ptr)
    }

    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        let mut state = self.lock();
        let Some(map) = state.maps.remove(&(ptr.as_ptr() as usize)) else {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        };
        if map.buf.len() != len {
            log::warn!(
                "cmodel munmap length 0x{len:x} differs from mapping 0x{:x}",
                map.buf.len()
            );
        }
        state.write(map.addr, &map.buf);
        Ok(())
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

/// Executes the device-side memory kernels directly against a [`Cmodel`].
#[derive(Debug, Clone)]
pub struct CmodelKernels {
    device: Arc<Cmodel>,
}

impl CmodelKernels {
    #[must_use]
    pub fn new(device: Arc<Cmodel>) -> Self {
        Self { device }
    }
}

impl KernelLauncher for CmodelKernels {
    fn load_module(&self, path: &Path, key: &str) -> MemResult<ModuleHandle> {
        log::trace!("cmodel load module {} ({key})", path.display());
        Ok(ModuleHandle(1))
    }

    fn launch(&self, _module: ModuleHandle, function: &str, params: &[u8]) -> MemResult<()> {
        let result = match function {
            SG_API_MEMCPY => {
                let p: MemcpyParams = decode_params(params)?;
                let len = u64::try_from(p.count).unwrap_or(0) * 4;
                self.device.copy_within(p.src_global_offset, p.dst_global_offset, len)
            }
            SG_API_MEMCPY_WSTRIDE => {
                let p: MemcpyStrideParams = decode_params(params)?;
                self.device.copy_strided(&p)
            }
            SG_API_MEMCPY_BYTE => {
                let p: MemcpyByteParams = decode_params(params)?;
                self.device.copy_within(p.src_addr, p.dst_addr, p.size)
            }
            SG_API_MEMSET => {
                let p: MemsetParams = decode_params(params)?;
                self.device.fill(&p)
            }
            other => return Err(MemError::KernelLaunch(format!("unknown function {other}"))),
        };
        result.map_err(|e| MemError::KernelLaunch(format!("{function}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(dev: &Cmodel, len: u64, mask: u32) -> io::Result<IonAllocationData> {
        let mut args = IonAllocationData {
            len,
            heap_id_mask: mask,
            ..Default::default()
        };
        dev.alloc_gmem(&mut args)?;
        Ok(args)
    }

    #[test]
    fn allocations_come_from_requested_heap() {
        let dev = Cmodel::builder().heap_sizes(&[1 << 20, 1 << 20]).build();
        let a = alloc(&dev, 4096, 0b10).unwrap();
        assert_eq!(a.heap_id, 1);
        assert_eq!(a.paddr, GLOBAL_MEM_START_ADDR + (1 << 20));
    }

    #[test]
    fn exhaustion_reports_enomem() {
        let dev = Cmodel::builder().heap_sizes(&[2 * PAGE_SIZE]).build();
        alloc(&dev, PAGE_SIZE * 2, 1).unwrap();
        let err = alloc(&dev, 1, 1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
    }

    #[test]
    fn freed_blocks_coalesce() {
        let dev = Cmodel::builder().heap_sizes(&[4 * PAGE_SIZE]).build();
        let a = alloc(&dev, PAGE_SIZE, 1).unwrap();
        let b = alloc(&dev, PAGE_SIZE, 1).unwrap();
        let c = alloc(&dev, 2 * PAGE_SIZE, 1).unwrap();
        for x in [b, a, c] {
            let mut args = DeviceMemArgs {
                device_addr: x.paddr,
                ..Default::default()
            };
            dev.free_gmem(&mut args).unwrap();
        }
        let whole = alloc(&dev, 4 * PAGE_SIZE, 1).unwrap();
        assert_eq!(whole.paddr, GLOBAL_MEM_START_ADDR);
        assert_eq!(dev.avail_gmem().unwrap(), 0);
    }

    #[test]
    fn double_free_is_rejected() {
        let dev = Cmodel::default();
        let a = alloc(&dev, 64, 0b111).unwrap();
        let mut args = DeviceMemArgs {
            device_addr: a.paddr,
            ..Default::default()
        };
        dev.free_gmem(&mut args).unwrap();
        let err = dev.free_gmem(&mut args).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn shadow_map_writes_back_on_unmap() {
        let dev = Cmodel::default();
        let a = alloc(&dev, PAGE_SIZE, 1).unwrap();
        let ptr = dev.mmap(a.paddr | BMDEV_MMAP_NO_CACHE, PAGE_SIZE as usize).unwrap();
        unsafe {
            ptr.as_ptr().add(10).write(0x5A);
            dev.munmap(ptr, PAGE_SIZE as usize).unwrap();
        }
        let mut out = [0u8; 1];
        dev.lock().read(a.paddr + 10, &mut out);
        assert_eq!(out[0], 0x5A);
    }

    #[test]
    fn sparse_reads_are_zero() {
        let dev = Cmodel::default();
        let mut out = [0xFFu8; 16];
        dev.lock().read(GLOBAL_MEM_START_ADDR + 12345, &mut out);
        assert_eq!(out, [0u8; 16]);
    }
}
