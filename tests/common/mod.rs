#![allow(dead_code)]

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tpu_mem::bmdev::DeviceBackend;
use tpu_mem::bmdev::cmodel::{Cmodel, CmodelKernels};
use tpu_mem::bmdev::ioctl::{
    DeviceMemArgs, DeviceMemArgsU64, GmemAddr, HeapStatByte, IonAllocationData, MemcpyInfo,
    MemcpyP2pInfo, MiscInfo,
};
use tpu_mem::profile::{MemOp, ProfileHooks};
use tpu_mem::{Config, DeviceContext, OperatingMode};

/// One driver call seen by [`Recorder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Memcpy {
        dir: u32,
        device_addr: u64,
        src_device_addr: u64,
        size: u64,
        intr: bool,
    },
    MemcpyP2p {
        src: u64,
        dst: u64,
        dst_num: u32,
        size: u64,
    },
    Mmap {
        offset: u64,
        len: usize,
    },
    Munmap {
        len: usize,
    },
    Invalidate(u64),
    Flush(u64),
    /// `wide` is set for the `_U64` free command.
    Free {
        addr: u64,
        size: u64,
        wide: bool,
    },
}

/// Cmodel wrapper that logs every call and can pretend to be hardware.
#[derive(Debug)]
pub struct Recorder {
    inner: Arc<Cmodel>,
    simulated: bool,
    dry_run: bool,
    fail_memcpy_after: Option<usize>,
    memcpys: AtomicUsize,
    calls: Mutex<Vec<Call>>,
}

impl Recorder {
    pub fn new(inner: Arc<Cmodel>) -> Self {
        Self {
            inner,
            simulated: false,
            dry_run: false,
            fail_memcpy_after: None,
            memcpys: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reports itself as simulated, so window checks and cache maintenance are skipped.
    pub fn simulated(mut self) -> Self {
        self.simulated = true;
        self
    }

    /// Records copies without moving any data.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Fails every copy after the first `n` with `EIO`.
    pub fn fail_memcpy_after(mut self, n: usize) -> Self {
        self.fail_memcpy_after = Some(n);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn memcpys(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Memcpy { .. }))
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn cmodel(&self) -> &Cmodel {
        &self.inner
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl DeviceBackend for Recorder {
    fn misc_info(&self) -> io::Result<MiscInfo> {
        self.inner.misc_info()
    }

    fn alloc_gmem(&self, args: &mut IonAllocationData) -> io::Result<()> {
        self.inner.alloc_gmem(args)
    }

    fn free_gmem(&self, args: &mut DeviceMemArgs) -> io::Result<()> {
        self.push(Call::Free {
            addr: args.device_addr,
            size: u64::from(args.size),
            wide: false,
        });
        self.inner.free_gmem(args)
    }

    fn free_gmem_u64(&self, args: &mut DeviceMemArgsU64) -> io::Result<()> {
        self.push(Call::Free {
            addr: args.device_addr,
            size: args.size,
            wide: true,
        });
        self.inner.free_gmem_u64(args)
    }

    fn close_dmabuf(&self, fd: i32) -> io::Result<()> {
        self.inner.close_dmabuf(fd)
    }

    unsafe fn memcpy(&self, info: &mut MemcpyInfo) -> io::Result<()> {
        self.push(Call::Memcpy {
            dir: info.dir,
            device_addr: info.device_addr,
            src_device_addr: info.src_device_addr,
            size: info.size,
            intr: info.intr,
        });
        let done = self.memcpys.fetch_add(1, Ordering::SeqCst);
        if self.fail_memcpy_after.is_some_and(|n| done >= n) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        if self.dry_run || info.dir == tpu_mem::bmdev::ioctl::CHIP2CHIP {
            return Ok(());
        }
        unsafe { self.inner.memcpy(info) }
    }

    fn memcpy_p2p(&self, info: &mut MemcpyP2pInfo) -> io::Result<()> {
        self.push(Call::MemcpyP2p {
            src: info.src_device_addr,
            dst: info.dst_device_addr,
            dst_num: info.dst_num,
            size: info.size,
        });
        Ok(())
    }

    fn invalidate(&self, para: u64) -> io::Result<()> {
        self.push(Call::Invalidate(para));
        self.inner.invalidate(para)
    }

    fn flush(&self, para: u64) -> io::Result<()> {
        self.push(Call::Flush(para));
        self.inner.flush(para)
    }

    fn gmem_addr(&self, args: &mut GmemAddr) -> io::Result<()> {
        self.inner.gmem_addr(args)
    }

    fn total_gmem(&self) -> io::Result<u64> {
        self.inner.total_gmem()
    }

    fn avail_gmem(&self) -> io::Result<u64> {
        self.inner.avail_gmem()
    }

    fn heap_num(&self) -> io::Result<u32> {
        self.inner.heap_num()
    }

    fn heap_stat(&self, args: &mut HeapStatByte) -> io::Result<()> {
        self.inner.heap_stat(args)
    }

    fn mmap(&self, offset: u64, len: usize) -> io::Result<NonNull<u8>> {
        self.push(Call::Mmap { offset, len });
        self.inner.mmap(offset, len)
    }

    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        self.push(Call::Munmap { len });
        unsafe { self.inner.munmap(ptr, len) }
    }

    fn is_simulated(&self) -> bool {
        self.simulated
    }
}

/// Counts profiling callbacks.
#[derive(Debug, Default)]
pub struct CountingProfiler {
    pub mem_begin: AtomicUsize,
    pub mem_end: Mutex<Vec<(MemOp, u64, u64)>>,
    pub memcpy_begin: AtomicUsize,
    pub memcpy_end: AtomicUsize,
}

impl ProfileHooks for CountingProfiler {
    fn mem_begin(&self) {
        self.mem_begin.fetch_add(1, Ordering::SeqCst);
    }

    fn mem_end(&self, op: MemOp, addr: u64, size: u64) {
        self.mem_end.lock().unwrap().push((op, addr, size));
    }

    fn memcpy_begin(&self) {
        self.memcpy_begin.fetch_add(1, Ordering::SeqCst);
    }

    fn memcpy_end(&self, _host_addr: u64, _device_addr: u64, _size: u64, _dir: u32) {
        self.memcpy_end.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn cmodel(mode: OperatingMode) -> Arc<Cmodel> {
    Arc::new(Cmodel::builder().mode(mode).build())
}

/// Wraps `recorder` in a context with the simulator's kernels attached.
pub fn context_over(
    recorder: Recorder,
    dev_id: u32,
    config: Config,
) -> (DeviceContext, Arc<Recorder>) {
    let recorder = Arc::new(recorder);
    let kernels = Arc::new(CmodelKernels::new(recorder.inner.clone()));
    let ctx = DeviceContext::with_backend(dev_id, recorder.clone(), config)
        .unwrap()
        .with_kernel_launcher(kernels);
    (ctx, recorder)
}

/// A context that takes the hardware code paths on top of the simulator.
pub fn hardware(mode: OperatingMode, config: Config) -> (DeviceContext, Arc<Recorder>) {
    context_over(Recorder::new(cmodel(mode)), 0, config)
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
