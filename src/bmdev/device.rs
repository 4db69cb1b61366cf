use crate::bmdev::DeviceBackend;
use crate::bmdev::ioctl::{
    BMDEV_ALLOC_GMEM, BMDEV_AVAIL_GMEM, BMDEV_FLUSH_GMEM, BMDEV_FREE_GMEM, BMDEV_FREE_GMEM_U64,
    BMDEV_GET_HEAP_NUM, BMDEV_GET_HEAP_STAT_BYTE, BMDEV_GET_MISC_INFO, BMDEV_GMEM_ADDR,
    BMDEV_INVALIDATE_GMEM, BMDEV_MEMCPY, BMDEV_MEMCPY_P2P, BMDEV_TOTAL_GMEM, DeviceMemArgs,
    DeviceMemArgsU64, GmemAddr, HeapStatByte, IonAllocationData, MemcpyInfo, MemcpyP2pInfo,
    MiscInfo,
};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::ptr::{self, NonNull};
use std::sync::Arc;

/// A handle to one accelerator character device.
///
/// PCIe cards appear as `/dev/bm-sophon<N>`, SoC parts as `/dev/bm-tpu<N>`. The file is kept in an
/// `Arc` so clones share the descriptor.
#[derive(Clone, Debug)]
pub struct BmDevice {
    pub file: Arc<File>,
    pub path: PathBuf,
}

impl BmDevice {
    /// Opens device `dev_id`, trying the PCIe node first and the SoC node second.
    ///
    /// # Errors
    /// Returns the error of the last attempted node if neither can be opened.
    pub fn open(dev_id: u32) -> io::Result<Self> {
        let candidates = [
            PathBuf::from(format!("/dev/bm-sophon{dev_id}")),
            PathBuf::from(format!("/dev/bm-tpu{dev_id}")),
        ];

        let mut last_err = io::Error::from(io::ErrorKind::NotFound);
        for path in candidates {
            match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => {
                    log::debug!("opened {}", path.display());
                    return Ok(Self {
                        file: Arc::new(file),
                        path,
                    });
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Generic unsafe helper to execute an IOCTL.
    ///
    /// # Safety
    /// The caller must ensure that `arg` has the layout the driver expects for `cmd`.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn query_u64(&self, cmd: u32) -> io::Result<u64> {
        let mut value = 0u64;
        unsafe {
            self.ioctl(cmd, &mut value)?;
        }
        Ok(value)
    }
}

impl DeviceBackend for BmDevice {
    fn misc_info(&self) -> io::Result<MiscInfo> {
        let mut info = MiscInfo::default();
        unsafe {
            self.ioctl(BMDEV_GET_MISC_INFO, &mut info)?;
        }
        Ok(info)
    }

    fn alloc_gmem(&self, args: &mut IonAllocationData) -> io::Result<()> {
        unsafe { self.ioctl(BMDEV_ALLOC_GMEM, args) }
    }

    fn free_gmem(&self, args: &mut DeviceMemArgs) -> io::Result<()> {
        unsafe { self.ioctl(BMDEV_FREE_GMEM, args) }
    }

    fn free_gmem_u64(&self, args: &mut DeviceMemArgsU64) -> io::Result<()> {
        unsafe { self.ioctl(BMDEV_FREE_GMEM_U64, args) }
    }

    fn close_dmabuf(&self, fd: i32) -> io::Result<()> {
        if unsafe { libc::close(fd) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    unsafe fn memcpy(&self, info: &mut MemcpyInfo) -> io::Result<()> {
        unsafe { self.ioctl(BMDEV_MEMCPY, info) }
    }

    fn memcpy_p2p(&self, info: &mut MemcpyP2pInfo) -> io::Result<()> {
        unsafe { self.ioctl(BMDEV_MEMCPY_P2P, info) }
    }

    fn invalidate(&self, para: u64) -> io::Result<()> {
        let mut para = para;
        unsafe { self.ioctl(BMDEV_INVALIDATE_GMEM, &mut para) }
    }

    fn flush(&self, para: u64) -> io::Result<()> {
        let mut para = para;
        unsafe { self.ioctl(BMDEV_FLUSH_GMEM, &mut para) }
    }

    fn gmem_addr(&self, args: &mut GmemAddr) -> io::Result<()> {
        unsafe { self.ioctl(BMDEV_GMEM_ADDR, args) }
    }

    fn total_gmem(&self) -> io::Result<u64> {
        self.query_u64(BMDEV_TOTAL_GMEM)
    }

    fn avail_gmem(&self) -> io::Result<u64> {
        self.query_u64(BMDEV_AVAIL_GMEM)
    }

    fn heap_num(&self) -> io::Result<u32> {
        let mut num = 0u32;
        unsafe {
            self.ioctl(BMDEV_GET_HEAP_NUM, &mut num)?;
        }
        Ok(num)
    }

    fn heap_stat(&self, args: &mut HeapStatByte) -> io::Result<()> {
        unsafe { self.ioctl(BMDEV_GET_HEAP_STAT_BYTE, args) }
    }

    fn mmap(&self, offset: u64, len: usize) -> io::Result<NonNull<u8>> {
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))
    }

    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        if unsafe { libc::munmap(ptr.as_ptr().cast(), len) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for BmDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
