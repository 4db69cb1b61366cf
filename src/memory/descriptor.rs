use crate::config::Strictness;
use crate::error::{MemError, MemResult};
use crate::memory::width::SizeWidth;

/// Which address field of a [`MemoryDescriptor`] is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemKind {
    #[default]
    Invalid,
    Device,
    System,
}

/// A host or device memory region.
///
/// Descriptors are plain values: copying one does not duplicate the allocation behind it, and only
/// one copy may be passed to `free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDescriptor<W: SizeWidth> {
    kind: MemKind,
    size: W,
    // Device-physical address for `Device`, host pointer value for `System`.
    addr: u64,
    heap_id: u32,
    dmabuf_fd: i32,
}

/// Descriptor with a 32-bit size field.
pub type DeviceMem = MemoryDescriptor<u32>;
/// Descriptor with a 64-bit size field.
pub type DeviceMemU64 = MemoryDescriptor<u64>;

impl<W: SizeWidth> Default for MemoryDescriptor<W> {
    fn default() -> Self {
        Self::null()
    }
}

impl<W: SizeWidth> MemoryDescriptor<W> {
    #[must_use]
    pub fn null() -> Self {
        Self {
            kind: MemKind::Invalid,
            size: W::default(),
            addr: 0,
            heap_id: 0,
            dmabuf_fd: -1,
        }
    }

    #[must_use]
    pub fn from_device(addr: u64, size: W) -> Self {
        Self {
            kind: MemKind::Device,
            size,
            addr,
            ..Self::null()
        }
    }

    /// Wraps a host buffer. The pointer is stored, never dereferenced by the descriptor itself.
    #[must_use]
    pub fn from_system(ptr: *mut u8, size: W) -> Self {
        Self {
            kind: MemKind::System,
            size,
            addr: ptr as usize as u64,
            ..Self::null()
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MemKind {
        self.kind
    }

    #[must_use]
    pub const fn size(&self) -> W {
        self.size
    }

    #[must_use]
    pub fn size_u64(&self) -> u64 {
        self.size.into()
    }

    #[must_use]
    pub const fn heap_id(&self) -> u32 {
        self.heap_id
    }

    /// Buffer-sharing handle returned by the driver, or -1.
    #[must_use]
    pub const fn dmabuf_fd(&self) -> i32 {
        self.dmabuf_fd
    }

    /// Device address. Warns and returns the raw field when this is not a device descriptor.
    #[must_use]
    pub fn device_addr(&self) -> u64 {
        if self.kind != MemKind::Device {
            log::warn!("mem type is illegal: {:?} is not a device descriptor", self.kind);
        }
        self.addr
    }

    /// Host pointer. Warns and returns the raw field when this is not a system descriptor.
    #[must_use]
    pub fn system_addr(&self) -> *mut u8 {
        if self.kind != MemKind::System {
            log::warn!("mem type is illegal: {:?} is not a system descriptor", self.kind);
        }
        self.addr as usize as *mut u8
    }

    /// Device address, honouring `strictness` on a kind mismatch.
    ///
    /// # Errors
    /// Returns `TypeMismatch` under [`Strictness::Error`] when the descriptor is not `Device`.
    pub fn checked_device_addr(&self, strictness: Strictness) -> MemResult<u64> {
        if self.kind != MemKind::Device && strictness == Strictness::Error {
            return Err(MemError::TypeMismatch {
                expected: MemKind::Device,
                found: self.kind,
            });
        }
        Ok(self.device_addr())
    }

    pub fn set_device_addr(&mut self, addr: u64) {
        if addr & 3 != 0 {
            log::warn!("device address 0x{addr:x} is not 4-byte aligned");
        }
        if self.kind != MemKind::Device {
            log::warn!("mem type is illegal: setting device address on {:?}", self.kind);
        }
        self.addr = addr;
    }

    pub fn set_size(&mut self, size: W) {
        let raw: u64 = size.into();
        if raw & 3 != 0 {
            log::warn!("size 0x{raw:x} is not 4-byte aligned");
        }
        self.size = size;
    }

    /// Turns this into a device descriptor covering `[addr, addr + size)`.
    pub fn set_device_mem(&mut self, size: W, addr: u64) {
        self.kind = MemKind::Device;
        self.set_device_addr(addr);
        self.set_size(size);
    }

    pub(crate) const fn raw_addr(&self) -> u64 {
        self.addr
    }

    pub(crate) fn with_allocation(mut self, heap_id: u32, dmabuf_fd: i32) -> Self {
        self.heap_id = heap_id;
        self.dmabuf_fd = dmabuf_fd;
        self
    }

    /// Copies this descriptor into the 64-bit family.
    #[must_use]
    pub fn widen(&self) -> DeviceMemU64 {
        MemoryDescriptor {
            kind: self.kind,
            size: self.size.into(),
            addr: self.addr,
            heap_id: self.heap_id,
            dmabuf_fd: self.dmabuf_fd,
        }
    }

    /// Copies a 64-bit descriptor into this family, failing if the size does not fit.
    pub fn narrow(mem: &DeviceMemU64) -> Option<Self> {
        Some(Self {
            kind: mem.kind,
            size: W::from_u64(mem.size)?,
            addr: mem.addr,
            heap_id: mem.heap_id,
            dmabuf_fd: mem.dmabuf_fd,
        })
    }
}
