use crate::utils::{iow, iowr};
use std::ffi::c_ulong;

// ===============================================================================================
// Constants
// ===============================================================================================

pub const BMDEV_IOCTL_MAGIC: u8 = b'p';

/// Number of carveout heaps the driver can report (npu, vpp, vpu).
pub const ION_MAX_HEAP_CNT: u32 = 3;

/// Mask selecting every heap the platform exposes.
pub const ANY_HEAP_MASK: u32 = (2 << (ION_MAX_HEAP_CNT - 1)) - 1;

/// OR-ed into an mmap offset to request an uncached mapping.
pub const BMDEV_MMAP_NO_CACHE: u64 = 0x10_0000_0000;

pub const BMLIB_NOT_USE_IOMMU: u32 = 0;
pub const BMLIB_USE_IOMMU: u32 = 1;

// ===============================================================================================
// Copies
// ===============================================================================================

pub const HOST2CHIP: u32 = 0;
pub const CHIP2HOST: u32 = 1;
pub const CHIP2CHIP: u32 = 2;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MemcpyInfo {
    pub host_addr: u64,
    pub device_addr: u64,
    pub src_device_addr: u64,
    pub size: u64,
    pub dir: u32,
    pub intr: bool,
    pub cdma_iommu_mode: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct MemcpyP2pInfo {
    pub src_device_addr: u64,
    pub dst_device_addr: u64,
    pub dst_num: u32,
    pub size: u64,
    pub intr: bool,
    pub cdma_iommu_mode: u32,
}

// ===============================================================================================
// Global Memory Allocation
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct IonAllocationData {
    pub len: u64,
    pub heap_id_mask: u32,
    pub flags: u32,
    pub fd: i32,
    pub heap_id: u32,
    pub paddr: u64,
}

pub const BM_MEM_TYPE_DEVICE: u32 = 0;
pub const BM_MEM_TYPE_HOST: u32 = 1;
pub const BM_MEM_TYPE_SYSTEM: u32 = 2;
pub const BM_MEM_TYPE_INVALID: u32 = 3;

/// 32-bit descriptor as handed back to the driver by `BMDEV_FREE_GMEM`. `flags` packs mem_type in
/// bits 0..3 and gmem_heapid in bits 3..6.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DeviceMemArgs {
    pub device_addr: u64,
    pub reserved: u32,
    pub dmabuf_fd: i32,
    pub flags: u32,
    pub size: u32,
}

impl DeviceMemArgs {
    #[must_use]
    pub const fn pack_flags(mem_type: u32, heap_id: u32) -> u32 {
        (mem_type & 0x7) | ((heap_id & 0x7) << 3)
    }
}

/// 64-bit descriptor for `BMDEV_FREE_GMEM_U64`; same fields with a wide size.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DeviceMemArgsU64 {
    pub device_addr: u64,
    pub reserved: u32,
    pub dmabuf_fd: i32,
    pub flags: u32,
    pub size: u64,
}

const _: () = assert!(std::mem::size_of::<DeviceMemArgs>() == 24);
const _: () = assert!(std::mem::size_of::<DeviceMemArgsU64>() == 32);

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GmemAddr {
    pub vir_addr: u64,
    pub phy_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct HeapStatByte {
    pub heap_id: u32,
    pub mem_total: u64,
    pub mem_avail: u64,
    pub mem_used: u64,
    pub mem_start_addr: u64,
}

// ===============================================================================================
// Device Information
// ===============================================================================================

pub const BM1682_CHIPID_BIT_MASK: u64 = 1 << 0;
pub const BM1684_CHIPID_BIT_MASK: u64 = 1 << 1;
pub const BM1686_CHIPID_BIT_MASK: u64 = 1 << 2;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MiscInfo {
    /// 0 = PCIe, 1 = SoC, 2 = mixed.
    pub pcie_soc_mode: i32,
    pub ddr_ecc_enable: i32,
    pub ddr0a_size: i64,
    pub ddr0b_size: i64,
    pub ddr1_size: i64,
    pub ddr2_size: i64,
    pub chipid: u32,
    pub chipid_bit_mask: u64,
    pub driver_version: u32,
    /// PCI domain/bus/device in the upper bits, function in bits 0..3.
    pub domain_bdf: i32,
    pub board_version: i32,
    pub a53_enable: i32,
    pub dyn_enable: i32,
}

// ===============================================================================================
// Commands
// ===============================================================================================

pub const BMDEV_MEMCPY: u32 = iow::<c_ulong>(BMDEV_IOCTL_MAGIC, 0x00);
pub const BMDEV_ALLOC_GMEM: u32 = iowr::<c_ulong>(BMDEV_IOCTL_MAGIC, 0x10);
pub const BMDEV_FREE_GMEM: u32 = iow::<c_ulong>(BMDEV_IOCTL_MAGIC, 0x11);
pub const BMDEV_TOTAL_GMEM: u32 = iowr::<c_ulong>(BMDEV_IOCTL_MAGIC, 0x12);
pub const BMDEV_AVAIL_GMEM: u32 = iowr::<c_ulong>(BMDEV_IOCTL_MAGIC, 0x13);
pub const BMDEV_INVALIDATE_GMEM: u32 = iowr::<c_ulong>(BMDEV_IOCTL_MAGIC, 0x17);
pub const BMDEV_FLUSH_GMEM: u32 = iowr::<c_ulong>(BMDEV_IOCTL_MAGIC, 0x18);
pub const BMDEV_GMEM_ADDR: u32 = iow::<c_ulong>(BMDEV_IOCTL_MAGIC, 0x1a);
pub const BMDEV_MEMCPY_P2P: u32 = iow::<c_ulong>(BMDEV_IOCTL_MAGIC, 0x1b);
pub const BMDEV_FREE_GMEM_U64: u32 = iow::<c_ulong>(BMDEV_IOCTL_MAGIC, 0x1c);
pub const BMDEV_GET_MISC_INFO: u32 = iowr::<c_ulong>(BMDEV_IOCTL_MAGIC, 0x35);
pub const BMDEV_GET_HEAP_STAT_BYTE: u32 = iowr::<c_ulong>(BMDEV_IOCTL_MAGIC, 0x59);
pub const BMDEV_GET_HEAP_NUM: u32 = iowr::<c_ulong>(BMDEV_IOCTL_MAGIC, 0x5a);
