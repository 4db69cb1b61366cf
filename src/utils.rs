#![allow(clippy::used_underscore_items, clippy::cast_possible_truncation)]

// ===============================================================================================
// ioctl Command Encoding
// ===============================================================================================

const _IOC_NRBITS: u32 = 8;
const _IOC_TYPEBITS: u32 = 8;
const _IOC_SIZEBITS: u32 = 14;

const _IOC_NRSHIFT: u32 = 0;
const _IOC_TYPESHIFT: u32 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u32 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u32 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_WRITE: u32 = 1;
const _IOC_READ: u32 = 2;

#[must_use]
pub const fn _ioc(dir: u32, magic: u8, nr: u32, size: usize) -> u32 {
    (dir << _IOC_DIRSHIFT)
        | ((magic as u32) << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)
}

#[must_use]
pub const fn iow<T>(magic: u8, nr: u32) -> u32 {
    _ioc(_IOC_WRITE, magic, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iowr<T>(magic: u8, nr: u32) -> u32 {
    _ioc(_IOC_READ | _IOC_WRITE, magic, nr, std::mem::size_of::<T>())
}

// ===============================================================================================
// Page and Alignment Math
// ===============================================================================================

/// Host page size assumed by the device mmap interface.
pub const PAGE_SIZE: u64 = 4096;

/// Rounds `value` up to the next multiple of `align` (power of two).
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Rounds `value` down to a multiple of `align` (power of two).
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Splits `total` bytes into `(offset, len)` pieces of at most `chunk` bytes, in address order.
pub fn chunks(total: u64, chunk: u64) -> impl Iterator<Item = (u64, u64)> {
    let count = if total == 0 { 1 } else { total.div_ceil(chunk) };
    (0..count).map(move |i| {
        let offset = i * chunk;
        (offset, (total - offset).min(chunk))
    })
}
