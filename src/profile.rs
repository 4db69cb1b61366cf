//! Observation hooks bracketing allocation, cache and copy operations.

/// Kind of memory operation reported to [`ProfileHooks::mem_end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Alloc,
    Free,
    Invalidate,
    Flush,
}

/// Purely observational; implementations must not influence the operation being recorded.
pub trait ProfileHooks: Send + Sync {
    fn mem_begin(&self) {}

    fn mem_end(&self, _op: MemOp, _addr: u64, _size: u64) {}

    fn memcpy_begin(&self) {}

    fn memcpy_end(&self, _host_addr: u64, _device_addr: u64, _size: u64, _dir: u32) {}
}
