//! Trailing canary written past the logical end of guarded allocations.

use crate::config::GuardPolicy;
use crate::context::DeviceContext;
use crate::error::{MemError, MemResult};
use crate::memory::transfer;
use std::fs;
use std::path::Path;

pub const GUARD_SIZE: u64 = 1024;
pub const GUARD_BYTE: u8 = 0x0A;

pub static GUARD_PATTERN: [u8; GUARD_SIZE as usize] = [GUARD_BYTE; GUARD_SIZE as usize];

/// Writes the canary at `addr + size`.
pub(crate) fn write_guard(ctx: &DeviceContext, addr: u64, size: u64) -> MemResult<()> {
    transfer::write_device(ctx, addr + size, &GUARD_PATTERN)
}

/// Re-reads the canary at `addr + size` and applies the configured [`GuardPolicy`] on mismatch.
///
/// A failed read is logged and treated as intact.
pub(crate) fn check_guard(ctx: &DeviceContext, addr: u64, size: u64) -> MemResult<()> {
    let mut device_data = [0u8; GUARD_SIZE as usize];
    if let Err(e) = transfer::read_device(ctx, &mut device_data, addr + size) {
        log::warn!("mem guard fetch data failed! addr=0x{addr:x}, size={size}: {e}");
        return Ok(());
    }
    if device_data == GUARD_PATTERN {
        return Ok(());
    }

    dump(&ctx.config().dump_dir, addr, size, &device_data);
    log::error!("mem guard check data failed! addr=0x{addr:x}, size={size}");

    match ctx.config().guard_policy {
        GuardPolicy::Abort => std::process::abort(),
        GuardPolicy::ReturnError => Err(MemError::GuardCorruption { addr, size }),
    }
}

fn dump(dir: &Path, addr: u64, size: u64, device_data: &[u8]) {
    let files = [
        (dir.join(format!("device_data_0x{addr:x}_{size}.dat")), device_data),
        (dir.join("guard_data.dat"), &GUARD_PATTERN[..]),
    ];
    for (path, data) in files {
        if let Err(e) = fs::write(&path, data) {
            log::warn!("failed to write {}: {e}", path.display());
        }
    }
}
