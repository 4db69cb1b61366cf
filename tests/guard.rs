mod common;

use std::env;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::sync::Arc;

use common::hardware;
use tpu_mem::bmdev::cmodel::Cmodel;
use tpu_mem::memory::guard::{GUARD_PATTERN, GUARD_SIZE};
use tpu_mem::memory::{DeviceMem, allocator, transfer};
use tpu_mem::{Config, DeviceContext, GuardPolicy, MemError, OperatingMode};

fn guarded(dump_dir: &std::path::Path) -> Config {
    Config::default()
        .with_mem_guard(true)
        .with_guard_policy(GuardPolicy::ReturnError)
        .with_dump_dir(dump_dir)
}

fn guarded_simulator(dump_dir: &std::path::Path) -> DeviceContext {
    DeviceContext::simulated(0, Arc::new(Cmodel::default()), guarded(dump_dir)).unwrap()
}

/// Writes `len` bytes starting at the buffer, ignoring its logical size.
fn overrun(ctx: &DeviceContext, mem: &DeviceMem, len: u32) {
    let wide = DeviceMem::from_device(mem.device_addr(), len);
    transfer::memcpy_s2d(ctx, &wide, &vec![0xEE; len as usize]).unwrap();
}

#[test]
fn intact_guard_frees_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = guarded_simulator(dir.path());
    let mem: DeviceMem = allocator::malloc_device_byte(&ctx, 100).unwrap();
    transfer::memcpy_s2d(&ctx, &mem, &[1u8; 100]).unwrap();
    allocator::free(&ctx, &mem).unwrap();
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn one_byte_overrun_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = guarded_simulator(dir.path());
    let mem: DeviceMem = allocator::malloc_device_byte(&ctx, 100).unwrap();
    overrun(&ctx, &mem, 101);

    let addr = mem.device_addr();
    let err = allocator::free(&ctx, &mem).unwrap_err();
    assert!(matches!(err, MemError::GuardCorruption { addr: a, size: 100 } if a == addr));

    let dumped = fs::read(dir.path().join(format!("device_data_0x{addr:x}_100.dat"))).unwrap();
    assert_eq!(dumped.len(), GUARD_SIZE as usize);
    assert_eq!(dumped[0], 0xEE);
    assert_eq!(&dumped[1..], &GUARD_PATTERN[1..]);
    assert_eq!(fs::read(dir.path().join("guard_data.dat")).unwrap(), GUARD_PATTERN);
}

#[test]
fn corrupted_buffer_stays_tracked() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = guarded_simulator(dir.path());
    let addr = allocator::malloc_device_mem(&ctx, 0, 4096).unwrap();
    let mem = DeviceMem::from_device(addr, 4096);
    overrun(&ctx, &mem, 4096 + 2);

    let err = allocator::free_device_mem(&ctx, addr).unwrap_err();
    assert!(matches!(err, MemError::GuardCorruption { .. }));
    assert!(ctx.registry().find(addr).is_some());

    // Restoring the trailer lets the buffer go.
    let trailer = DeviceMem::from_device(addr + 4096, GUARD_SIZE as u32);
    transfer::memcpy_s2d(&ctx, &trailer, &GUARD_PATTERN).unwrap();
    allocator::free_device_mem(&ctx, addr).unwrap();
    assert!(ctx.registry().is_empty());
}

#[test]
fn guard_works_through_soc_paths() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, _) = hardware(OperatingMode::Soc, guarded(dir.path()));
    for size in [100u64, 4096] {
        let mem: DeviceMem = allocator::malloc_device_byte(&ctx, size).unwrap();
        allocator::free(&ctx, &mem).unwrap();

        let mem: DeviceMem = allocator::malloc_device_byte(&ctx, size).unwrap();
        overrun(&ctx, &mem, size as u32 + 1);
        assert!(matches!(
            allocator::free(&ctx, &mem),
            Err(MemError::GuardCorruption { .. })
        ));
    }
}

/// Set in the re-executed child of `default_policy_dumps_then_aborts`.
const ABORT_CHILD_ENV: &str = "TPU_MEM_GUARD_ABORT_CHILD";

#[test]
fn default_policy_dumps_then_aborts() {
    if env::var_os(ABORT_CHILD_ENV).is_some() {
        // Default policy, default dump directory (the working directory).
        let config = Config::default().with_mem_guard(true);
        assert_eq!(config.guard_policy, GuardPolicy::Abort);
        let ctx = DeviceContext::simulated(0, Arc::new(Cmodel::default()), config).unwrap();
        let mem: DeviceMem = allocator::malloc_device_byte(&ctx, 100).unwrap();
        overrun(&ctx, &mem, 101);
        let _ = allocator::free(&ctx, &mem);
        // Reaching this line means the process survived corruption.
        std::process::exit(0);
    }

    let dir = tempfile::tempdir().unwrap();
    let status = Command::new(env::current_exe().unwrap())
        .args(["--exact", "default_policy_dumps_then_aborts", "--test-threads=1"])
        .env(ABORT_CHILD_ENV, "1")
        .current_dir(dir.path())
        .status()
        .unwrap();
    assert!(!status.success());
    assert_eq!(status.signal(), Some(libc::SIGABRT));

    let dumps: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("device_data_0x") && name.ends_with("_100.dat"))
        .collect();
    assert_eq!(dumps.len(), 1);
    let dumped = fs::read(dir.path().join(&dumps[0])).unwrap();
    assert_eq!(dumped[0], 0xEE);
    assert_eq!(fs::read(dir.path().join("guard_data.dat")).unwrap(), GUARD_PATTERN);
}
