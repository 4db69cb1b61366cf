mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{Call, CountingProfiler, Recorder, context_over, hardware};
use tpu_mem::bmdev::cmodel::Cmodel;
use tpu_mem::bmdev::ioctl::ANY_HEAP_MASK;
use tpu_mem::memory::guard::GUARD_SIZE;
use tpu_mem::memory::{DeviceMem, DeviceMemU64, allocator, transfer};
use tpu_mem::profile::MemOp;
use tpu_mem::{Config, DeviceContext, MemError, OperatingMode, Strictness};

fn simulated() -> DeviceContext {
    DeviceContext::simulated(0, Arc::new(Cmodel::default()), Config::default()).unwrap()
}

#[test]
fn allocate_fill_read_free() {
    let ctx = simulated();
    let mem: DeviceMem = allocator::malloc_device_byte_heap_mask(&ctx, 0b111, 4096).unwrap();
    assert_eq!(mem.size(), 4096);
    assert!(mem.heap_id() < 3);

    transfer::memcpy_s2d(&ctx, &mem, &[0xA5; 4096]).unwrap();
    let mut out = vec![0u8; 4096];
    transfer::memcpy_d2s(&ctx, &mut out, &mem).unwrap();
    assert!(out.iter().all(|&b| b == 0xA5));

    allocator::free_device(&ctx, &mem).unwrap();
    let again = allocator::free_device(&ctx, &mem).unwrap_err();
    assert!(matches!(
        again,
        MemError::InvalidHandle(_) | MemError::NotFound(_)
    ));
    assert!(ctx.registry().is_empty());
}

#[test]
fn exhausted_heap_reports_out_of_memory() {
    let cmodel = Arc::new(Cmodel::builder().heap_sizes(&[1 << 20]).build());
    let ctx = DeviceContext::simulated(0, cmodel, Config::default()).unwrap();
    let big: DeviceMem = allocator::malloc_device_byte(&ctx, 1 << 20).unwrap();
    let err = allocator::malloc_device_byte::<u32>(&ctx, 1).unwrap_err();
    assert!(matches!(err, MemError::OutOfMemory));
    allocator::free(&ctx, &big).unwrap();
}

#[test]
fn mask_restricts_heap() {
    let ctx = simulated();
    for heap in 0..3 {
        let mem: DeviceMemU64 =
            allocator::malloc_device_byte_heap_mask(&ctx, 1 << heap, 64).unwrap();
        assert_eq!(mem.heap_id(), heap);
        assert_eq!(
            allocator::heap_stat_byte_by_id(&ctx, heap).unwrap().mem_used,
            4096
        );
        allocator::free(&ctx, &mem).unwrap();
    }
}

#[test]
fn address_keyed_sequences_stay_consistent() {
    let ctx = simulated();
    let sizes = [64u64, 100, 4096, 4097, 12288, 1];
    let mut live = Vec::new();

    for (i, &size) in sizes.iter().enumerate() {
        let addr = allocator::malloc_device_mem_mask(&ctx, ANY_HEAP_MASK, size).unwrap();
        let record = ctx.registry().find(addr).unwrap();
        assert_eq!(record.descriptor.size(), size);
        live.push((addr, size));

        // Free every other allocation as we go.
        if i % 2 == 1 {
            let (addr, _) = live.remove(0);
            allocator::free_device_mem(&ctx, addr).unwrap();
            assert!(ctx.registry().find(addr).is_none());
        }
        for &(addr, size) in &live {
            assert_eq!(ctx.registry().find(addr).unwrap().descriptor.size(), size);
        }
    }

    for (addr, _) in live {
        allocator::free_device_mem(&ctx, addr).unwrap();
    }
    assert!(ctx.registry().is_empty());
    assert!(matches!(
        allocator::free_device_mem(&ctx, 0x1_0000_0000),
        Err(MemError::NotFound(0x1_0000_0000))
    ));
}

#[test]
fn bm1682_sizes_round_to_words() {
    let cmodel = Arc::new(Cmodel::builder().chip_id(0x1682).build());
    let (ctx, _) = context_over(Recorder::new(cmodel), 0, Config::default());
    let mem: DeviceMem = allocator::malloc_device_byte(&ctx, 5).unwrap();
    assert_eq!(mem.size(), 8);
    allocator::free(&ctx, &mem).unwrap();
}

#[test]
fn free_command_follows_descriptor_width() {
    let config = Config::default().with_mem_guard(true);
    let (ctx, rec) = hardware(OperatingMode::Pcie, config);

    let narrow: DeviceMem = allocator::malloc_device_byte(&ctx, 100).unwrap();
    let wide: DeviceMemU64 = allocator::malloc_device_byte(&ctx, 200).unwrap();
    allocator::free(&ctx, &narrow).unwrap();
    allocator::free(&ctx, &wide).unwrap();

    let frees: Vec<Call> = rec
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Free { .. }))
        .collect();
    assert_eq!(
        frees,
        [
            Call::Free {
                addr: narrow.device_addr(),
                size: 100 + GUARD_SIZE,
                wide: false,
            },
            Call::Free {
                addr: wide.device_addr(),
                size: 200 + GUARD_SIZE,
                wide: true,
            },
        ]
    );
}

#[test]
fn freeing_an_implausible_address_fails() {
    let (ctx, _) = hardware(OperatingMode::Pcie, Config::default());
    let mem = DeviceMem::from_device(0x1000, 16);
    assert!(matches!(
        allocator::free(&ctx, &mem),
        Err(MemError::RangeInvalid { addr: 0x1000, .. })
    ));
}

#[test]
fn soc_allocation_invalidates_new_buffer() {
    let (ctx, rec) = hardware(OperatingMode::Soc, Config::default());
    let mem: DeviceMem = allocator::malloc_device_byte(&ctx, 4096).unwrap();
    assert_eq!(rec.count(|c| matches!(c, Call::Invalidate(_))), 1);
    allocator::free(&ctx, &mem).unwrap();

    let (pcie, rec) = hardware(OperatingMode::Pcie, Config::default());
    let _mem: DeviceMem = allocator::malloc_device_byte(&pcie, 4096).unwrap();
    assert_eq!(rec.count(|c| matches!(c, Call::Invalidate(_))), 0);
}

#[test]
fn profiler_brackets_alloc_and_free() {
    let profiler = Arc::new(CountingProfiler::default());
    let ctx = simulated().with_profiler(profiler.clone());

    let mem: DeviceMem = allocator::malloc_device_byte(&ctx, 128).unwrap();
    transfer::memcpy_s2d(&ctx, &mem, &[0u8; 128]).unwrap();
    allocator::free(&ctx, &mem).unwrap();

    assert_eq!(profiler.mem_begin.load(Ordering::SeqCst), 2);
    let ends = profiler.mem_end.lock().unwrap().clone();
    let addr = mem.device_addr();
    assert_eq!(ends, [(MemOp::Alloc, addr, 128), (MemOp::Free, addr, 128)]);
    assert_eq!(profiler.memcpy_begin.load(Ordering::SeqCst), 1);
    assert_eq!(profiler.memcpy_end.load(Ordering::SeqCst), 1);
}

#[test]
fn strict_mode_rejects_system_descriptor() {
    let config = Config::default().with_strictness(Strictness::Error);
    let ctx = DeviceContext::simulated(0, Arc::new(Cmodel::default()), config).unwrap();
    let mut host = [0u8; 16];
    let sys = DeviceMem::from_system(host.as_mut_ptr(), 16);
    assert!(matches!(
        allocator::free(&ctx, &sys),
        Err(MemError::TypeMismatch { .. })
    ));
    assert!(matches!(
        transfer::memcpy_s2d(&ctx, &sys, &[0u8; 16]),
        Err(MemError::TypeMismatch { .. })
    ));
}

#[test]
fn heap_id_query() {
    let (ctx, _) = hardware(OperatingMode::Pcie, Config::default());
    let mem: DeviceMem = allocator::malloc_device_byte_heap(&ctx, 1, 64).unwrap();
    assert_eq!(allocator::get_gmem_heap_id(&ctx, &mem).unwrap(), 1);

    let null = DeviceMem::default();
    assert!(allocator::get_gmem_heap_id(&ctx, &null).is_err());
}

#[test]
fn memory_totals_track_allocations() {
    let ctx = simulated();
    let total = allocator::total_gmem(&ctx).unwrap();
    assert_eq!(allocator::avail_gmem(&ctx).unwrap(), total);

    let mem: DeviceMemU64 = allocator::malloc_neuron_device(&ctx, 2, 3, 4, 5).unwrap();
    assert_eq!(mem.size(), 2 * 3 * 4 * 5 * 4);
    assert_eq!(allocator::avail_gmem(&ctx).unwrap(), total - 4096);
    allocator::free(&ctx, &mem).unwrap();
    assert_eq!(allocator::avail_gmem(&ctx).unwrap(), total);
}
