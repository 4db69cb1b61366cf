mod common;

use std::sync::Arc;

use common::{Call, Recorder, context_over};
use tpu_mem::bmdev::cmodel::Cmodel;
use tpu_mem::bmdev::ioctl::CHIP2CHIP;
use tpu_mem::memory::router::{CDMA_LOCAL_TAG, CDMA_PEER_TAG, CDMA_FUNC_SHIFT};
use tpu_mem::memory::{DeviceMem, transfer};
use tpu_mem::{Config, DeviceContext, MemError};

const SRC: u64 = 0x1_0000_0000;
const DST: u64 = 0x1_2000_0000;

fn card_function(dev_id: u32, bdf: i32) -> (DeviceContext, Arc<Recorder>) {
    let cmodel = Arc::new(Cmodel::builder().domain_bdf(bdf).build());
    context_over(Recorder::new(cmodel), dev_id, Config::default())
}

fn c2c_calls(rec: &Recorder) -> Vec<(u64, u64, u64)> {
    rec.memcpys()
        .into_iter()
        .filter_map(|c| match c {
            Call::Memcpy {
                dir: CHIP2CHIP,
                device_addr,
                src_device_addr,
                size,
                ..
            } => Some((src_device_addr, device_addr, size)),
            _ => None,
        })
        .collect()
}

#[test]
fn source_engine_runs_by_default() {
    let (src_ctx, src_rec) = card_function(0, 0x0300);
    let (dst_ctx, dst_rec) = card_function(1, 0x0301);
    let src = DeviceMem::from_device(SRC, 256);
    let dst = DeviceMem::from_device(DST, 256);

    transfer::memcpy_c2c(&src_ctx, &dst_ctx, &src, &dst, false).unwrap();
    assert_eq!(
        c2c_calls(&src_rec),
        [(
            SRC | CDMA_LOCAL_TAG,
            DST | CDMA_PEER_TAG | 1 << CDMA_FUNC_SHIFT,
            256
        )]
    );
    assert!(dst_rec.calls().is_empty());
}

#[test]
fn forced_destination_engine() {
    let (src_ctx, src_rec) = card_function(0, 0x0302);
    let (dst_ctx, dst_rec) = card_function(1, 0x0300);
    let src = DeviceMem::from_device(SRC, 64);
    let dst = DeviceMem::from_device(DST, 64);

    transfer::memcpy_c2c(&src_ctx, &dst_ctx, &src, &dst, true).unwrap();
    assert!(src_rec.calls().is_empty());
    assert_eq!(
        c2c_calls(&dst_rec),
        [(
            SRC | CDMA_PEER_TAG | 2 << CDMA_FUNC_SHIFT,
            DST | CDMA_LOCAL_TAG,
            64
        )]
    );
}

#[test]
fn cross_card_is_rejected() {
    let (src_ctx, src_rec) = card_function(0, 0x0300);
    let (dst_ctx, _) = card_function(1, 0x0400);
    let mem = DeviceMem::from_device(SRC, 64);

    let err = transfer::memcpy_c2c(&src_ctx, &dst_ctx, &mem, &mem, false).unwrap_err();
    assert!(matches!(err, MemError::CrossCardUnsupported { .. }));
    assert!(src_rec.calls().is_empty());
}

#[test]
fn c2c_needs_hardware() {
    let a = DeviceContext::simulated(0, Arc::new(Cmodel::default()), Config::default()).unwrap();
    let b = DeviceContext::simulated(1, Arc::new(Cmodel::default()), Config::default()).unwrap();
    let mem = DeviceMem::from_device(SRC, 64);
    assert!(matches!(
        transfer::memcpy_c2c(&a, &b, &mem, &mem, false),
        Err(MemError::NotSupported(_))
    ));
}

#[test]
fn p2p_between_distinct_chips() {
    let (a, a_rec) = card_function(0, 0x0300);
    let (b, _) = card_function(3, 0x0500);
    let src = DeviceMem::from_device(SRC, 128);
    let dst = DeviceMem::from_device(DST, 128);

    transfer::memcpy_p2p(&a, &src, &b, &dst).unwrap();
    assert_eq!(
        a_rec.calls(),
        [Call::MemcpyP2p {
            src: SRC,
            dst: DST,
            dst_num: 3,
            size: 128
        }]
    );

    let (same, _) = card_function(0, 0x0300);
    assert!(matches!(
        transfer::memcpy_p2p(&a, &src, &same, &dst),
        Err(MemError::SameChip(0))
    ));
}

#[test]
fn p2p_is_a_no_op_on_the_simulator() {
    let a = DeviceContext::simulated(0, Arc::new(Cmodel::default()), Config::default()).unwrap();
    let b = DeviceContext::simulated(1, Arc::new(Cmodel::default()), Config::default()).unwrap();
    let mem = DeviceMem::from_device(SRC, 64);
    transfer::memcpy_p2p(&a, &mem, &b, &mem).unwrap();
}
