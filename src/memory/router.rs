//! CDMA address tagging for chip-to-chip copies.
//!
//! CDMA only spans the PCI functions of one physical card. Each side's address carries a tag:
//! `CDMA_LOCAL_TAG` for memory reached by the executing engine directly, or `CDMA_PEER_TAG` plus
//! the function number for memory behind the other function. At most one side is ever the peer.

use crate::context::DeviceContext;
use crate::error::{MemError, MemResult};

pub const CDMA_LOCAL_TAG: u64 = 0x3f << 36;
pub const CDMA_PEER_TAG: u64 = 0x3 << 40;
pub const CDMA_FUNC_SHIFT: u32 = 37;

const FUNC_MASK: u32 = 0x7;

/// Which device's CDMA engine executes the copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdmaEngine {
    Source,
    Destination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub src_addr: u64,
    pub dst_addr: u64,
    pub engine: CdmaEngine,
}

const fn peer_tag(bdf: u32) -> u64 {
    CDMA_PEER_TAG | ((bdf & FUNC_MASK) as u64) << CDMA_FUNC_SHIFT
}

/// Tags `src_addr`/`dst_addr` for a copy between the functions `src_bdf` and `dst_bdf`.
///
/// # Errors
/// `CrossCardUnsupported` if the two functions are on different cards.
pub fn route_bdf(
    src_bdf: u32,
    dst_bdf: u32,
    src_addr: u64,
    dst_addr: u64,
    force_dst_engine: bool,
) -> MemResult<Route> {
    if src_bdf & !FUNC_MASK != dst_bdf & !FUNC_MASK {
        log::error!(
            "only support transfer for same card src bdf = 0x{src_bdf:x}, dst bdf = 0x{dst_bdf:x}"
        );
        return Err(MemError::CrossCardUnsupported { src_bdf, dst_bdf });
    }

    let engine = if force_dst_engine {
        CdmaEngine::Destination
    } else {
        CdmaEngine::Source
    };

    let (src_addr, dst_addr) = if src_bdf & FUNC_MASK == dst_bdf & FUNC_MASK {
        (src_addr | CDMA_LOCAL_TAG, dst_addr | CDMA_LOCAL_TAG)
    } else if force_dst_engine {
        (src_addr | peer_tag(src_bdf), dst_addr | CDMA_LOCAL_TAG)
    } else {
        (src_addr | CDMA_LOCAL_TAG, dst_addr | peer_tag(dst_bdf))
    };

    log::debug!(
        "cdma src func {} dst func {}: src 0x{src_addr:x} dst 0x{dst_addr:x} via {engine:?}",
        src_bdf & FUNC_MASK,
        dst_bdf & FUNC_MASK
    );

    Ok(Route {
        src_addr,
        dst_addr,
        engine,
    })
}

/// Routes a copy between two open devices using their reported PCI identifiers.
///
/// # Errors
/// `CrossCardUnsupported` if the devices are on different cards.
pub fn route(
    src_ctx: &DeviceContext,
    dst_ctx: &DeviceContext,
    src_addr: u64,
    dst_addr: u64,
    force_dst_engine: bool,
) -> MemResult<Route> {
    route_bdf(
        src_ctx.info().domain_bdf as u32,
        dst_ctx.info().domain_bdf as u32,
        src_addr,
        dst_addr,
        force_dst_engine,
    )
}
