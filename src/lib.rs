//! Host-side memory management for TPU accelerators.
//!
//! A [`DeviceContext`] wraps one opened device (hardware or the in-process cmodel). The
//! [`memory`] module holds the operations: allocation with optional guard trailers, host/device
//! transfers chosen per operating mode, cache maintenance, device-side copies and chip-to-chip
//! routing.

pub mod bmdev;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod profile;
pub mod utils;

pub use config::{Config, GuardPolicy, Strictness};
pub use context::{ChipModel, DeviceContext, OperatingMode};
pub use error::{MemError, MemResult};
pub use memory::{DeviceMem, DeviceMemU64, MemKind, MemoryDescriptor};
