use crate::bmdev::DeviceBackend;
use crate::bmdev::cmodel::{Cmodel, CmodelKernels};
use crate::bmdev::device::BmDevice;
use crate::bmdev::ioctl::MiscInfo;
use crate::config::{Config, Strictness};
use crate::error::{MemError, MemResult};
use crate::memory::descriptor::{MemKind, MemoryDescriptor};
use crate::memory::kernel::KernelLauncher;
use crate::memory::registry::AllocationRegistry;
use crate::memory::validator;
use crate::memory::width::SizeWidth;
use crate::profile::ProfileHooks;
use std::fmt;
use std::sync::Arc;

// ===============================================================================================
// Device Properties
// ===============================================================================================

/// Physical integration of host and accelerator, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Pcie,
    Soc,
    /// SoC-style memory reached over PCIe; no single-ioctl host copies.
    Mixed,
}

impl OperatingMode {
    /// Decodes `pcie_soc_mode`. Unknown values are treated as SoC.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Pcie,
            2 => Self::Mixed,
            _ => Self::Soc,
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Pcie => 0,
            Self::Soc => 1,
            Self::Mixed => 2,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pcie => "PCIe",
            Self::Soc => "SoC",
            Self::Mixed => "mixed",
        }
    }
}

/// Chip generations with distinct physical address windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipModel {
    Bm1682,
    Bm1684,
    Bm1686,
    Other(u32),
}

impl ChipModel {
    #[must_use]
    pub const fn from_id(id: u32) -> Self {
        match id {
            0x1682 => Self::Bm1682,
            0x1684 => Self::Bm1684,
            0x1686 => Self::Bm1686,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub const fn id(self) -> u32 {
        match self {
            Self::Bm1682 => 0x1682,
            Self::Bm1684 => 0x1684,
            Self::Bm1686 => 0x1686,
            Self::Other(id) => id,
        }
    }
}

// ===============================================================================================
// Context
// ===============================================================================================

/// One opened accelerator plus the per-device allocation bookkeeping.
///
/// The backend, chip properties and configuration are fixed at construction; the only mutable
/// state is the address-keyed [`AllocationRegistry`].
pub struct DeviceContext {
    dev_id: u32,
    backend: Arc<dyn DeviceBackend>,
    info: MiscInfo,
    chip: ChipModel,
    mode: OperatingMode,
    config: Config,
    registry: AllocationRegistry,
    kernels: Option<Arc<dyn KernelLauncher>>,
    profiler: Option<Arc<dyn ProfileHooks>>,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("dev_id", &self.dev_id)
            .field("backend", &self.backend)
            .field("chip", &self.chip)
            .field("mode", &self.mode)
            .field("config", &self.config)
            .field("live_allocations", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl DeviceContext {
    /// Opens hardware device `dev_id`.
    ///
    /// # Errors
    /// Returns an error if the device node cannot be opened or the misc-info query fails.
    pub fn open(dev_id: u32, config: Config) -> MemResult<Self> {
        let device = BmDevice::open(dev_id)?;
        Self::with_backend(dev_id, Arc::new(device), config)
    }

    /// Wraps a simulated device; device-side kernels run directly on it.
    ///
    /// # Errors
    /// Propagates a failing misc-info query.
    pub fn simulated(dev_id: u32, device: Arc<Cmodel>, config: Config) -> MemResult<Self> {
        let kernels = Arc::new(CmodelKernels::new(device.clone()));
        Ok(Self::with_backend(dev_id, device, config)?.with_kernel_launcher(kernels))
    }

    /// Builds a context over any backend, snapshotting its chip model and operating mode.
    ///
    /// # Errors
    /// Propagates a failing misc-info query.
    pub fn with_backend(
        dev_id: u32,
        backend: Arc<dyn DeviceBackend>,
        config: Config,
    ) -> MemResult<Self> {
        let info = backend
            .misc_info()
            .map_err(|e| MemError::from_driver("get misc info", e))?;
        let chip = ChipModel::from_id(info.chipid);
        let mode = OperatingMode::from_raw(info.pcie_soc_mode);

        log::info!(
            "dev {dev_id}: chip 0x{:x}, {} mode{}",
            chip.id(),
            mode.name(),
            if backend.is_simulated() { " (simulated)" } else { "" }
        );

        Ok(Self {
            dev_id,
            backend,
            info,
            chip,
            mode,
            config,
            registry: AllocationRegistry::new(),
            kernels: None,
            profiler: None,
        })
    }

    #[must_use]
    pub fn with_kernel_launcher(mut self, kernels: Arc<dyn KernelLauncher>) -> Self {
        self.kernels = Some(kernels);
        self
    }

    #[must_use]
    pub fn with_profiler(mut self, profiler: Arc<dyn ProfileHooks>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    #[must_use]
    pub const fn dev_id(&self) -> u32 {
        self.dev_id
    }

    #[must_use]
    pub const fn chip(&self) -> ChipModel {
        self.chip
    }

    #[must_use]
    pub const fn mode(&self) -> OperatingMode {
        self.mode
    }

    #[must_use]
    pub const fn info(&self) -> &MiscInfo {
        &self.info
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &AllocationRegistry {
        &self.registry
    }

    #[must_use]
    pub fn backend(&self) -> &dyn DeviceBackend {
        self.backend.as_ref()
    }

    #[must_use]
    pub fn is_simulated(&self) -> bool {
        self.backend.is_simulated()
    }

    pub(crate) fn kernels(&self) -> MemResult<&dyn KernelLauncher> {
        self.kernels
            .as_deref()
            .ok_or_else(|| MemError::NotSupported("no kernel launcher attached".into()))
    }

    // ===========================================================================================
    // Shared Checks
    // ===========================================================================================

    /// Fails with `RangeInvalid` unless `[addr, addr + size]` fits the chip's windows.
    ///
    /// Always passes on a simulated backend.
    pub(crate) fn check_range(&self, addr: u64, size: u64) -> MemResult<()> {
        if self.is_simulated() || validator::range_valid(self.chip, addr, size) {
            return Ok(());
        }
        log::error!(
            "dev {}: saddr=0x{addr:x} eaddr=0x{:x} out of range",
            self.dev_id,
            addr.wrapping_add(size)
        );
        Err(MemError::RangeInvalid { addr, size })
    }

    /// Fails with `UnsupportedMode` when the device is in pure PCIe mode.
    pub(crate) fn require_soc_like(&self, op: &'static str) -> MemResult<()> {
        if self.mode == OperatingMode::Pcie {
            log::error!("dev {}: {op} is not supported in PCIe mode", self.dev_id);
            return Err(MemError::UnsupportedMode {
                op,
                mode: self.mode.name(),
            });
        }
        Ok(())
    }

    /// Checks a descriptor's kind against the configured strictness.
    pub(crate) fn expect_kind<W: SizeWidth>(
        &self,
        mem: &MemoryDescriptor<W>,
        expected: MemKind,
        op: &str,
    ) -> MemResult<()> {
        if mem.kind() == expected {
            return Ok(());
        }
        match self.config.strictness {
            Strictness::Warn => {
                log::warn!("{op}: mem type is illegal ({:?}, expected {expected:?})", mem.kind());
                Ok(())
            }
            Strictness::Error => Err(MemError::TypeMismatch {
                expected,
                found: mem.kind(),
            }),
        }
    }

    pub(crate) fn profile(&self, f: impl FnOnce(&dyn ProfileHooks)) {
        if let Some(p) = self.profiler.as_deref() {
            f(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_decoding() {
        assert_eq!(OperatingMode::from_raw(0), OperatingMode::Pcie);
        assert_eq!(OperatingMode::from_raw(1), OperatingMode::Soc);
        assert_eq!(OperatingMode::from_raw(2), OperatingMode::Mixed);
        for m in [OperatingMode::Pcie, OperatingMode::Soc, OperatingMode::Mixed] {
            assert_eq!(OperatingMode::from_raw(m.as_raw()), m);
        }
    }

    #[test]
    fn chip_ids_round_trip() {
        for id in [0x1682, 0x1684, 0x1686, 0x1688] {
            assert_eq!(ChipModel::from_id(id).id(), id);
        }
        assert_eq!(ChipModel::from_id(0x1688), ChipModel::Other(0x1688));
    }

    #[test]
    fn simulated_context_snapshots_device_info() {
        let dev = Arc::new(Cmodel::builder().chip_id(0x1686).mode(OperatingMode::Soc).build());
        let ctx = DeviceContext::simulated(3, dev, Config::default()).unwrap();
        assert_eq!(ctx.dev_id(), 3);
        assert_eq!(ctx.chip(), ChipModel::Bm1686);
        assert_eq!(ctx.mode(), OperatingMode::Soc);
        assert!(ctx.is_simulated());
        assert!(ctx.kernels().is_ok());
        assert!(ctx.check_range(0, u64::MAX).is_ok());
    }

    #[test]
    fn strict_kind_check() {
        let dev = Arc::new(Cmodel::default());
        let warn = DeviceContext::simulated(0, dev.clone(), Config::default()).unwrap();
        let strict = DeviceContext::simulated(
            0,
            dev,
            Config::default().with_strictness(Strictness::Error),
        )
        .unwrap();
        let sys = crate::memory::descriptor::DeviceMemU64::from_system(std::ptr::null_mut(), 4);

        assert!(warn.expect_kind(&sys, MemKind::Device, "test").is_ok());
        assert!(matches!(
            strict.expect_kind(&sys, MemKind::Device, "test"),
            Err(MemError::TypeMismatch {
                expected: MemKind::Device,
                found: MemKind::System
            })
        ));
    }
}
