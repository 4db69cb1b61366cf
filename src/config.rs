use std::env;
use std::path::PathBuf;

use crate::bmdev::ioctl::BMLIB_NOT_USE_IOMMU;

pub const DEFAULT_KERNEL_MODULE: &str = "/opt/sophon/libsophon-current/lib/dyn_load/memory_op.so";

/// How a descriptor whose kind does not match the operation is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Log a warning and continue with the raw address field.
    #[default]
    Warn,
    /// Fail the operation with `MemError::TypeMismatch`.
    Error,
}

/// What happens once a guard trailer is found overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuardPolicy {
    /// Dump diagnostics and abort the process.
    #[default]
    Abort,
    /// Dump diagnostics and return `MemError::GuardCorruption`. The buffer is not released.
    ReturnError,
}

/// Per-context behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mem_guard: bool,
    pub strictness: Strictness,
    pub guard_policy: GuardPolicy,
    /// Directory receiving `device_data_*.dat` / `guard_data.dat` on corruption.
    pub dump_dir: PathBuf,
    /// Dynamic module holding the device-side memory kernels.
    pub kernel_module: PathBuf,
    pub cdma_iommu_mode: u32,
    /// Use interrupt completion for the default copy entry points.
    pub use_interrupt: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mem_guard: false,
            strictness: Strictness::Warn,
            guard_policy: GuardPolicy::Abort,
            dump_dir: PathBuf::from("."),
            kernel_module: PathBuf::from(DEFAULT_KERNEL_MODULE),
            cdma_iommu_mode: BMLIB_NOT_USE_IOMMU,
            use_interrupt: false,
        }
    }
}

impl Config {
    /// Builds a config from defaults overridden by `TPU_MEM_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_flag("TPU_MEM_GUARD") {
            cfg.mem_guard = v;
        }
        if let Ok(val) = env::var("TPU_MEM_STRICT") {
            match parse_bool(&val) {
                Some(true) => cfg.strictness = Strictness::Error,
                Some(false) => cfg.strictness = Strictness::Warn,
                None => log::warn!("ignoring TPU_MEM_STRICT={val}"),
            }
        }
        if let Ok(val) = env::var("TPU_MEM_GUARD_POLICY") {
            match val.to_ascii_lowercase().as_str() {
                "abort" => cfg.guard_policy = GuardPolicy::Abort,
                "error" => cfg.guard_policy = GuardPolicy::ReturnError,
                _ => log::warn!("ignoring TPU_MEM_GUARD_POLICY={val}"),
            }
        }
        if let Ok(dir) = env::var("TPU_MEM_DUMP_DIR") {
            cfg.dump_dir = PathBuf::from(dir);
        }
        if let Ok(path) = env::var("TPU_MEM_KERNEL_MODULE") {
            cfg.kernel_module = PathBuf::from(path);
        }
        if let Ok(val) = env::var("TPU_MEM_CDMA_IOMMU") {
            match val.parse::<u32>() {
                Ok(mode) => cfg.cdma_iommu_mode = mode,
                Err(_) => log::warn!("ignoring TPU_MEM_CDMA_IOMMU={val}"),
            }
        }
        if let Some(v) = env_flag("TPU_MEM_CDMA_INTR") {
            cfg.use_interrupt = v;
        }

        cfg
    }

    #[must_use]
    pub const fn with_mem_guard(mut self, enabled: bool) -> Self {
        self.mem_guard = enabled;
        self
    }

    #[must_use]
    pub const fn with_strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    #[must_use]
    pub const fn with_guard_policy(mut self, policy: GuardPolicy) -> Self {
        self.guard_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_cdma_iommu_mode(mut self, mode: u32) -> Self {
        self.cdma_iommu_mode = mode;
        self
    }

    #[must_use]
    pub const fn with_interrupt(mut self, enabled: bool) -> Self {
        self.use_interrupt = enabled;
        self
    }

    #[must_use]
    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_kernel_module(mut self, path: impl Into<PathBuf>) -> Self {
        self.kernel_module = path.into();
        self
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let val = env::var(name).ok()?;
    let parsed = parse_bool(&val);
    if parsed.is_none() {
        log::warn!("ignoring {name}={val}");
    }
    parsed
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_permissive() {
        let cfg = Config::default();
        assert!(!cfg.mem_guard);
        assert_eq!(cfg.strictness, Strictness::Warn);
        assert_eq!(cfg.guard_policy, GuardPolicy::Abort);
        assert_eq!(cfg.kernel_module, PathBuf::from(DEFAULT_KERNEL_MODULE));
    }

    #[test]
    fn builder_chains() {
        let cfg = Config::default()
            .with_mem_guard(true)
            .with_strictness(Strictness::Error)
            .with_guard_policy(GuardPolicy::ReturnError)
            .with_dump_dir("/tmp/dumps");
        assert!(cfg.mem_guard);
        assert_eq!(cfg.strictness, Strictness::Error);
        assert_eq!(cfg.guard_policy, GuardPolicy::ReturnError);
        assert_eq!(cfg.dump_dir, PathBuf::from("/tmp/dumps"));
    }

    #[test]
    fn bool_parsing() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
