//! Page-alignment and per-chip physical window checks.

use crate::context::ChipModel;
use crate::utils::PAGE_SIZE;

/// A device-physical window `[low, high)`.
///
/// A range may start anywhere below `high` and may end exactly at `high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub low: u64,
    pub high: u64,
}

impl Window {
    const fn new(low: u64, high: u64) -> Self {
        Self { low, high }
    }

    #[must_use]
    pub const fn holds_start(&self, addr: u64) -> bool {
        addr >= self.low && addr < self.high
    }

    #[must_use]
    pub const fn holds_end(&self, addr: u64) -> bool {
        addr >= self.low && addr <= self.high
    }
}

const BM1684_WINDOWS: &[Window] = &[
    Window::new(0x0, 0x1040_0000),
    Window::new(0x1_0000_0000, 0x5_0000_0000),
];

const BM1682_WINDOWS: &[Window] = &[Window::new(0x1_0000_0000, 0x3_0000_0000)];

/// Windows of `chip`, or `None` when the chip has no recorded restriction.
#[must_use]
pub const fn windows(chip: ChipModel) -> Option<&'static [Window]> {
    match chip {
        ChipModel::Bm1684 | ChipModel::Bm1686 => Some(BM1684_WINDOWS),
        ChipModel::Bm1682 => Some(BM1682_WINDOWS),
        ChipModel::Other(_) => None,
    }
}

#[must_use]
pub const fn page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

/// True when both ends of `[start, start + size]` fall into a window of `chip`.
///
/// The two ends are checked independently and may sit in different windows.
#[must_use]
pub fn range_valid(chip: ChipModel, start: u64, size: u64) -> bool {
    let Some(windows) = windows(chip) else {
        return true;
    };
    let Some(end) = start.checked_add(size) else {
        return false;
    };
    windows.iter().any(|w| w.holds_start(start)) && windows.iter().any(|w| w.holds_end(end))
}
