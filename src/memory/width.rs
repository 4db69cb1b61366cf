use std::fmt::Debug;

/// Integer width of a descriptor's size field.
///
/// The 32-bit and 64-bit descriptor families share every operation; only the range of
/// representable sizes differs.
pub trait SizeWidth: Copy + Debug + Default + Eq + Send + Sync + 'static + Into<u64> {
    const MAX: u64;
    const NAME: &'static str;
    /// True for descriptors that travel through the `_U64` driver commands.
    const WIDE: bool;

    /// Narrows `value`, returning `None` if it does not fit.
    fn from_u64(value: u64) -> Option<Self>;
}

impl SizeWidth for u32 {
    const MAX: u64 = u32::MAX as u64;
    const NAME: &'static str = "u32";
    const WIDE: bool = false;

    fn from_u64(value: u64) -> Option<Self> {
        u32::try_from(value).ok()
    }
}

impl SizeWidth for u64 {
    const MAX: u64 = u64::MAX;
    const NAME: &'static str = "u64";
    const WIDE: bool = true;

    fn from_u64(value: u64) -> Option<Self> {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowing() {
        assert_eq!(<u32 as SizeWidth>::from_u64(0xFFFF_FFFF), Some(u32::MAX));
        assert_eq!(<u32 as SizeWidth>::from_u64(0x1_0000_0000), None);
        assert_eq!(<u64 as SizeWidth>::from_u64(0x1_0000_0000), Some(0x1_0000_0000));
    }
}
