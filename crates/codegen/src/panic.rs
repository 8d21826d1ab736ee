//! Reason codes of the `Panic(uint256)` reverts emitted for runtime violations.

use alloy_primitives::U256;

/// Selector of `Panic(uint256)`.
pub const PANIC_SELECTOR: u32 = 0x4e48_7b71;

/// Selector of `Error(string)`.
pub const ERROR_SELECTOR: u32 = 0x08c3_79a0;

/// The reason code carried by a panic revert.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, strum::IntoStaticStr, strum::EnumIter,
)]
#[repr(u8)]
pub enum PanicCode {
    /// A failed `assert`.
    Assert = 0x01,
    /// Arithmetic overflow or underflow.
    UnderOverflow = 0x11,
    /// Division or modulo by zero.
    DivisionByZero = 0x12,
    /// Conversion of an out-of-range value to an enum.
    EnumConversionError = 0x21,
    /// `pop` on an empty array.
    EmptyArrayPop = 0x31,
    /// Out-of-bounds array or fixed bytes index.
    ArrayOutOfBounds = 0x32,
    /// Call of a zero-initialised internal function value.
    ZeroInitialisedFunction = 0x51,
}

impl PanicCode {
    /// The numeric reason code.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The first word of the revert data: the left-aligned selector.
    pub fn selector_word() -> U256 {
        U256::from(PANIC_SELECTOR) << 224
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_codes() {
        let codes: Vec<u8> = PanicCode::iter().map(PanicCode::code).collect();
        assert_eq!(codes, [0x01, 0x11, 0x12, 0x21, 0x31, 0x32, 0x51]);
        assert_eq!(<&str>::from(PanicCode::DivisionByZero), "DivisionByZero");
    }

    #[test]
    fn test_selector_word() {
        let word = PanicCode::selector_word().to_be_bytes::<32>();
        assert_eq!(&word[..4], &[0x4e, 0x48, 0x7b, 0x71]);
        assert!(word[4..].iter().all(|&b| b == 0));
    }
}
