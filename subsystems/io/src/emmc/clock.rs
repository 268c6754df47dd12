//! SD clock divider

/// Identification clock
pub const SD_CLOCK_ID: u32 = 400_000;
/// Default speed (SDR12)
pub const SD_CLOCK_NORMAL: u32 = 25_000_000;

/// Largest value of the 10-bit divider
const MAX_DIVIDER: u32 = 0x3FF;

/// CONTROL1 clock field for running the card at no more than `target` Hz
///
/// Uses 10-bit divided clock mode with a power-of-two divider. The card
/// clock is `base / (2 * div)`, or `base` itself when `div` is zero.
pub fn divider(base: u32, target: u32) -> u32 {
    let wanted = if target > base {
        1
    } else {
        base.div_ceil(target.max(1))
    };

    // `wanted` is at least 1, so a bit is always set
    let mut shift = 31 - wanted.leading_zeros();
    if wanted & !(1 << shift) != 0 {
        shift += 1;
    }
    let shift = shift.min(31);

    let div = if shift == 0 { 0 } else { (1u32 << (shift - 1)).min(MAX_DIVIDER) };

    ((div & 0xFF) << 8) | (((div >> 8) & 0x3) << 6)
}

/// Card clock produced by a CONTROL1 clock field
pub fn rate(base: u32, field: u32) -> u32 {
    let div = ((field >> 8) & 0xFF) | (((field >> 6) & 0x3) << 8);
    if div == 0 {
        base
    } else {
        base / (2 * div)
    }
}
