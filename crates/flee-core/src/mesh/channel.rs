//! 2.4 GHz O-QPSK channel numbering

/// Lowest usable channel
pub const FIRST: u8 = 11;

/// Highest usable channel
pub const LAST: u8 = 26;

/// Number of usable channels
pub const COUNT: usize = (LAST - FIRST + 1) as usize;

/// Channel value marking a link whose slot must not be used
pub const PRUNED: u8 = 0;

pub fn is_valid(channel: u8) -> bool {
    (FIRST..=LAST).contains(&channel)
}

/// Next channel in rotation, wrapping 26 back to 11
///
/// Anything outside the band restarts the rotation at 11.
pub fn next(channel: u8) -> u8 {
    if channel >= FIRST && channel < LAST {
        channel + 1
    } else {
        FIRST
    }
}
