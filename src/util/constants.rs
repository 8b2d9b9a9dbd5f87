//! Word-size and layout constants for the modeled address space.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// log2 of the number of bytes in a word
        pub const LOG_BYTES_IN_WORD: usize = 3;
    } else {
        /// log2 of the number of bytes in a word
        pub const LOG_BYTES_IN_WORD: usize = 2;
    }
}

/// bytes in a platform word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;

/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: usize = 3;
/// bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;
/// bits in a platform word
pub const BITS_IN_WORD: usize = BYTES_IN_WORD * BITS_IN_BYTE;

/// Stress-allocation period meaning "stress mode off".
pub const DEFAULT_STRESS_PERIOD: usize = usize::MAX;
