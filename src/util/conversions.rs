use crate::util::constants::*;
use crate::util::Address;
use crate::util::ByteSize;

/* Alignment */

pub fn is_word_aligned(addr: Address) -> bool {
    addr.is_aligned_to(BYTES_IN_WORD)
}

pub const fn word_align_up(bytes: ByteSize) -> ByteSize {
    raw_align_up(bytes, BYTES_IN_WORD)
}

pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/e620d0f337d0643c757bab791fc7d88d63217704/src/libcore/alloc.rs#L192
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !align.wrapping_sub(1)
}

pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}

/* Conversion */

pub const fn words_to_bytes(words: usize) -> ByteSize {
    words << LOG_BYTES_IN_WORD
}

pub const fn bytes_to_words_up(bytes: ByteSize) -> usize {
    (bytes + BYTES_IN_WORD - 1) >> LOG_BYTES_IN_WORD
}

/// Bytes to words for an extent that must already be a whole number of words.
pub fn bytes_to_words(bytes: ByteSize) -> usize {
    let words = bytes_to_words_up(bytes);
    debug_assert!(
        words_to_bytes(words) == bytes,
        "extent of {} bytes is not a whole number of words",
        bytes
    );
    words
}
