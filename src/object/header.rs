//! The object header codec.
//!
//! The first word of every allocated block carries a 2-bit tag that alone
//! determines the offset from block start to object start and the formula
//! for the body size:
//!
//! - instance blocks are `[class]`: the header word is the class (or
//!   association) pointer itself, whose low bits are zero by alignment;
//! - array blocks are `[length][class]`, the length word tagged;
//! - method blocks are `[info][extra…][length][info][class]`: the info
//!   word encodes the total header size in words because the prologue
//!   (exception table, debug data) is variable length. It is stored both
//!   at block start, so a scan can find the object, and just before the
//!   class word, so the block can be recovered from the object.
//!
//! For every kind the class slot is the word immediately before the
//! object, and holds either a class or an association pointer; the two
//! cases are discriminated through [`ClassSlot`], never by casting.

use crate::error::{MemoryError, Result};
use crate::heap::space::MemorySpace;
use crate::object::classtable::ClassLayout;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::conversions;
use crate::util::{Address, ByteSize};

pub const HEADER_TAG_BITS: usize = 2;
pub const HEADER_TAG_MASK: usize = (1 << HEADER_TAG_BITS) - 1;

/// An aligned class/association pointer; low bits zero.
pub const TAG_INSTANCE: usize = 0b00;
pub const TAG_ARRAY: usize = 0b01;
/// Written over the class slot of an object the collector has moved.
pub const TAG_FORWARDED: usize = 0b10;
pub const TAG_METHOD: usize = 0b11;

/// Largest array length (and method header word count) the tagged header
/// word can carry.
pub const MAX_ARRAY_LENGTH: usize = (1 << 26) - 1;

/// Method header words when the prologue carries no extra data: leading
/// info word, length word, trailing info word, defining class word.
pub const MIN_METHOD_HEADER_WORDS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderTag {
    Instance,
    Array,
    Method,
}

/// The two things a class slot can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassSlot {
    Class(Address),
    Association(Address),
}

pub fn tag_of(word: usize) -> usize {
    word & HEADER_TAG_MASK
}

/// Pack an array length into a tagged header word. Lengths beyond the
/// encodable range fail as an allocation error rather than truncate.
pub fn encode_length_word(length: usize) -> Result<usize> {
    if length > MAX_ARRAY_LENGTH {
        return Err(MemoryError::OutOfMemory {
            reason: format!(
                "array length {} exceeds the encodable maximum {}",
                length, MAX_ARRAY_LENGTH
            ),
        });
    }
    Ok((length << HEADER_TAG_BITS) | TAG_ARRAY)
}

pub fn decode_length_word(word: usize) -> usize {
    debug_assert_eq!(tag_of(word), TAG_ARRAY, "not a length word: {:#x}", word);
    word >> HEADER_TAG_BITS
}

/// Pack a method header size (in words) into the tagged info word.
pub fn encode_method_info(header_words: usize) -> usize {
    debug_assert!(header_words >= MIN_METHOD_HEADER_WORDS);
    debug_assert!(header_words <= MAX_ARRAY_LENGTH);
    (header_words << HEADER_TAG_BITS) | TAG_METHOD
}

pub fn decode_method_info(word: usize) -> usize {
    debug_assert_eq!(tag_of(word), TAG_METHOD, "not a method info word: {:#x}", word);
    word >> HEADER_TAG_BITS
}

pub fn header_tag(mem: &MemorySpace, block: Address) -> HeaderTag {
    match tag_of(mem.load_word(block)) {
        TAG_INSTANCE => HeaderTag::Instance,
        TAG_ARRAY => HeaderTag::Array,
        TAG_METHOD => HeaderTag::Method,
        tag => panic!("header word at {} carries tag {:#b}", block, tag),
    }
}

/// Block start to object start, driven by the tag in the first word.
pub fn block_to_oop(mem: &MemorySpace, block: Address) -> Address {
    let word = mem.load_word(block);
    match tag_of(word) {
        TAG_INSTANCE => block + BYTES_IN_WORD,
        TAG_ARRAY => block + 2 * BYTES_IN_WORD,
        TAG_METHOD => block + conversions::words_to_bytes(decode_method_info(word)),
        tag => panic!("header word at {} carries tag {:#b}", block, tag),
    }
}

/// Object start back to block start. Methods read their header size from
/// the info word stored just before the class word, because it is not
/// derivable from the tag alone.
pub fn oop_to_block(layout: &ClassLayout, mem: &MemorySpace, oop: Address) -> Address {
    match layout {
        ClassLayout::Instance { .. } => oop - BYTES_IN_WORD,
        ClassLayout::Array { .. } => oop - 2 * BYTES_IN_WORD,
        ClassLayout::Method => {
            let info = mem.load_word(oop - 2 * BYTES_IN_WORD);
            oop - conversions::words_to_bytes(decode_method_info(info))
        }
    }
}

/// Body size in bytes: array length times element size rounded to a word,
/// the fixed instance size otherwise. Method bodies are byte-counted by
/// their length word.
pub fn body_size(layout: &ClassLayout, mem: &MemorySpace, oop: Address) -> ByteSize {
    match layout {
        ClassLayout::Instance { size_words, .. } => conversions::words_to_bytes(*size_words),
        ClassLayout::Array { element_size, .. } => {
            let length = decode_length_word(mem.load_word(oop - 2 * BYTES_IN_WORD));
            conversions::word_align_up(length * element_size)
        }
        ClassLayout::Method => {
            let length = decode_length_word(mem.load_word(oop - 3 * BYTES_IN_WORD));
            conversions::word_align_up(length)
        }
    }
}

/// The address of the class slot: the word immediately before the object.
pub fn class_slot_addr(oop: Address) -> Address {
    oop - BYTES_IN_WORD
}

/// Read the class slot as the tagged union it is. The slot holds an
/// association exactly when the record it points at is itself an instance
/// of the association class.
pub fn class_slot(mem: &MemorySpace, association_class: Address, oop: Address) -> ClassSlot {
    let target = mem.load_addr(class_slot_addr(oop));
    debug_assert!(!target.is_zero(), "object {} has no class", oop);
    let target_class = mem.load_addr(class_slot_addr(target));
    if target_class == association_class {
        ClassSlot::Association(target)
    } else {
        ClassSlot::Class(target)
    }
}

/// Resolve the class slot to the class itself, reading one level further
/// through an association if one is installed.
pub fn direct_class(mem: &MemorySpace, association_class: Address, oop: Address) -> Address {
    match class_slot(mem, association_class, oop) {
        ClassSlot::Class(klass) => klass,
        ClassSlot::Association(assoc) => mem.load_addr(assoc),
    }
}

pub fn set_class_slot(mem: &mut MemorySpace, oop: Address, target: Address) {
    debug_assert!(conversions::is_word_aligned(target));
    mem.store_addr(class_slot_addr(oop), target);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::conversions::words_to_bytes;

    #[test]
    fn length_word_round_trip() {
        for length in [0, 1, MAX_ARRAY_LENGTH] {
            let word = encode_length_word(length).unwrap();
            assert_eq!(tag_of(word), TAG_ARRAY);
            assert_eq!(decode_length_word(word), length);
        }
    }

    #[test]
    fn oversized_length_is_an_allocation_error() {
        let err = encode_length_word(MAX_ARRAY_LENGTH + 1).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { .. }));
    }

    #[test]
    fn method_info_round_trip() {
        let word = encode_method_info(6);
        assert_eq!(tag_of(word), TAG_METHOD);
        assert_eq!(decode_method_info(word), 6);
    }

    #[test]
    fn block_oop_round_trip() {
        let mut mem = MemorySpace::new(words_to_bytes(32));
        let klass = Address::from_usize(words_to_bytes(30)); // any aligned address

        // instance
        let block = Address::from_usize(words_to_bytes(1));
        mem.store_addr(block, klass);
        assert_eq!(header_tag(&mem, block), HeaderTag::Instance);
        let oop = block_to_oop(&mem, block);
        assert_eq!(oop, block + BYTES_IN_WORD);
        let layout = ClassLayout::Instance {
            size_words: 2,
            oop_map: vec![],
        };
        assert_eq!(oop_to_block(&layout, &mem, oop), block);
        assert_eq!(body_size(&layout, &mem, oop), words_to_bytes(2));

        // array of 3 words
        let block = Address::from_usize(words_to_bytes(8));
        mem.store_word(block, encode_length_word(3).unwrap());
        mem.store_addr(block + BYTES_IN_WORD, klass);
        assert_eq!(header_tag(&mem, block), HeaderTag::Array);
        let oop = block_to_oop(&mem, block);
        assert_eq!(oop, block + 2 * BYTES_IN_WORD);
        let layout = ClassLayout::Array {
            element_size: BYTES_IN_WORD,
            refs: false,
        };
        assert_eq!(oop_to_block(&layout, &mem, oop), block);
        assert_eq!(body_size(&layout, &mem, oop), words_to_bytes(3));

        // method with one extra header word and a 5-byte body
        let header_words = MIN_METHOD_HEADER_WORDS + 1;
        let block = Address::from_usize(words_to_bytes(16));
        let oop = block + words_to_bytes(header_words);
        mem.store_word(block, encode_method_info(header_words));
        mem.store_word(oop - 3 * BYTES_IN_WORD, encode_length_word(5).unwrap());
        mem.store_word(oop - 2 * BYTES_IN_WORD, encode_method_info(header_words));
        mem.store_addr(oop - BYTES_IN_WORD, klass);
        assert_eq!(header_tag(&mem, block), HeaderTag::Method);
        assert_eq!(block_to_oop(&mem, block), oop);
        assert_eq!(oop_to_block(&ClassLayout::Method, &mem, oop), block);
        assert_eq!(
            body_size(&ClassLayout::Method, &mem, oop),
            conversions::word_align_up(5)
        );
    }
}
