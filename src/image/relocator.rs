//! Pointer relocation for loaded object memories.
//!
//! The oop bitmap marks one bit per memory word; each marked word holds a
//! canonical address that must be rewritten to an absolute address in the
//! residency space of whichever image of the parent chain covers it. Every
//! marked bit is consumed exactly once: residue after the walk, a mark
//! beyond the image, or a canonical address no chain image covers are all
//! fatal corruption signals, and nothing is ever written outside the
//! buffer.

use crate::error::{MemoryError, Result};
use crate::heap::space::MemorySpace;
use crate::image::wire::{TYPE_BYTE, TYPE_INT, TYPE_LONG, TYPE_REF, TYPE_SHORT};
use crate::image::ObjectMemory;
use crate::util::constants::{BITS_IN_BYTE, BYTES_IN_WORD};
use crate::util::{Address, ByteSize};

/// One bit per word of a memory region, marking pointer-valued slots
/// pending relocation.
#[derive(Clone)]
pub struct OopBitmap {
    bits: Vec<u8>,
    words: usize,
}

impl OopBitmap {
    pub fn new(words: usize) -> OopBitmap {
        OopBitmap {
            bits: vec![0; (words + BITS_IN_BYTE - 1) / BITS_IN_BYTE],
            words,
        }
    }

    /// Wrap the wire bytes of an image covering `words` memory words.
    pub fn from_bytes(bytes: &[u8], words: usize) -> OopBitmap {
        debug_assert_eq!(bytes.len(), (words + BITS_IN_BYTE - 1) / BITS_IN_BYTE);
        OopBitmap {
            bits: bytes.to_vec(),
            words,
        }
    }

    pub fn words(&self) -> usize {
        self.words
    }

    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.words);
        self.bits[index / BITS_IN_BYTE] |= 1 << (index % BITS_IN_BYTE);
    }

    pub fn clear(&mut self, index: usize) {
        self.bits[index / BITS_IN_BYTE] &= !(1 << (index % BITS_IN_BYTE));
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.bits[index / BITS_IN_BYTE] & (1 << (index % BITS_IN_BYTE)) != 0
    }

    /// Number of marked bits, counting marks beyond the word count too so
    /// corruption in the trailing padding bits is visible.
    pub fn cardinality(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Indexes of every marked bit, including out-of-range marks.
    pub fn set_indexes(&self) -> Vec<usize> {
        let mut indexes = Vec::new();
        for (byte_index, &byte) in self.bits.iter().enumerate() {
            if byte == 0 {
                continue;
            }
            for bit in 0..BITS_IN_BYTE {
                if byte & (1 << bit) != 0 {
                    indexes.push(byte_index * BITS_IN_BYTE + bit);
                }
            }
        }
        indexes
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone()
    }
}

/// A canonical range of the parent chain and where it now resides.
#[derive(Debug, Clone, Copy)]
pub struct CanonicalRange {
    pub canonical_start: usize,
    pub canonical_end: usize,
    pub residency: Address,
}

impl CanonicalRange {
    pub fn from_memory(memory: &ObjectMemory) -> CanonicalRange {
        CanonicalRange {
            canonical_start: memory.canonical_start(),
            canonical_end: memory.canonical_end(),
            residency: memory.start(),
        }
    }

    fn contains(&self, canonical: usize) -> bool {
        self.canonical_start <= canonical && canonical < self.canonical_end
    }
}

/// Rewrite every marked word of the image at `buffer` from a canonical
/// address to an absolute one. With `swap` the image bytes are in foreign
/// endianness: words are decoded and re-encoded swapped, and the separate
/// byte-swap pass runs afterwards with the offsets already correct.
pub fn relocate(
    mem: &mut MemorySpace,
    uri: &str,
    buffer: Address,
    size: ByteSize,
    bitmap: &mut OopBitmap,
    ranges: &[CanonicalRange],
    swap: bool,
) -> Result<()> {
    let words = size / BYTES_IN_WORD;
    debug_assert_eq!(bitmap.words(), words);
    let violation = |reason: String| MemoryError::RelocationInvariant {
        uri: uri.to_string(),
        reason,
    };

    for index in bitmap.set_indexes() {
        if index >= words {
            return Err(violation(format!(
                "oop map marks word {} beyond the image of {} words",
                index, words
            )));
        }
        let slot = buffer + index * BYTES_IN_WORD;
        let raw = mem.load_word(slot);
        let canonical = if swap { raw.swap_bytes() } else { raw };
        let range = ranges
            .iter()
            .find(|r| r.contains(canonical))
            .ok_or_else(|| {
                violation(format!(
                    "canonical address {:#x} in word {} falls outside the parent chain",
                    canonical, index
                ))
            })?;
        let absolute = range.residency + (canonical - range.canonical_start);
        let encoded = if swap {
            absolute.as_usize().swap_bytes()
        } else {
            absolute.as_usize()
        };
        mem.store_word(slot, encoded);
        bitmap.clear(index);
        trace!(
            "relocated word {}: canonical {:#x} -> {}",
            index,
            canonical,
            absolute
        );
    }

    let residue = bitmap.cardinality();
    if residue != 0 {
        return Err(violation(format!(
            "{} oop map bits remain after relocation",
            residue
        )));
    }
    Ok(())
}

/// Byte-swap the image after relocation. With a type map every slot is
/// swapped by its recorded width; without one only the pointer words the
/// (pristine) oop bitmap marks are known, and only they are swapped.
pub fn swap_image(
    mem: &mut MemorySpace,
    buffer: Address,
    size: ByteSize,
    pointers: &OopBitmap,
    typemap: Option<&[u8]>,
) {
    match typemap {
        Some(map) => {
            debug_assert_eq!(map.len(), size);
            let mut i = 0;
            while i < size {
                let width = match map[i] {
                    TYPE_SHORT => 2,
                    TYPE_INT => 4,
                    TYPE_LONG => 8,
                    TYPE_REF => BYTES_IN_WORD,
                    TYPE_BYTE => 1,
                    code => {
                        warn!("unknown type map code {} at byte {}", code, i);
                        1
                    }
                };
                if i + width > size {
                    warn!("type map run of {} bytes at {} escapes the image", width, i);
                    break;
                }
                if width > 1 {
                    mem.swap_bytes(buffer + i, width);
                }
                i += width;
            }
        }
        None => {
            for index in pointers.set_indexes() {
                if index < size / BYTES_IN_WORD {
                    mem.swap_bytes(buffer + index * BYTES_IN_WORD, BYTES_IN_WORD);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::conversions::words_to_bytes;

    fn space(words: usize) -> MemorySpace {
        MemorySpace::new(words_to_bytes(words))
    }

    #[test]
    fn bitmap_set_clear_cardinality() {
        let mut bitmap = OopBitmap::new(20);
        bitmap.set(0);
        bitmap.set(9);
        bitmap.set(19);
        assert_eq!(bitmap.cardinality(), 3);
        assert_eq!(bitmap.set_indexes(), vec![0, 9, 19]);
        bitmap.clear(9);
        assert!(!bitmap.is_set(9));
        assert_eq!(bitmap.cardinality(), 2);
    }

    #[test]
    fn relocation_consumes_every_bit() {
        let mut mem = space(8);
        let buffer = Address::from_usize(0);
        let size = words_to_bytes(4);
        // word 1 points at canonical 0x10 of a chain image resident at 0x40
        mem.store_word(Address::from_usize(words_to_bytes(1)), 0x10);
        let mut bitmap = OopBitmap::new(4);
        bitmap.set(1);
        let ranges = [CanonicalRange {
            canonical_start: 0,
            canonical_end: 0x20,
            residency: Address::from_usize(0x40),
        }];
        relocate(&mut mem, "memory:test", buffer, size, &mut bitmap, &ranges, false).unwrap();
        assert_eq!(bitmap.cardinality(), 0);
        assert_eq!(mem.load_word(Address::from_usize(words_to_bytes(1))), 0x50);
    }

    #[test]
    fn out_of_range_mark_fails_without_writing() {
        let mut mem = space(8);
        let size = words_to_bytes(2);
        let mut bitmap = OopBitmap::new(2);
        // corrupt a padding bit beyond the image words
        bitmap.bits[0] |= 1 << 5;
        let err = relocate(
            &mut mem,
            "memory:test",
            Address::from_usize(0),
            size,
            &mut bitmap,
            &[],
            false,
        )
        .unwrap_err();
        assert!(matches!(err, MemoryError::RelocationInvariant { .. }));
        // the buffer was never touched
        assert_eq!(mem.load_word(Address::from_usize(0)), 0);
    }

    #[test]
    fn unresolvable_canonical_address_fails() {
        let mut mem = space(4);
        let size = words_to_bytes(1);
        mem.store_word(Address::from_usize(0), 0x9999);
        let mut bitmap = OopBitmap::new(1);
        bitmap.set(0);
        let ranges = [CanonicalRange {
            canonical_start: 0,
            canonical_end: 0x100,
            residency: Address::from_usize(0),
        }];
        let err = relocate(
            &mut mem,
            "memory:test",
            Address::from_usize(0),
            size,
            &mut bitmap,
            &ranges,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, MemoryError::RelocationInvariant { .. }));
    }

    #[test]
    fn swap_without_typemap_touches_only_pointer_words() {
        let mut mem = space(2);
        mem.store_word(Address::from_usize(0), 0x0102_0304);
        mem.store_word(Address::from_usize(BYTES_IN_WORD), 0x0102_0304);
        let mut pointers = OopBitmap::new(2);
        pointers.set(0);
        swap_image(
            &mut mem,
            Address::from_usize(0),
            words_to_bytes(2),
            &pointers,
            None,
        );
        assert_eq!(
            mem.load_word(Address::from_usize(0)),
            (0x0102_0304usize).swap_bytes()
        );
        assert_eq!(mem.load_word(Address::from_usize(BYTES_IN_WORD)), 0x0102_0304);
    }
}
