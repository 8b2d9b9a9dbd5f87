//! The allocation window over the current semispace.
//!
//! The window is mutated only by the allocator/collector pair: the
//! allocator advances the cursor, the collector resets the window when it
//! flips spaces. Crossing the limit is what triggers a collection; the
//! collect-and-retry ladder itself lives in the manager because the
//! collector is a peer component.

use crate::heap::space::MemorySpace;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::conversions;
use crate::util::{Address, ByteSize};

pub struct BumpAllocator {
    heap_start: Address,
    heap_end: Address,
    alloc_start: Address,
    cursor: Address,
    limit: Address,
}

impl BumpAllocator {
    pub fn new(
        heap_start: Address,
        heap_end: Address,
        alloc_start: Address,
        cursor: Address,
        limit: Address,
    ) -> BumpAllocator {
        debug_assert!(heap_start <= alloc_start && alloc_start <= cursor);
        debug_assert!(cursor <= limit && limit <= heap_end);
        BumpAllocator {
            heap_start,
            heap_end,
            alloc_start,
            cursor,
            limit,
        }
    }

    /// Point the window at a (possibly different) space. Used by the
    /// collector after it has evacuated live data.
    pub fn reset(&mut self, alloc_start: Address, cursor: Address, limit: Address) {
        debug_assert!(self.heap_start <= alloc_start && limit <= self.heap_end);
        debug_assert!(alloc_start <= cursor && cursor <= limit);
        self.alloc_start = alloc_start;
        self.cursor = cursor;
        self.limit = limit;
    }

    pub fn heap_start(&self) -> Address {
        self.heap_start
    }

    pub fn heap_end(&self) -> Address {
        self.heap_end
    }

    pub fn alloc_start(&self) -> Address {
        self.alloc_start
    }

    pub fn cursor(&self) -> Address {
        self.cursor
    }

    pub fn limit(&self) -> Address {
        self.limit
    }

    pub fn free(&self) -> ByteSize {
        self.limit - self.cursor
    }

    pub fn used(&self) -> ByteSize {
        self.cursor - self.alloc_start
    }

    /// Raw bump allocation of a zero-filled block, or `None` if the window
    /// is exhausted and the caller must collect.
    pub fn bump(&mut self, mem: &mut MemorySpace, size: ByteSize) -> Option<Address> {
        debug_assert!(conversions::raw_is_aligned(size, BYTES_IN_WORD));
        let block = self.cursor;
        let new_cursor = block + size;
        if new_cursor > self.limit {
            trace!(
                "bump window exhausted: {} bytes requested, {} free",
                size,
                self.free()
            );
            return None;
        }
        self.cursor = new_cursor;
        mem.zero(block, size);
        trace!(
            "bump allocation size: {}, block: {}, new cursor: {}, limit: {}",
            size,
            block,
            self.cursor,
            self.limit
        );
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::BumpAllocator;
    use crate::heap::space::MemorySpace;
    use crate::util::constants::BYTES_IN_WORD;
    use crate::util::Address;

    fn window(words: usize) -> (MemorySpace, BumpAllocator) {
        let size = words * BYTES_IN_WORD;
        let mem = MemorySpace::new(size);
        let start = Address::ZERO;
        let end = Address::ZERO + size;
        (mem, BumpAllocator::new(start, end, start, start, end))
    }

    #[test]
    fn bump_advances_and_zeroes() {
        let (mut mem, mut window) = window(4);
        mem.store_word(Address::ZERO, 0xff);
        let a = window.bump(&mut mem, 2 * BYTES_IN_WORD).unwrap();
        assert_eq!(a, Address::ZERO);
        assert_eq!(mem.load_word(a), 0);
        let b = window.bump(&mut mem, BYTES_IN_WORD).unwrap();
        assert_eq!(b, a + 2 * BYTES_IN_WORD);
        assert_eq!(window.free(), BYTES_IN_WORD);
    }

    #[test]
    fn bump_fails_at_limit() {
        let (mut mem, mut window) = window(2);
        assert!(window.bump(&mut mem, 2 * BYTES_IN_WORD).is_some());
        assert!(window.bump(&mut mem, BYTES_IN_WORD).is_none());
        assert_eq!(window.used(), 2 * BYTES_IN_WORD);
    }
}
