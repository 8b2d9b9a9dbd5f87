//! The committed collection strategy: a Cheney two-space copying
//! collector over the RAM heap.
//!
//! The heap is split into two semispaces; live objects are evacuated from
//! the current space into the other, roots and interior pointers are
//! updated in place, and the allocation window is pointed at the free
//! remainder of the target space. A moved object leaves a forwarding word
//! (the new object address tagged `TAG_FORWARDED`) in its class slot.
//! Associations whose hashcode and monitor are unused are collapsed
//! instead of copied.
//!
//! Every pass evacuates the whole space, so every collection reports
//! itself as full.

use std::ops::Range;

use crate::gc::{GarbageCollector, HeapContext, RootSet};
use crate::heap::bumpallocator::BumpAllocator;
use crate::heap::space::MemorySpace;
use crate::object::association;
use crate::object::classtable::{ClassLayout, ClassTable};
use crate::object::header::{self, HEADER_TAG_MASK, TAG_FORWARDED};
use crate::util::constants::BYTES_IN_WORD;
use crate::util::conversions;
use crate::util::{Address, ByteSize};

#[derive(Default)]
pub struct CopyingCollector {
    heap_start: Address,
    heap_end: Address,
    semispace_bytes: ByteSize,
    /// Allocating in the high semispace.
    hi: bool,
}

impl CopyingCollector {
    pub fn new() -> CopyingCollector {
        CopyingCollector::default()
    }

    fn low(&self) -> Range<Address> {
        self.heap_start..self.heap_start + self.semispace_bytes
    }

    fn high(&self) -> Range<Address> {
        let start = self.heap_start + self.semispace_bytes;
        start..start + self.semispace_bytes
    }

    fn current(&self) -> Range<Address> {
        if self.hi {
            self.high()
        } else {
            self.low()
        }
    }
}

impl GarbageCollector for CopyingCollector {
    fn initialize(
        &mut self,
        heap_start: Address,
        alloc_start: Address,
        heap_end: Address,
    ) -> BumpAllocator {
        debug_assert_eq!(heap_start, alloc_start);
        self.heap_start = heap_start;
        self.heap_end = heap_end;
        self.semispace_bytes =
            conversions::raw_align_down((heap_end - heap_start) / 2, BYTES_IN_WORD);
        self.hi = false;
        debug!(
            "copying collector over {}..{}, {} byte semispaces",
            heap_start, heap_end, self.semispace_bytes
        );
        let low = self.low();
        BumpAllocator::new(heap_start, heap_end, low.start, low.start, low.end)
    }

    fn collect(&mut self, heap: &mut HeapContext, roots: &mut RootSet, _force_full: bool) -> bool {
        let from = self.current();
        let to = if self.hi { self.low() } else { self.high() };
        let mut free = to.start;

        for slot in roots.iter_mut() {
            *slot = forward(heap, &from, &to, &mut free, *slot);
        }

        // Cheney scan: objects copied into the to-space are themselves
        // scanned until no gray objects remain.
        let mut scan = to.start;
        while scan < free {
            scan = scan_object(heap, &from, &to, &mut free, scan);
        }

        self.hi = !self.hi;
        heap.window.reset(to.start, free, to.end);
        true
    }

    fn free_memory(&self, cursor: Address) -> ByteSize {
        self.current().end - cursor
    }

    fn total_memory(&self) -> ByteSize {
        self.semispace_bytes
    }
}

/// Chase a forwarding word, if one has been installed over the class slot.
fn follow_forward(mem: &MemorySpace, oop: Address) -> Address {
    let word = mem.load_word(header::class_slot_addr(oop));
    if header::tag_of(word) == TAG_FORWARDED {
        Address::from_usize(word & !HEADER_TAG_MASK)
    } else {
        oop
    }
}

/// Resolve the class of an unmoved object, reading through an association
/// (possibly already evacuated) and a possibly evacuated heap-resident
/// class.
fn resolve_class(mem: &MemorySpace, classes: &ClassTable, oop: Address) -> Address {
    let target = follow_forward(mem, mem.load_addr(header::class_slot_addr(oop)));
    let target_class = mem.load_addr(header::class_slot_addr(target));
    if target_class == classes.association_class() {
        follow_forward(mem, mem.load_addr(target))
    } else {
        target
    }
}

/// Evacuate one object if it lives in from-space, returning its new (or
/// unchanged) address.
fn forward(
    heap: &mut HeapContext,
    from: &Range<Address>,
    to: &Range<Address>,
    free: &mut Address,
    oop: Address,
) -> Address {
    if oop.is_zero() || !from.contains(&oop) {
        return oop;
    }
    let slot_word = heap.mem.load_word(header::class_slot_addr(oop));
    if header::tag_of(slot_word) == TAG_FORWARDED {
        return Address::from_usize(slot_word & !HEADER_TAG_MASK);
    }

    let classes = heap.classes;
    let klass = resolve_class(heap.mem, classes, oop);
    let layout = classes.layout_of(klass);
    let block = header::oop_to_block(layout, heap.mem, oop);
    let header_bytes = oop - block;
    let total = header_bytes + header::body_size(layout, heap.mem, oop);

    let target_block = *free;
    assert!(
        target_block + total <= to.end,
        "to-space overflow copying {} bytes at {}",
        total,
        oop
    );
    heap.mem.copy(block, target_block, total);
    let new_oop = target_block + header_bytes;
    *free = target_block + total;
    heap.mem
        .store_word(header::class_slot_addr(oop), new_oop.as_usize() | TAG_FORWARDED);
    trace!("evacuated {} -> {} ({} bytes)", oop, new_oop, total);
    new_oop
}

fn forward_slot(
    heap: &mut HeapContext,
    from: &Range<Address>,
    to: &Range<Address>,
    free: &mut Address,
    slot: Address,
) {
    let value = heap.mem.load_addr(slot);
    if value.is_zero() || !from.contains(&value) {
        return;
    }
    let moved = forward(heap, from, to, free, value);
    heap.mem.store_addr(slot, moved);
}

/// Scan one gray object in the to-space: fix its class slot (collapsing an
/// unused association on the way), then its pointer fields. Returns the
/// next block address.
fn scan_object(
    heap: &mut HeapContext,
    from: &Range<Address>,
    to: &Range<Address>,
    free: &mut Address,
    block: Address,
) -> Address {
    let classes = heap.classes;
    let oop = header::block_to_oop(heap.mem, block);
    let slot_addr = header::class_slot_addr(oop);
    let target = heap.mem.load_addr(slot_addr);

    if from.contains(&target) {
        let followed = follow_forward(heap.mem, target);
        let is_assoc =
            heap.mem.load_addr(header::class_slot_addr(followed)) == classes.association_class();
        let new_value = if is_assoc
            && followed == target
            && association::is_unused(heap.mem, followed)
        {
            trace!("collapsing unused association {} of {}", followed, oop);
            let klass = association::klass(heap.mem, followed);
            forward(heap, from, to, free, klass)
        } else {
            forward(heap, from, to, free, target)
        };
        heap.mem.store_addr(slot_addr, new_value);
    }

    let klass = resolve_class(heap.mem, classes, oop);
    let layout = classes.layout_of(klass);
    match layout {
        ClassLayout::Instance { oop_map, .. } => {
            for &field in oop_map {
                forward_slot(heap, from, to, free, oop + field * BYTES_IN_WORD);
            }
        }
        ClassLayout::Array {
            refs: true,
            element_size,
        } => {
            debug_assert_eq!(*element_size, BYTES_IN_WORD);
            let length =
                header::decode_length_word(heap.mem.load_word(oop - 2 * BYTES_IN_WORD));
            for i in 0..length {
                forward_slot(heap, from, to, free, oop + i * BYTES_IN_WORD);
            }
        }
        ClassLayout::Array { refs: false, .. } | ClassLayout::Method => {}
    }

    oop + header::body_size(layout, heap.mem, oop)
}
