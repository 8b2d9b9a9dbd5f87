//! Object associations: the lazily-created record standing in for an
//! object's class slot once a hashcode or monitor is needed.
//!
//! An association is an ordinary heap instance `{class, vtable, monitor,
//! hashcode}`. Its first two fields overlay where a class's first two
//! fields sit, so anything resolving the class slot finds a usable class
//! pointer one level further on; see [`crate::object::header::ClassSlot`].
//! Objects in ROM or NVM have immutable headers and cannot host an inline
//! association, so their hashcode/monitor state lives in the identity-
//! keyed side table at the end of this module.

use std::collections::HashMap;

use crate::heap::space::MemorySpace;
use crate::object::classtable::ClassTable;
use crate::object::header::{self, ClassSlot};
use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

pub const ASSOC_SIZE_WORDS: usize = 4;
pub const ASSOC_FIELD_KLASS: usize = 0;
pub const ASSOC_FIELD_VTABLE: usize = 1;
pub const ASSOC_FIELD_MONITOR: usize = 2;
pub const ASSOC_FIELD_HASH: usize = 3;
/// Pointer-valued fields of an association.
pub const ASSOC_OOP_MAP: [usize; 3] = [ASSOC_FIELD_KLASS, ASSOC_FIELD_VTABLE, ASSOC_FIELD_MONITOR];

fn field_addr(assoc: Address, field: usize) -> Address {
    assoc + field * BYTES_IN_WORD
}

pub fn klass(mem: &MemorySpace, assoc: Address) -> Address {
    mem.load_addr(field_addr(assoc, ASSOC_FIELD_KLASS))
}

pub fn vtable(mem: &MemorySpace, assoc: Address) -> Address {
    mem.load_addr(field_addr(assoc, ASSOC_FIELD_VTABLE))
}

pub fn monitor(mem: &MemorySpace, assoc: Address) -> Address {
    mem.load_addr(field_addr(assoc, ASSOC_FIELD_MONITOR))
}

pub fn set_monitor(mem: &mut MemorySpace, assoc: Address, monitor: Address) {
    mem.store_addr(field_addr(assoc, ASSOC_FIELD_MONITOR), monitor);
}

pub fn hashcode(mem: &MemorySpace, assoc: Address) -> usize {
    mem.load_word(field_addr(assoc, ASSOC_FIELD_HASH))
}

pub fn set_hashcode(mem: &mut MemorySpace, assoc: Address, hash: usize) {
    mem.store_word(field_addr(assoc, ASSOC_FIELD_HASH), hash);
}

/// Fill in a freshly allocated association for an object of `klass`,
/// copying the class's vtable reference. Monitor and hashcode start
/// unused.
pub fn init(mem: &mut MemorySpace, assoc: Address, klass: Address, vtable: Address) {
    mem.store_addr(field_addr(assoc, ASSOC_FIELD_KLASS), klass);
    mem.store_addr(field_addr(assoc, ASSOC_FIELD_VTABLE), vtable);
    mem.store_addr(field_addr(assoc, ASSOC_FIELD_MONITOR), Address::ZERO);
    mem.store_word(field_addr(assoc, ASSOC_FIELD_HASH), 0);
}

/// No hashcode in use and no monitor held.
pub fn is_unused(mem: &MemorySpace, assoc: Address) -> bool {
    hashcode(mem, assoc) == 0 && monitor(mem, assoc).is_zero()
}

/// Restore the bare class pointer if the association is unused. Pure
/// optimization; returns whether the header changed.
pub fn collapse(mem: &mut MemorySpace, classes: &ClassTable, oop: Address) -> bool {
    match header::class_slot(mem, classes.association_class(), oop) {
        ClassSlot::Class(_) => false,
        ClassSlot::Association(assoc) => {
            if !is_unused(mem, assoc) {
                return false;
            }
            let klass = klass(mem, assoc);
            header::set_class_slot(mem, oop, klass);
            trace!("collapsed association {} of {}", assoc, oop);
            true
        }
    }
}

/// Hashcode/monitor state for one object outside managed RAM.
#[derive(Debug, Clone, Copy)]
pub struct ImmutableAssoc {
    pub hash: usize,
    pub monitor: Address,
}

impl Default for ImmutableAssoc {
    fn default() -> Self {
        ImmutableAssoc {
            hash: 0,
            monitor: Address::ZERO,
        }
    }
}

/// Side table for ROM/NVM objects, keyed by identity. Such objects never
/// move, so the address is a stable key.
#[derive(Default)]
pub struct ImmutableAssocTable {
    entries: HashMap<Address, ImmutableAssoc>,
}

impl ImmutableAssocTable {
    pub fn get(&self, oop: Address) -> ImmutableAssoc {
        self.entries.get(&oop).copied().unwrap_or_default()
    }

    pub fn entry_mut(&mut self, oop: Address) -> &mut ImmutableAssoc {
        self.entries.entry(oop).or_default()
    }

    /// Keys whose entry holds a monitor. Monitors live in the collected
    /// heap, so these slots are collection roots.
    pub fn monitored(&self) -> Vec<Address> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.monitor.is_zero())
            .map(|(&k, _)| k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::partition::{Partition, RegionKind};
    use crate::util::options::Options;

    fn fixture() -> (MemorySpace, ClassTable, Address, Address) {
        let options = Options::default().normalize();
        let mut partition = Partition::new(&options);
        let mut mem = MemorySpace::new(partition.total_size());
        let classes = ClassTable::bootstrap(&mut mem, &mut partition).unwrap();

        // hand-build an instance and an association in RAM
        let ram = partition.region(RegionKind::Ram);
        let obj_block = ram.start;
        let obj = obj_block + BYTES_IN_WORD;
        let assoc_block = obj + 2 * BYTES_IN_WORD;
        let assoc = assoc_block + BYTES_IN_WORD;
        mem.store_addr(assoc_block, classes.association_class());
        init(&mut mem, assoc, classes.monitor_class(), Address::ZERO);
        mem.store_addr(obj_block, assoc);
        (mem, classes, obj, assoc)
    }

    #[test]
    fn collapse_restores_bare_class_pointer() {
        let (mut mem, classes, obj, assoc) = fixture();
        assert!(matches!(
            header::class_slot(&mem, classes.association_class(), obj),
            ClassSlot::Association(a) if a == assoc
        ));
        assert!(collapse(&mut mem, &classes, obj));
        assert!(matches!(
            header::class_slot(&mem, classes.association_class(), obj),
            ClassSlot::Class(k) if k == classes.monitor_class()
        ));
        // collapsing again is a no-op
        assert!(!collapse(&mut mem, &classes, obj));
    }

    #[test]
    fn collapse_refuses_while_in_use() {
        let (mut mem, classes, obj, assoc) = fixture();
        set_hashcode(&mut mem, assoc, 17);
        assert!(!collapse(&mut mem, &classes, obj));
        set_hashcode(&mut mem, assoc, 0);
        set_monitor(&mut mem, assoc, obj); // any non-null reference
        assert!(!collapse(&mut mem, &classes, obj));
    }

    #[test]
    fn immutable_side_table_defaults_to_unused() {
        let mut table = ImmutableAssocTable::default();
        let oop = Address::from_usize(64);
        assert_eq!(table.get(oop).hash, 0);
        table.entry_mut(oop).hash = 5;
        assert_eq!(table.get(oop).hash, 5);
        assert!(table.get(oop).monitor.is_zero());
    }
}
