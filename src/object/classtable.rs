//! Class metadata consumed by the allocator, collector and serializer.
//!
//! Class resolution and loading belong to the host runtime; the manager
//! only ever queries sizing and pointer layout. A class is identified by
//! the address of its class object. The system classes the manager itself
//! depends on are burned into ROM at bootstrap; the host registers the
//! rest through the manager's `define_*` entry points.

use std::collections::HashMap;

use crate::error::Result;
use crate::heap::partition::Partition;
use crate::heap::space::MemorySpace;
use crate::object::association::{ASSOC_OOP_MAP, ASSOC_SIZE_WORDS};
use crate::util::constants::BYTES_IN_WORD;
use crate::util::conversions;
use crate::util::{Address, ByteSize};

/// Words in the body of a class object. The first field is the cached
/// virtual-method table reference that associations copy; an association's
/// first two fields overlay a class's first two fields so class-slot
/// readers find a usable class pointer one level further on.
pub const CLASS_BODY_WORDS: usize = 2;
/// Field index of the vtable reference within a class object.
pub const CLASS_VTABLE_FIELD: usize = 0;

#[derive(Debug, Clone)]
pub enum ClassLayout {
    /// Fixed-size instance; `oop_map` lists the word indexes of the
    /// pointer-valued fields.
    Instance {
        size_words: usize,
        oop_map: Vec<usize>,
    },
    /// Array of `element_size`-byte elements; `refs` marks every element
    /// as a pointer.
    Array { element_size: ByteSize, refs: bool },
    /// Bytecode object with a variable-length header.
    Method,
}

impl ClassLayout {
    pub fn is_method(&self) -> bool {
        matches!(self, ClassLayout::Method)
    }
}

#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub name: String,
    pub layout: ClassLayout,
}

pub struct ClassTable {
    classes: HashMap<Address, ClassInfo>,
    class_class: Address,
    association_class: Address,
    monitor_class: Address,
    byte_array_class: Address,
    stack_chunk_class: Address,
    method_class: Address,
}

impl ClassTable {
    /// Burn the system class objects into ROM and build the table.
    pub fn bootstrap(mem: &mut MemorySpace, partition: &mut Partition) -> Result<ClassTable> {
        let class_class = carve_class_object(mem, partition, Address::ZERO)?;
        let association_class = carve_class_object(mem, partition, class_class)?;
        let monitor_class = carve_class_object(mem, partition, class_class)?;
        let byte_array_class = carve_class_object(mem, partition, class_class)?;
        let stack_chunk_class = carve_class_object(mem, partition, class_class)?;
        let method_class = carve_class_object(mem, partition, class_class)?;

        let mut table = ClassTable {
            classes: HashMap::new(),
            class_class,
            association_class,
            monitor_class,
            byte_array_class,
            stack_chunk_class,
            method_class,
        };
        table.register(
            class_class,
            ClassInfo {
                name: "system.Class".into(),
                layout: ClassLayout::Instance {
                    size_words: CLASS_BODY_WORDS,
                    oop_map: vec![CLASS_VTABLE_FIELD],
                },
            },
        );
        table.register(
            association_class,
            ClassInfo {
                name: "system.ObjectAssociation".into(),
                layout: ClassLayout::Instance {
                    size_words: ASSOC_SIZE_WORDS,
                    oop_map: ASSOC_OOP_MAP.to_vec(),
                },
            },
        );
        table.register(
            monitor_class,
            ClassInfo {
                name: "system.Monitor".into(),
                layout: ClassLayout::Instance {
                    size_words: 2,
                    oop_map: vec![],
                },
            },
        );
        table.register(
            byte_array_class,
            ClassInfo {
                name: "system.ByteArray".into(),
                layout: ClassLayout::Array {
                    element_size: 1,
                    refs: false,
                },
            },
        );
        table.register(
            stack_chunk_class,
            ClassInfo {
                name: "system.StackChunk".into(),
                layout: ClassLayout::Array {
                    element_size: BYTES_IN_WORD,
                    refs: true,
                },
            },
        );
        table.register(
            method_class,
            ClassInfo {
                name: "system.Method".into(),
                layout: ClassLayout::Method,
            },
        );
        debug!(
            "bootstrapped {} system classes, rom top {}",
            table.classes.len(),
            partition.rom_top()
        );
        Ok(table)
    }

    pub fn register(&mut self, klass: Address, info: ClassInfo) {
        debug_assert!(conversions::is_word_aligned(klass));
        let previous = self.classes.insert(klass, info);
        assert!(previous.is_none(), "class {} registered twice", klass);
    }

    pub fn get(&self, klass: Address) -> &ClassInfo {
        self.classes
            .get(&klass)
            .unwrap_or_else(|| panic!("no class registered at {}", klass))
    }

    pub fn layout_of(&self, klass: Address) -> &ClassLayout {
        &self.get(klass).layout
    }

    pub fn class_class(&self) -> Address {
        self.class_class
    }

    pub fn association_class(&self) -> Address {
        self.association_class
    }

    pub fn monitor_class(&self) -> Address {
        self.monitor_class
    }

    pub fn byte_array_class(&self) -> Address {
        self.byte_array_class
    }

    pub fn stack_chunk_class(&self) -> Address {
        self.stack_chunk_class
    }

    pub fn method_class(&self) -> Address {
        self.method_class
    }
}

/// Lay a class object out in ROM: a plain instance of the metaclass whose
/// body starts with the vtable slot. Passing zero makes the object its own
/// class (the metaclass itself).
pub(crate) fn carve_class_object(
    mem: &mut MemorySpace,
    partition: &mut Partition,
    class_class: Address,
) -> Result<Address> {
    let block = partition.carve_rom(conversions::words_to_bytes(1 + CLASS_BODY_WORDS))?;
    let oop = block + BYTES_IN_WORD;
    let klass = if class_class.is_zero() {
        oop
    } else {
        class_class
    };
    mem.store_addr(block, klass);
    Ok(oop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::options::Options;

    #[test]
    fn bootstrap_registers_system_classes() {
        let options = Options::default().normalize();
        let mut partition = Partition::new(&options);
        let mut mem = MemorySpace::new(partition.total_size());
        let table = ClassTable::bootstrap(&mut mem, &mut partition).unwrap();

        // the metaclass is its own class
        let meta = table.class_class();
        assert_eq!(mem.load_addr(meta - BYTES_IN_WORD), meta);
        // every other system class is an instance of the metaclass
        assert_eq!(
            mem.load_addr(table.association_class() - BYTES_IN_WORD),
            meta
        );
        assert!(matches!(
            table.layout_of(table.byte_array_class()),
            ClassLayout::Array {
                element_size: 1,
                refs: false
            }
        ));
        assert!(table.layout_of(table.method_class()).is_method());
    }
}
