//! Serialize/load round trips for object memories: graph isomorphism,
//! hash agreement, parent chaining, and the failure modes that must never
//! register anything.

use std::collections::HashMap;

use emberheap::image::serializer;
use emberheap::image::{content_hash, parent_chain, wire};
use emberheap::util::constants::BYTES_IN_WORD;
use emberheap::{Address, MemoryError, MemoryManager, Options};

fn manager() -> MemoryManager {
    MemoryManager::new(Options {
        rom_size: 8 << 10,
        nvm_size: 8 << 10,
        heap_size: 32 << 10,
        ..Options::default()
    })
}

/// Node { next: ref, value: word }
fn define_node(mgr: &mut MemoryManager) -> Address {
    mgr.define_instance_class("test.Node", 2, vec![0]).unwrap()
}

fn new_node(mgr: &mut MemoryManager, node: Address, next: Address, value: usize) -> Address {
    let oop = mgr.allocate_instance(node).unwrap();
    mgr.memory_mut().store_addr(oop, next);
    mgr.memory_mut().store_word(oop + BYTES_IN_WORD, value);
    oop
}

fn resolver(entries: &[(&str, Vec<u8>)]) -> HashMap<String, Vec<u8>> {
    entries
        .iter()
        .map(|(uri, bytes)| (uri.to_string(), bytes.clone()))
        .collect()
}

#[test]
fn parentless_round_trip_reproduces_the_graph() {
    let mut mgr = manager();
    let node = define_node(&mut mgr);
    let tail = new_node(&mut mgr, node, Address::ZERO, 42);
    let root = new_node(&mut mgr, node, tail, 41);

    // hash computed at serialization time, for comparison below
    let chain = parent_chain(&mgr.bootstrap_memory());
    let graph = serializer::copy_graph(
        mgr.memory(),
        mgr.classes(),
        mgr.partition(),
        &chain,
        mgr.bootstrap_memory().canonical_end(),
        root,
    )
    .unwrap();
    let serialized_hash = content_hash(&graph.bytes);

    let bytes = mgr.save_object_memory(root, None).unwrap();
    let images = resolver(&[("memory:app", bytes)]);
    let loaded = mgr
        .load_object_memory(&images, "memory:app", true)
        .unwrap();

    // the loader recomputed the same hash
    assert_eq!(loaded.hash(), serialized_hash);

    // the loaded graph is isomorphic to the original, down in NVM
    let root2 = loaded.root();
    assert!(mgr.partition().in_nvm(root2));
    assert_eq!(mgr.memory().load_word(root2 + BYTES_IN_WORD), 41);
    let tail2 = mgr.memory().load_addr(root2);
    assert_eq!(mgr.memory().load_word(tail2 + BYTES_IN_WORD), 42);
    assert_eq!(mgr.memory().load_addr(tail2), Address::ZERO);

    // system classes resolved through the implicit bootstrap parent
    assert_eq!(mgr.memory().load_addr(root2 - BYTES_IN_WORD), node);

    // registered and searchable
    assert!(mgr.lookup_by_uri("memory:app").is_some());
    assert_eq!(mgr.lookup_by_root(root2).unwrap().uri(), "memory:app");
}

#[test]
fn child_images_chain_to_registered_parents() {
    let mut mgr = manager();
    let node = define_node(&mut mgr);

    let lib_root = new_node(&mut mgr, node, Address::ZERO, 7);
    let lib_bytes = mgr.save_object_memory(lib_root, None).unwrap();
    let images = resolver(&[("memory:lib", lib_bytes)]);
    let lib = mgr.load_object_memory(&images, "memory:lib", true).unwrap();

    // a fresh graph pointing into the loaded library
    let app_root = new_node(&mut mgr, node, lib.root(), 9);
    let app_bytes = mgr
        .save_object_memory(app_root, Some(lib.clone()))
        .unwrap();
    let images = resolver(&[("memory:app", app_bytes)]);
    let app = mgr.load_object_memory(&images, "memory:app", true).unwrap();

    assert_eq!(app.parent().unwrap().uri(), "memory:lib");
    assert_eq!(app.canonical_start(), lib.canonical_end());
    let root2 = app.root();
    assert_eq!(mgr.memory().load_word(root2 + BYTES_IN_WORD), 9);
    // the cross-image pointer resolved to the parent's resident root
    assert_eq!(mgr.memory().load_addr(root2), lib.root());
}

#[test]
fn parent_hash_mismatch_is_fatal_and_registers_nothing() {
    let mut mgr = manager();
    let node = define_node(&mut mgr);

    let lib_root = new_node(&mut mgr, node, Address::ZERO, 7);
    let lib_bytes = mgr.save_object_memory(lib_root, None).unwrap();
    let images = resolver(&[("memory:lib", lib_bytes)]);
    let lib = mgr.load_object_memory(&images, "memory:lib", true).unwrap();

    // hand-roll a child recording the wrong parent hash
    let app_root = new_node(&mut mgr, node, lib.root(), 9);
    let chain = parent_chain(&lib);
    let graph = serializer::copy_graph(
        mgr.memory(),
        mgr.classes(),
        mgr.partition(),
        &chain,
        lib.canonical_end(),
        app_root,
    )
    .unwrap();
    let bad = serializer::write_image(&graph, "memory:lib", lib.hash().wrapping_add(1));
    let images = resolver(&[("memory:app", bad)]);

    let err = mgr
        .load_object_memory(&images, "memory:app", true)
        .unwrap_err();
    assert!(matches!(err, MemoryError::Integrity { .. }));
    assert!(mgr.lookup_by_uri("memory:app").is_none());
}

#[test]
fn bad_magic_is_a_format_error() {
    let mut mgr = manager();
    let node = define_node(&mut mgr);
    let root = new_node(&mut mgr, node, Address::ZERO, 1);
    let mut bytes = mgr.save_object_memory(root, None).unwrap();
    bytes[0] ^= 0xff;

    let images = resolver(&[("memory:app", bytes)]);
    let err = mgr
        .load_object_memory(&images, "memory:app", true)
        .unwrap_err();
    assert!(matches!(err, MemoryError::Format { .. }));
    assert!(mgr.lookup_by_uri("memory:app").is_none());
}

#[test]
fn word_width_mismatch_is_a_format_error() {
    let mut mgr = manager();
    let node = define_node(&mut mgr);
    let root = new_node(&mut mgr, node, Address::ZERO, 1);
    let mut bytes = mgr.save_object_memory(root, None).unwrap();
    // attributes is the big-endian u32 at offset 8; flip the 32-bit flag
    bytes[11] ^= wire::ATTRIBUTE_32BIT as u8;

    let images = resolver(&[("memory:app", bytes)]);
    let err = mgr
        .load_object_memory(&images, "memory:app", true)
        .unwrap_err();
    assert!(matches!(err, MemoryError::Format { .. }));
}

#[test]
fn corrupt_oop_map_fails_relocation() {
    let mut mgr = manager();
    let node = define_node(&mut mgr);
    let root = new_node(&mut mgr, node, Address::ZERO, 1);
    let mut bytes = mgr.save_object_memory(root, None).unwrap();

    // with an empty parent uri the oop map follows the fixed header
    let oopmap_offset = 4 + 2 + 2 + 4 + 4 + 2 + 4 + 4;
    let size = u32::from_be_bytes([
        bytes[oopmap_offset - 4],
        bytes[oopmap_offset - 3],
        bytes[oopmap_offset - 2],
        bytes[oopmap_offset - 1],
    ]) as usize;
    let map_len = wire::oopmap_len(size, BYTES_IN_WORD);
    let words = size / BYTES_IN_WORD;
    // a single 3-word node leaves padding bits in the trailing map byte;
    // marking one is corruption the relocator must reject
    assert_ne!(words % 8, 0);
    bytes[oopmap_offset + map_len - 1] |= 0x80;

    let images = resolver(&[("memory:app", bytes)]);
    let err = mgr
        .load_object_memory(&images, "memory:app", true)
        .unwrap_err();
    assert!(matches!(err, MemoryError::RelocationInvariant { .. }));
    assert!(mgr.lookup_by_uri("memory:app").is_none());
}

#[test]
fn ram_residency_returns_a_usable_root_without_registration() {
    let mut mgr = manager();
    let node = define_node(&mut mgr);
    let tail = new_node(&mut mgr, node, Address::ZERO, 42);
    let root = new_node(&mut mgr, node, tail, 41);
    let bytes = mgr.save_object_memory(root, None).unwrap();

    let images = resolver(&[("memory:app", bytes)]);
    let loaded = mgr
        .load_object_memory(&images, "memory:app", false)
        .unwrap();

    // resident in the heap, reachable, but not searchable
    let root2 = loaded.root();
    assert!(mgr.partition().in_ram(root2));
    assert_eq!(mgr.memory().load_word(root2 + BYTES_IN_WORD), 41);
    let tail2 = mgr.memory().load_addr(root2);
    assert_eq!(mgr.memory().load_word(tail2 + BYTES_IN_WORD), 42);
    assert!(mgr.lookup_by_uri("memory:app").is_none());
}
