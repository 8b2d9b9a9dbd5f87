//! The inverse of the loader: linearize an object graph into canonical
//! form and emit the wire envelope.
//!
//! The reachable RAM objects are copied block by block into a canonical
//! buffer; every pointer slot is rewritten to a canonical address (targets
//! outside the heap resolve through the parent chain) and marked in the
//! oop bitmap. A pointer that neither the copied graph nor the chain
//! covers fails the serialization — nothing partial is emitted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::{MemoryError, Result};
use crate::heap::partition::Partition;
use crate::heap::space::MemorySpace;
use crate::image::relocator::OopBitmap;
use crate::image::wire::{self, Writer};
use crate::image::ObjectMemory;
use crate::object::classtable::{ClassLayout, ClassTable};
use crate::object::header;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::{Address, ByteOffset};

pub struct SerializedGraph {
    /// Canonical memory bytes.
    pub bytes: Vec<u8>,
    /// One bit per word, set for every pointer slot.
    pub oopmap: OopBitmap,
    /// Byte offset of the root object within `bytes`.
    pub root_offset: usize,
}

/// Byte offsets, relative to the object, of every pointer slot: the class
/// slot plus whatever the layout declares.
fn pointer_slots(layout: &ClassLayout, mem: &MemorySpace, oop: Address) -> Vec<ByteOffset> {
    let mut slots = vec![-(BYTES_IN_WORD as ByteOffset)];
    match layout {
        ClassLayout::Instance { oop_map, .. } => {
            for &field in oop_map {
                slots.push((field * BYTES_IN_WORD) as ByteOffset);
            }
        }
        ClassLayout::Array { refs: true, .. } => {
            let length = header::decode_length_word(mem.load_word(oop - 2 * BYTES_IN_WORD));
            for i in 0..length {
                slots.push((i * BYTES_IN_WORD) as ByteOffset);
            }
        }
        ClassLayout::Array { refs: false, .. } | ClassLayout::Method => {}
    }
    slots
}

/// Copy the graph rooted at `root` into canonical form based at
/// `canonical_base` (the parent chain's canonical end).
pub fn copy_graph(
    mem: &MemorySpace,
    classes: &ClassTable,
    partition: &Partition,
    chain: &[Arc<ObjectMemory>],
    canonical_base: usize,
    root: Address,
) -> Result<SerializedGraph> {
    if !partition.in_ram(root) {
        return Err(MemoryError::Serialization {
            reason: format!("root {} is not a heap object", root),
        });
    }

    // pass 1: discover and copy raw blocks
    let mut bytes: Vec<u8> = Vec::new();
    let mut located: HashMap<Address, usize> = HashMap::new();
    let mut order: Vec<Address> = Vec::new();
    let mut queue: VecDeque<Address> = VecDeque::new();
    queue.push_back(root);
    while let Some(oop) = queue.pop_front() {
        if located.contains_key(&oop) {
            continue;
        }
        let klass = header::direct_class(mem, classes.association_class(), oop);
        let layout = classes.layout_of(klass);
        let block = header::oop_to_block(layout, mem, oop);
        let header_bytes = oop - block;
        let total = header_bytes + header::body_size(layout, mem, oop);
        let block_offset = bytes.len();
        bytes.extend_from_slice(mem.bytes(block, total));
        located.insert(oop, block_offset + header_bytes);
        order.push(oop);
        for offset in pointer_slots(layout, mem, oop) {
            let target = mem.load_addr(oop + offset);
            if !target.is_zero() && partition.in_ram(target) {
                queue.push_back(target);
            }
        }
    }
    trace!(
        "copied {} objects ({} canonical bytes) from root {}",
        order.len(),
        bytes.len(),
        root
    );

    // pass 2: rewrite pointer slots to canonical addresses
    let words = bytes.len() / BYTES_IN_WORD;
    let mut oopmap = OopBitmap::new(words);
    for &oop in &order {
        let local_oop = located[&oop] as ByteOffset;
        let klass = header::direct_class(mem, classes.association_class(), oop);
        let layout = classes.layout_of(klass);
        for offset in pointer_slots(layout, mem, oop) {
            let target = mem.load_addr(oop + offset);
            let canonical = canonical_address(&located, chain, canonical_base, target)
                .ok_or_else(|| MemoryError::Serialization {
                    reason: format!(
                        "pointer {} in object {} escapes the graph and its parent chain",
                        target, oop
                    ),
                })?;
            let slot = (local_oop + offset) as usize;
            bytes[slot..slot + BYTES_IN_WORD].copy_from_slice(&canonical.to_ne_bytes());
            oopmap.set(slot / BYTES_IN_WORD);
        }
    }

    Ok(SerializedGraph {
        bytes,
        oopmap,
        root_offset: located[&root],
    })
}

fn canonical_address(
    located: &HashMap<Address, usize>,
    chain: &[Arc<ObjectMemory>],
    canonical_base: usize,
    target: Address,
) -> Option<usize> {
    if target.is_zero() {
        return Some(0);
    }
    if let Some(&local) = located.get(&target) {
        return Some(canonical_base + local);
    }
    chain
        .iter()
        .find(|m| m.contains(target))
        .map(|m| m.residency_to_canonical(target))
}

/// Wrap a serialized graph in the wire envelope.
pub fn write_image(graph: &SerializedGraph, parent_uri: &str, parent_hash: u32) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u32(wire::MAGIC);
    w.write_u16(wire::MINOR_VERSION);
    w.write_u16(wire::MAJOR_VERSION);
    w.write_u32(wire::platform_attributes(false));
    w.write_u32(parent_hash);
    w.write_utf(parent_uri);
    w.write_u32(graph.root_offset as u32);
    w.write_u32(graph.bytes.len() as u32);
    w.write_bytes(&graph.oopmap.to_bytes());
    w.pad(wire::WIRE_ALIGNMENT);
    w.write_bytes(&graph.bytes);
    w.into_bytes()
}
