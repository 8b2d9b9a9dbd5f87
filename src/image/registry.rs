//! The process-wide catalogue of registered object memories.
//!
//! Append-mostly and small by construction (at most a few dozen images),
//! so lookups are linear scans. Registered memories are immutable and must
//! lie outside the mutable RAM heap; misuse is a host bug and asserts.

use std::sync::Arc;

use crate::heap::partition::Partition;
use crate::image::ObjectMemory;
use crate::util::Address;

#[derive(Default)]
pub struct Registry {
    memories: Vec<Arc<ObjectMemory>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn register(&mut self, partition: &Partition, memory: Arc<ObjectMemory>) {
        assert!(
            self.lookup_by_root(memory.root()).is_none(),
            "an object memory rooted at {} is already registered",
            memory.root()
        );
        assert!(
            !partition.overlaps_ram(memory.start(), memory.size()),
            "object memory {} overlaps the mutable RAM region",
            memory.uri()
        );
        debug_assert!(self.lookup_by_uri(memory.uri()).is_none());
        info!(
            "registered object memory {} ({} bytes at {})",
            memory.uri(),
            memory.size(),
            memory.start()
        );
        self.memories.push(memory);
    }

    /// Rare: drop a registered memory on suite unload.
    pub fn unregister(&mut self, uri: &str) {
        let before = self.memories.len();
        self.memories.retain(|m| m.uri() != uri);
        assert_eq!(
            before,
            self.memories.len() + 1,
            "no object memory registered under {}",
            uri
        );
        info!("unregistered object memory {}", uri);
    }

    pub fn lookup_by_uri(&self, uri: &str) -> Option<Arc<ObjectMemory>> {
        self.memories.iter().find(|m| m.uri() == uri).cloned()
    }

    pub fn lookup_by_root(&self, root: Address) -> Option<Arc<ObjectMemory>> {
        self.memories.iter().find(|m| m.root() == root).cloned()
    }

    /// The primordial ROM memory registered at bootstrap.
    pub fn bootstrap(&self) -> &Arc<ObjectMemory> {
        &self.memories[0]
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ObjectMemory>> {
        self.memories.iter()
    }
}
