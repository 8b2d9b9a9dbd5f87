//! The pluggable garbage-collector contract and the collection
//! controller.
//!
//! A collector is a swappable strategy behind [`GarbageCollector`]; the
//! [`GcController`] owns the re-entrancy guarding, the global
//! allocation-enabled handling, the pre-collection bookkeeping (weak
//! thread-registry pruning, class-state cache invalidation) and the
//! collection statistics, so a strategy only has to move objects.

pub mod copying;

use std::cell::Cell;
use std::sync::{Arc, Weak};

use delegate::delegate;
use downcast_rs::{impl_downcast, Downcast};
use enum_map::{Enum, EnumMap};

use crate::global_state::GlobalState;
use crate::heap::bumpallocator::BumpAllocator;
use crate::heap::space::MemorySpace;
use crate::object::classtable::ClassTable;
use crate::util::{Address, ByteSize};

pub use self::copying::CopyingCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
pub enum CollectionKind {
    Partial,
    Full,
}

/// The mutable parts of the heap a collector works on.
pub struct HeapContext<'a> {
    pub mem: &'a mut MemorySpace,
    pub classes: &'a ClassTable,
    pub window: &'a mut BumpAllocator,
}

/// Slots holding object references that the collector must treat as roots
/// and update in place when it moves their targets.
pub struct RootSet<'a> {
    lists: Vec<&'a mut Vec<Address>>,
}

impl<'a> RootSet<'a> {
    pub fn new(lists: Vec<&'a mut Vec<Address>>) -> RootSet<'a> {
        RootSet { lists }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Address> + use<'_, 'a> {
        self.lists.iter_mut().flat_map(|list| list.iter_mut())
    }
}

/// A garbage collection strategy.
///
/// `collect` runs with allocation globally disabled and must leave the
/// allocation window pointing at the space it freed. It returns whether
/// the pass was a full collection.
pub trait GarbageCollector: Downcast {
    /// Set up over the RAM range and return the initial allocation window.
    fn initialize(
        &mut self,
        heap_start: Address,
        alloc_start: Address,
        heap_end: Address,
    ) -> BumpAllocator;

    /// Perform a collection and report whether it was full.
    fn collect(&mut self, heap: &mut HeapContext, roots: &mut RootSet, force_full: bool) -> bool;

    /// Invoked once the controller's post-collection bookkeeping is done.
    fn post_collection(&mut self, _heap: &mut HeapContext) {}

    /// Bytes still allocatable given the current allocation pointer.
    fn free_memory(&self, cursor: Address) -> ByteSize;

    /// Usable heap bytes under this strategy.
    fn total_memory(&self) -> ByteSize;
}
impl_downcast!(GarbageCollector);

#[derive(Default)]
pub struct GcStats {
    collections: EnumMap<CollectionKind, usize>,
    bytes_in_use: ByteSize,
    bytes_last_freed: ByteSize,
}

impl GcStats {
    pub fn collections(&self, kind: CollectionKind) -> usize {
        self.collections[kind]
    }

    pub fn total_collections(&self) -> usize {
        self.collections.values().sum()
    }

    pub fn bytes_in_use(&self) -> ByteSize {
        self.bytes_in_use
    }

    pub fn bytes_last_freed(&self) -> ByteSize {
        self.bytes_last_freed
    }
}

/// A live thread of the host scheduler. The scheduler keeps the strong
/// reference; the manager's registry only holds weak ones, so entries die
/// with their thread.
#[derive(Debug)]
pub struct ThreadHandle {
    id: usize,
}

impl ThreadHandle {
    pub fn new(id: usize) -> Arc<ThreadHandle> {
        Arc::new(ThreadHandle { id })
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

/// The weak process-wide thread/isolate registry. Dead entries are pruned
/// before every collection.
#[derive(Default)]
pub struct ThreadRegistry {
    threads: Vec<Weak<ThreadHandle>>,
}

impl ThreadRegistry {
    pub fn register(&mut self, thread: &Arc<ThreadHandle>) {
        self.threads.push(Arc::downgrade(thread));
    }

    /// Drop entries whose thread has gone away; returns how many died.
    pub fn prune_dead(&mut self) -> usize {
        let before = self.threads.len();
        self.threads.retain(|t| t.upgrade().is_some());
        before - self.threads.len()
    }

    pub fn live_count(&self) -> usize {
        self.threads.iter().filter(|t| t.upgrade().is_some()).count()
    }
}

/// Cross-context cache of the most recently used class-state record.
/// Collection invalidates it, and it must still be invalid when collection
/// completes: a collector that accidentally triggers class initialization
/// would repopulate it.
#[derive(Default)]
pub struct ClassStateCache {
    cached: Cell<Option<Address>>,
}

impl ClassStateCache {
    pub fn get(&self) -> Option<Address> {
        self.cached.get()
    }

    pub fn set(&self, state: Address) {
        self.cached.set(Some(state));
    }

    pub fn invalidate(&self) {
        self.cached.set(None);
    }

    pub fn is_invalid(&self) -> bool {
        self.cached.get().is_none()
    }
}

/// Owns the collector strategy, the stack-chunk root list and the
/// collection statistics, and enforces the collection contract.
pub struct GcController {
    collector: Box<dyn GarbageCollector>,
    stack_chunks: Vec<Address>,
    stats: GcStats,
}

impl GcController {
    pub fn new(collector: Box<dyn GarbageCollector>) -> GcController {
        GcController {
            collector,
            stack_chunks: Vec::new(),
            stats: GcStats::default(),
        }
    }

    delegate! {
        to self.collector {
            pub fn initialize(
                &mut self,
                heap_start: Address,
                alloc_start: Address,
                heap_end: Address,
            ) -> BumpAllocator;
            pub fn free_memory(&self, cursor: Address) -> ByteSize;
            pub fn total_memory(&self) -> ByteSize;
        }
    }

    /// Hook for the external thread lifecycle: a stack chunk becomes a
    /// collection root.
    pub fn register_stack_chunk(&mut self, chunk: Address) {
        debug_assert!(!self.stack_chunks.contains(&chunk));
        self.stack_chunks.push(chunk);
    }

    pub fn deregister_stack_chunk(&mut self, chunk: Address) {
        let before = self.stack_chunks.len();
        self.stack_chunks.retain(|&c| c != chunk);
        debug_assert_eq!(before, self.stack_chunks.len() + 1);
    }

    pub fn stack_chunks(&self) -> &[Address] {
        &self.stack_chunks
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn collector(&self) -> &dyn GarbageCollector {
        &*self.collector
    }

    /// Run one collection under the §4.3 contract. Nested attempts are a
    /// fatal host bug; allocation is re-enabled unconditionally afterwards
    /// even if the strategy unwinds.
    pub fn collect<'a>(
        &'a mut self,
        state: &GlobalState,
        threads: &mut ThreadRegistry,
        class_cache: &ClassStateCache,
        heap: &mut HeapContext,
        mut extra_roots: Vec<&'a mut Vec<Address>>,
        force_full: bool,
    ) -> bool {
        assert!(
            !state.is_collecting(),
            "re-entrant collection: a collector must never allocate or trigger itself"
        );
        let _guard = CollectionGuard::enter(state);

        let pruned = threads.prune_dead();
        if pruned > 0 {
            trace!("pruned {} dead thread registry entries", pruned);
        }
        class_cache.invalidate();

        let used_before = heap.window.used();
        debug!(
            "collection start (force_full: {}): {} bytes in use, {} stack chunks",
            force_full,
            used_before,
            self.stack_chunks.len()
        );

        let full = {
            let mut lists: Vec<&mut Vec<Address>> = Vec::with_capacity(extra_roots.len() + 1);
            lists.push(&mut self.stack_chunks);
            lists.append(&mut extra_roots);
            let mut roots = RootSet::new(lists);
            self.collector.collect(heap, &mut roots, force_full)
        };

        debug_assert!(
            class_cache.is_invalid(),
            "class-state cache repopulated during collection"
        );
        self.collector.post_collection(heap);

        let kind = if full {
            CollectionKind::Full
        } else {
            CollectionKind::Partial
        };
        self.stats.collections[kind] += 1;
        let used_after = heap.window.used();
        self.stats.bytes_in_use = used_after;
        self.stats.bytes_last_freed = used_before.saturating_sub(used_after);
        debug!(
            "collection done ({:?}): {} bytes in use, {} reclaimed",
            kind, used_after, self.stats.bytes_last_freed
        );
        full
    }
}

/// Flips the collection/allocation flags for the duration of a collection.
/// Dropping the guard restores them even on unwind.
struct CollectionGuard<'a> {
    state: &'a GlobalState,
}

impl<'a> CollectionGuard<'a> {
    fn enter(state: &'a GlobalState) -> CollectionGuard<'a> {
        state.set_collecting(true);
        state.set_allocation_enabled(false);
        CollectionGuard { state }
    }
}

impl Drop for CollectionGuard<'_> {
    fn drop(&mut self) {
        self.state.set_allocation_enabled(true);
        self.state.set_collecting(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_registry_prunes_dead_entries() {
        let mut registry = ThreadRegistry::default();
        let alive = ThreadHandle::new(1);
        {
            let doomed = ThreadHandle::new(2);
            registry.register(&alive);
            registry.register(&doomed);
            assert_eq!(registry.live_count(), 2);
        }
        assert_eq!(registry.prune_dead(), 1);
        assert_eq!(registry.live_count(), 1);
        assert_eq!(alive.id(), 1);
    }

    #[test]
    fn class_state_cache_invalidation() {
        let cache = ClassStateCache::default();
        assert!(cache.is_invalid());
        cache.set(Address::from_usize(64));
        assert_eq!(cache.get(), Some(Address::from_usize(64)));
        cache.invalidate();
        assert!(cache.is_invalid());
    }
}
