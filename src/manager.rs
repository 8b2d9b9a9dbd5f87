//! The memory-manager context: the one explicit owner of the modeled
//! address space, the partition, the class table, the allocation window,
//! the collector, the object-memory registry and the identity side
//! tables. Constructed once at process start and threaded through all
//! calls; never torn down during normal operation.
//!
//! Callers must keep any object they hand to a fallible operation
//! reachable from a registered stack chunk: allocation may trigger a
//! stop-the-world collection, and a collection invalidates unrooted
//! addresses.

use std::sync::Arc;

use delegate::delegate;

use crate::error::{MemoryError, Result};
use crate::gc::{
    ClassStateCache, CopyingCollector, GarbageCollector, GcController, GcStats, HeapContext,
    ThreadHandle, ThreadRegistry,
};
use crate::global_state::GlobalState;
use crate::heap::bumpallocator::BumpAllocator;
use crate::heap::partition::{Partition, RegionKind};
use crate::heap::space::MemorySpace;
use crate::image::loader::{self, ImageResolver};
use crate::image::registry::Registry;
use crate::image::serializer;
use crate::image::{content_hash, parent_chain, ObjectMemory, BOOTSTRAP_URI};
use crate::object::association::{self, ImmutableAssocTable};
use crate::object::classtable::{
    self, ClassInfo, ClassLayout, ClassTable, CLASS_VTABLE_FIELD,
};
use crate::object::header::{self, ClassSlot, MIN_METHOD_HEADER_WORDS};
use crate::util::constants::{BYTES_IN_WORD, DEFAULT_STRESS_PERIOD};
use crate::util::conversions;
use crate::util::options::Options;
use crate::util::{Address, ByteSize};

pub struct MemoryManager {
    options: Options,
    state: Arc<GlobalState>,
    mem: MemorySpace,
    partition: Partition,
    classes: ClassTable,
    window: BumpAllocator,
    gc: GcController,
    registry: Registry,
    threads: ThreadRegistry,
    class_cache: ClassStateCache,
    immutable_assoc: ImmutableAssocTable,
    /// Addresses pinned across an allocation that may collect; the
    /// collector updates them in place.
    tmp_roots: Vec<Address>,
}

impl MemoryManager {
    pub fn new(options: Options) -> MemoryManager {
        MemoryManager::with_collector(options, Box::new(CopyingCollector::new()))
    }

    /// Build a manager around a specific collection strategy.
    pub fn with_collector(
        options: Options,
        collector: Box<dyn GarbageCollector>,
    ) -> MemoryManager {
        let options = options.normalize();
        let mut partition = Partition::new(&options);
        let mut mem = MemorySpace::new(partition.total_size());
        let classes = ClassTable::bootstrap(&mut mem, &mut partition)
            .expect("rom too small for the system classes");
        let mut gc = GcController::new(collector);
        let ram = partition.region(RegionKind::Ram);
        let window = gc.initialize(ram.start, ram.start, ram.end);

        // the ROM segment is the primordial object memory: canonical
        // range starting at zero, identity residency, hashed once
        let mut registry = Registry::new();
        let rom_end = partition.region(RegionKind::Rom).end;
        let bootstrap = Arc::new(ObjectMemory::new(
            BOOTSTRAP_URI,
            Address::ZERO,
            rom_end.as_usize(),
            Address::ZERO,
            content_hash(mem.bytes(Address::ZERO, rom_end.as_usize())),
            0,
            None,
        ));
        registry.register(&partition, bootstrap);

        info!(
            "memory manager up: {} bytes rom, {} bytes nvm, {} bytes heap",
            options.rom_size, options.nvm_size, options.heap_size
        );
        MemoryManager {
            options,
            state: Arc::new(GlobalState::default()),
            mem,
            partition,
            classes,
            window,
            gc,
            registry,
            threads: ThreadRegistry::default(),
            class_cache: ClassStateCache::default(),
            immutable_assoc: ImmutableAssocTable::default(),
            tmp_roots: Vec::new(),
        }
    }

    /* ---- component access ---- */

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn memory(&self) -> &MemorySpace {
        &self.mem
    }

    /// Mutable access to the modeled space, for the host interpreter's
    /// field stores.
    pub fn memory_mut(&mut self) -> &mut MemorySpace {
        &mut self.mem
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub(crate) fn partition_mut(&mut self) -> &mut Partition {
        &mut self.partition
    }

    pub fn window(&self) -> &BumpAllocator {
        &self.window
    }

    pub fn gc(&self) -> &GcController {
        &self.gc
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn state(&self) -> Arc<GlobalState> {
        self.state.clone()
    }

    /// Mark (or unmark) the calling context as the privileged service
    /// context, exempt from stress-mode diversion.
    pub fn set_privileged(&self, privileged: bool) {
        self.state.set_privileged(privileged);
    }

    pub(crate) fn push_tmp_root(&mut self, oop: Address) {
        self.tmp_roots.push(oop);
    }

    pub(crate) fn pop_tmp_root(&mut self) -> Address {
        self.tmp_roots.pop().expect("unbalanced pinned-root stack")
    }

    delegate! {
        to self.gc {
            /// Hook for the external thread lifecycle: a stack chunk
            /// becomes a collection root.
            pub fn register_stack_chunk(&mut self, chunk: Address);
            pub fn deregister_stack_chunk(&mut self, chunk: Address);
            pub fn stats(&self) -> &GcStats;
        }
        to self.registry {
            pub fn lookup_by_uri(&self, uri: &str) -> Option<Arc<ObjectMemory>>;
            pub fn lookup_by_root(&self, root: Address) -> Option<Arc<ObjectMemory>>;
        }
        to self.threads {
            #[call(register)]
            pub fn register_thread(&mut self, thread: &Arc<ThreadHandle>);
        }
    }

    pub fn register_object_memory(&mut self, memory: Arc<ObjectMemory>) {
        self.registry.register(&self.partition, memory);
    }

    pub fn unregister_object_memory(&mut self, uri: &str) {
        self.registry.unregister(uri);
    }

    pub fn bootstrap_memory(&self) -> Arc<ObjectMemory> {
        self.registry.bootstrap().clone()
    }

    /// The cross-context class-state cache. Collection invalidates it and
    /// it must stay invalid until collection completes.
    pub fn cached_class_state(&self) -> Option<Address> {
        self.class_cache.get()
    }

    pub fn cache_class_state(&self, record: Address) {
        self.class_cache.set(record);
    }

    /* ---- class definition (host class-loader surface) ---- */

    pub fn define_instance_class(
        &mut self,
        name: &str,
        size_words: usize,
        oop_map: Vec<usize>,
    ) -> Result<Address> {
        let klass = classtable::carve_class_object(
            &mut self.mem,
            &mut self.partition,
            self.classes.class_class(),
        )?;
        self.classes.register(
            klass,
            ClassInfo {
                name: name.to_string(),
                layout: ClassLayout::Instance {
                    size_words,
                    oop_map,
                },
            },
        );
        Ok(klass)
    }

    pub fn define_array_class(
        &mut self,
        name: &str,
        element_size: ByteSize,
        refs: bool,
    ) -> Result<Address> {
        let klass = classtable::carve_class_object(
            &mut self.mem,
            &mut self.partition,
            self.classes.class_class(),
        )?;
        self.classes.register(
            klass,
            ClassInfo {
                name: name.to_string(),
                layout: ClassLayout::Array { element_size, refs },
            },
        );
        Ok(klass)
    }

    /* ---- allocation ---- */

    /// Raw allocation with the collect-and-retry ladder: bump, a
    /// non-forced collection, a forced full collection, then out of
    /// memory. The returned block is zero-filled.
    fn carve(&mut self, size: ByteSize) -> Result<Address> {
        if !self.state.allocation_enabled() {
            return Err(MemoryError::IllegalState {
                reason: "allocation while globally disabled".to_string(),
            });
        }
        debug_assert!(
            conversions::raw_is_aligned(size, BYTES_IN_WORD),
            "allocation size {} is not word rounded",
            size
        );

        let count = self.state.count_allocation();
        if self.options.stress_period != DEFAULT_STRESS_PERIOD
            && !self.state.is_privileged()
            && count % self.options.stress_period == 0
        {
            trace!("stress allocation {}: collecting before the bump", count);
            self.collect_garbage(false);
        }

        if let Some(block) = self.window.bump(&mut self.mem, size) {
            return Ok(block);
        }
        self.collect_garbage(false);
        if let Some(block) = self.window.bump(&mut self.mem, size) {
            return Ok(block);
        }
        debug!(
            "allocation of {} bytes still failing, forcing a full collection",
            size
        );
        self.collect_garbage(true);
        if let Some(block) = self.window.bump(&mut self.mem, size) {
            return Ok(block);
        }
        Err(MemoryError::oom_bytes(size))
    }

    pub fn allocate_instance(&mut self, klass: Address) -> Result<Address> {
        let size_words = match self.classes.layout_of(klass) {
            ClassLayout::Instance { size_words, .. } => *size_words,
            layout => panic!("allocate_instance on {:?}", layout),
        };
        let block = self.carve(conversions::words_to_bytes(1 + size_words))?;
        // raw block in hand: nothing in this window may allocate, yield,
        // or retain the address past a collection
        self.state.set_allocation_enabled(false);
        let oop = block + BYTES_IN_WORD;
        self.mem.store_addr(block, klass);
        self.state.set_allocation_enabled(true);
        debug_assert!(
            !self.partition.in_ram(klass) || klass < oop,
            "a heap-resident class must sit below its instances"
        );
        trace!("allocated instance of {} at {}", klass, oop);
        Ok(oop)
    }

    pub fn allocate_array(&mut self, klass: Address, length: usize) -> Result<Address> {
        let element_size = match self.classes.layout_of(klass) {
            ClassLayout::Array { element_size, .. } => *element_size,
            layout => panic!("allocate_array on {:?}", layout),
        };
        let length_word = header::encode_length_word(length)?;
        let body = conversions::word_align_up(length * element_size);
        let block = self.carve(2 * BYTES_IN_WORD + body)?;
        self.state.set_allocation_enabled(false);
        let oop = block + 2 * BYTES_IN_WORD;
        self.mem.store_word(block, length_word);
        self.mem.store_addr(block + BYTES_IN_WORD, klass);
        self.state.set_allocation_enabled(true);
        debug_assert!(!self.partition.in_ram(klass) || klass < oop);
        trace!("allocated {}-element array of {} at {}", length, klass, oop);
        Ok(oop)
    }

    /// A stack chunk is an array of reference slots; registering it as a
    /// collection root is the thread lifecycle's separate call.
    pub fn allocate_stack_chunk(&mut self, slots: usize) -> Result<Address> {
        let klass = self.classes.stack_chunk_class();
        self.allocate_array(klass, slots)
    }

    /// Allocate a method object: `extra_header_words` of prologue between
    /// the leading info word and the trailing [length, info, class] words,
    /// and a zeroed body of `body_bytes` bytecodes.
    pub fn allocate_method(
        &mut self,
        extra_header_words: usize,
        body_bytes: usize,
    ) -> Result<Address> {
        let header_words = MIN_METHOD_HEADER_WORDS + extra_header_words;
        let info = header::encode_method_info(header_words);
        let length_word = header::encode_length_word(body_bytes)?;
        let klass = self.classes.method_class();
        let header_bytes = conversions::words_to_bytes(header_words);
        let block = self.carve(header_bytes + conversions::word_align_up(body_bytes))?;
        self.state.set_allocation_enabled(false);
        let oop = block + header_bytes;
        self.mem.store_word(block, info);
        self.mem.store_word(oop - 3 * BYTES_IN_WORD, length_word);
        self.mem.store_word(oop - 2 * BYTES_IN_WORD, info);
        self.mem.store_addr(oop - BYTES_IN_WORD, klass);
        self.state.set_allocation_enabled(true);
        trace!("allocated method at {} ({} header words)", oop, header_words);
        Ok(oop)
    }

    /* ---- collection ---- */

    /// Trigger a collection. The side-table monitor slots ride along as
    /// roots so ROM/NVM objects keep their heap monitors alive.
    pub fn collect_garbage(&mut self, force_full: bool) -> bool {
        let monitored = self.immutable_assoc.monitored();
        let mut side_monitors: Vec<Address> = monitored
            .iter()
            .map(|&k| self.immutable_assoc.get(k).monitor)
            .collect();
        let full = {
            let mut heap = HeapContext {
                mem: &mut self.mem,
                classes: &self.classes,
                window: &mut self.window,
            };
            self.gc.collect(
                &self.state,
                &mut self.threads,
                &self.class_cache,
                &mut heap,
                vec![&mut self.tmp_roots, &mut side_monitors],
                force_full,
            )
        };
        for (oop, monitor) in monitored.into_iter().zip(side_monitors) {
            self.immutable_assoc.entry_mut(oop).monitor = monitor;
        }
        if self.options.verbose_gc {
            info!(
                "collection ({}): {} bytes in use, {} free",
                if full { "full" } else { "partial" },
                self.gc.stats().bytes_in_use(),
                self.window.free()
            );
        }
        full
    }

    pub fn free_memory(&self) -> ByteSize {
        self.gc.free_memory(self.window.cursor())
    }

    pub fn total_memory(&self) -> ByteSize {
        self.gc.total_memory()
    }

    pub fn live_thread_count(&self) -> usize {
        self.threads.live_count()
    }

    /* ---- identity: hashcodes and monitors ---- */

    pub fn get_or_create_association(&mut self, oop: Address) -> Result<Address> {
        assert!(
            self.partition.in_ram(oop),
            "objects outside managed ram have immutable headers"
        );
        let assoc_class = self.classes.association_class();
        if let ClassSlot::Association(assoc) = header::class_slot(&self.mem, assoc_class, oop) {
            return Ok(assoc);
        }
        // allocating can collect and move the object; pin it
        self.tmp_roots.push(oop);
        let allocated = self.allocate_instance(assoc_class);
        let oop = self.pop_tmp_root();
        let assoc = allocated?;
        let klass = match header::class_slot(&self.mem, assoc_class, oop) {
            ClassSlot::Class(klass) => klass,
            ClassSlot::Association(assoc) => return Ok(assoc),
        };
        let vtable = self
            .mem
            .load_addr(klass + conversions::words_to_bytes(CLASS_VTABLE_FIELD));
        association::init(&mut self.mem, assoc, klass, vtable);
        header::set_class_slot(&mut self.mem, oop, assoc);
        trace!("installed association {} for {}", assoc, oop);
        Ok(assoc)
    }

    /// Identity hashcode, assigned from a monotonically increasing counter
    /// on first use and cached afterwards.
    pub fn hash_code(&mut self, oop: Address) -> Result<usize> {
        if !self.partition.in_ram(oop) {
            let entry = self.immutable_assoc.entry_mut(oop);
            if entry.hash == 0 {
                entry.hash = self.state.next_hashcode();
            }
            return Ok(entry.hash);
        }
        let assoc = self.get_or_create_association(oop)?;
        let current = association::hashcode(&self.mem, assoc);
        if current != 0 {
            return Ok(current);
        }
        let hash = self.state.next_hashcode();
        association::set_hashcode(&mut self.mem, assoc, hash);
        Ok(hash)
    }

    pub fn monitor_of(&self, oop: Address) -> Option<Address> {
        if !self.partition.in_ram(oop) {
            let monitor = self.immutable_assoc.get(oop).monitor;
            return (!monitor.is_zero()).then_some(monitor);
        }
        match header::class_slot(&self.mem, self.classes.association_class(), oop) {
            ClassSlot::Association(assoc) => {
                let monitor = association::monitor(&self.mem, assoc);
                (!monitor.is_zero()).then_some(monitor)
            }
            ClassSlot::Class(_) => None,
        }
    }

    pub fn set_monitor(&mut self, oop: Address, monitor: Address) -> Result<()> {
        if !self.partition.in_ram(oop) {
            self.immutable_assoc.entry_mut(oop).monitor = monitor;
            return Ok(());
        }
        let assoc = self.get_or_create_association(oop)?;
        association::set_monitor(&mut self.mem, assoc, monitor);
        Ok(())
    }

    pub fn get_or_create_monitor(&mut self, oop: Address) -> Result<Address> {
        if let Some(monitor) = self.monitor_of(oop) {
            return Ok(monitor);
        }
        let monitor_class = self.classes.monitor_class();
        if !self.partition.in_ram(oop) {
            let monitor = self.allocate_instance(monitor_class)?;
            self.immutable_assoc.entry_mut(oop).monitor = monitor;
            return Ok(monitor);
        }
        let assoc = self.get_or_create_association(oop)?;
        // the association may move while the monitor is allocated
        self.tmp_roots.push(assoc);
        let allocated = self.allocate_instance(monitor_class);
        let assoc = self.pop_tmp_root();
        let monitor = allocated?;
        association::set_monitor(&mut self.mem, assoc, monitor);
        Ok(monitor)
    }

    /// Restore the bare class pointer if the object's association carries
    /// no hashcode and no monitor.
    pub fn collapse_association(&mut self, oop: Address) -> bool {
        if !self.partition.in_ram(oop) {
            return false;
        }
        association::collapse(&mut self.mem, &self.classes, oop)
    }

    /* ---- object memories ---- */

    pub fn load_object_memory(
        &mut self,
        resolver: &dyn ImageResolver,
        uri: &str,
        read_only: bool,
    ) -> Result<Arc<ObjectMemory>> {
        loader::load(self, resolver, uri, read_only)
    }

    /// Serialize the graph rooted at `root` against `parent` (the
    /// bootstrap memory when `None`) and return the wire bytes.
    pub fn save_object_memory(
        &self,
        root: Address,
        parent: Option<Arc<ObjectMemory>>,
    ) -> Result<Vec<u8>> {
        let parent = parent.unwrap_or_else(|| self.bootstrap_memory());
        let chain = parent_chain(&parent);
        let graph = serializer::copy_graph(
            &self.mem,
            &self.classes,
            &self.partition,
            &chain,
            parent.canonical_end(),
            root,
        )?;
        let implicit = Arc::ptr_eq(&parent, self.registry.bootstrap());
        let (parent_uri, parent_hash) = if implicit {
            ("", 0)
        } else {
            (parent.uri(), parent.hash())
        };
        debug!(
            "serialized {} canonical bytes rooted at {} (parent: {:?})",
            graph.bytes.len(),
            root,
            parent_uri
        );
        Ok(serializer::write_image(&graph, parent_uri, parent_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_manager() -> MemoryManager {
        MemoryManager::new(Options {
            rom_size: 2 << 10,
            nvm_size: 2 << 10,
            heap_size: 8 << 10,
            ..Options::default()
        })
    }

    #[test]
    fn instance_allocation_is_header_initialized_and_zeroed() {
        let mut mgr = small_manager();
        let point = mgr.define_instance_class("test.Point", 2, vec![]).unwrap();
        let oop = mgr.allocate_instance(point).unwrap();
        assert!(mgr.partition().in_ram(oop));
        assert!(matches!(
            header::class_slot(mgr.memory(), mgr.classes().association_class(), oop),
            ClassSlot::Class(k) if k == point
        ));
        assert_eq!(mgr.memory().load_word(oop), 0);
        assert_eq!(mgr.memory().load_word(oop + BYTES_IN_WORD), 0);
    }

    #[test]
    fn array_allocation_round_trips_length() {
        let mut mgr = small_manager();
        let words = mgr
            .define_array_class("test.WordArray", BYTES_IN_WORD, false)
            .unwrap();
        let oop = mgr.allocate_array(words, 5).unwrap();
        let length_word = mgr.memory().load_word(oop - 2 * BYTES_IN_WORD);
        assert_eq!(header::decode_length_word(length_word), 5);
        let layout = ClassLayout::Array {
            element_size: BYTES_IN_WORD,
            refs: false,
        };
        assert_eq!(
            header::body_size(&layout, mgr.memory(), oop),
            5 * BYTES_IN_WORD
        );
    }

    #[test]
    fn method_allocation_header_round_trips() {
        let mut mgr = small_manager();
        let oop = mgr.allocate_method(2, 17).unwrap();
        let layout = ClassLayout::Method;
        let block = header::oop_to_block(&layout, mgr.memory(), oop);
        assert_eq!(
            oop - block,
            conversions::words_to_bytes(MIN_METHOD_HEADER_WORDS + 2)
        );
        assert_eq!(header::block_to_oop(mgr.memory(), block), oop);
        assert_eq!(
            header::body_size(&layout, mgr.memory(), oop),
            conversions::word_align_up(17)
        );
    }

    #[test]
    fn hashcodes_are_stable_and_monotonic() {
        let mut mgr = small_manager();
        let point = mgr.define_instance_class("test.Point", 1, vec![]).unwrap();
        let a = mgr.allocate_instance(point).unwrap();
        let b = mgr.allocate_instance(point).unwrap();
        let ha = mgr.hash_code(a).unwrap();
        let hb = mgr.hash_code(b).unwrap();
        assert_ne!(ha, 0);
        assert!(hb > ha);
        assert_eq!(mgr.hash_code(a).unwrap(), ha);
    }

    #[test]
    fn rom_objects_hash_through_the_side_table() {
        let mut mgr = small_manager();
        let rom_oop = mgr.classes().monitor_class(); // any ROM-resident object
        let h = mgr.hash_code(rom_oop).unwrap();
        assert_ne!(h, 0);
        assert_eq!(mgr.hash_code(rom_oop).unwrap(), h);
        assert!(mgr.monitor_of(rom_oop).is_none());
        let monitor = mgr.get_or_create_monitor(rom_oop).unwrap();
        assert_eq!(mgr.monitor_of(rom_oop), Some(monitor));
    }

    #[test]
    fn unused_association_collapses_and_monitor_reads_false() {
        let mut mgr = small_manager();
        let point = mgr.define_instance_class("test.Point", 1, vec![]).unwrap();
        let oop = mgr.allocate_instance(point).unwrap();

        // created in anticipation of a hashcode, but never used
        let assoc = mgr.get_or_create_association(oop).unwrap();
        assert!(matches!(
            header::class_slot(mgr.memory(), mgr.classes().association_class(), oop),
            ClassSlot::Association(a) if a == assoc
        ));

        assert!(mgr.collapse_association(oop));
        assert!(matches!(
            header::class_slot(mgr.memory(), mgr.classes().association_class(), oop),
            ClassSlot::Class(k) if k == point
        ));
        assert!(mgr.monitor_of(oop).is_none());
    }

    #[test]
    fn association_survives_once_hashcode_is_assigned() {
        let mut mgr = small_manager();
        let point = mgr.define_instance_class("test.Point", 1, vec![]).unwrap();
        let oop = mgr.allocate_instance(point).unwrap();
        let h = mgr.hash_code(oop).unwrap();
        assert!(!mgr.collapse_association(oop));
        assert_eq!(mgr.hash_code(oop).unwrap(), h);
    }

    #[test]
    fn allocation_while_disabled_is_illegal_state() {
        let mut mgr = small_manager();
        let point = mgr.define_instance_class("test.Point", 1, vec![]).unwrap();
        mgr.state.set_allocation_enabled(false);
        let err = mgr.allocate_instance(point).unwrap_err();
        assert!(matches!(err, MemoryError::IllegalState { .. }));
        mgr.state.set_allocation_enabled(true);
        assert!(mgr.allocate_instance(point).is_ok());
    }

    #[test]
    fn stress_mode_collects_but_still_allocates() {
        let mut mgr = MemoryManager::new(Options {
            rom_size: 2 << 10,
            nvm_size: 2 << 10,
            heap_size: 8 << 10,
            stress_period: 1,
            ..Options::default()
        });
        let point = mgr.define_instance_class("test.Point", 1, vec![]).unwrap();
        for _ in 0..4 {
            mgr.allocate_instance(point).unwrap();
        }
        assert!(mgr.gc().stats().total_collections() >= 4);

        // the privileged service context is exempt
        let collections = mgr.gc().stats().total_collections();
        mgr.set_privileged(true);
        mgr.allocate_instance(point).unwrap();
        assert_eq!(mgr.gc().stats().total_collections(), collections);
    }
}
