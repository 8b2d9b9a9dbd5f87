use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Global status flags and counters for one memory manager.
// This used to be scattered over the allocator and collector. Components
// that need the flags take a reference to this struct instead of the whole
// manager, which keeps the access pattern easy to reason about.
pub struct GlobalState {
    /// Allocation is globally enabled. False exactly during collection and
    /// during the narrow header-initialization windows where a raw block
    /// address is held but the object is not yet class-tagged.
    allocation_enabled: AtomicBool,
    /// A collection is in progress. Nested collection attempts are a fatal
    /// error.
    collecting: AtomicBool,
    /// The distinguished service context (collection, image relocation) is
    /// running; it is exempt from stress-mode diversion.
    privileged: AtomicBool,
    /// Source of identity hashcodes. Zero means "unused" and is skipped.
    next_hashcode: AtomicUsize,
    /// Allocations attempted since startup, used to pace stress mode.
    allocations: AtomicUsize,
}

impl Default for GlobalState {
    fn default() -> Self {
        GlobalState {
            allocation_enabled: AtomicBool::new(true),
            collecting: AtomicBool::new(false),
            privileged: AtomicBool::new(false),
            next_hashcode: AtomicUsize::new(1),
            allocations: AtomicUsize::new(0),
        }
    }
}

impl GlobalState {
    pub fn allocation_enabled(&self) -> bool {
        self.allocation_enabled.load(Ordering::SeqCst)
    }

    pub fn set_allocation_enabled(&self, enabled: bool) {
        self.allocation_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::SeqCst)
    }

    pub fn set_collecting(&self, collecting: bool) {
        self.collecting.store(collecting, Ordering::SeqCst);
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged.load(Ordering::SeqCst)
    }

    pub fn set_privileged(&self, privileged: bool) {
        self.privileged.store(privileged, Ordering::SeqCst);
    }

    /// Hand out the next identity hashcode, skipping the reserved
    /// "unused" value.
    pub fn next_hashcode(&self) -> usize {
        loop {
            let h = self.next_hashcode.fetch_add(1, Ordering::SeqCst);
            if h != 0 {
                return h;
            }
        }
    }

    /// Count an allocation attempt and return the running total.
    pub fn count_allocation(&self) -> usize {
        self.allocations.fetch_add(1, Ordering::SeqCst) + 1
    }
}
