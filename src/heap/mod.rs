//! The modeled address space, its ROM/NVM/RAM partition, and the bump
//! allocator over the RAM heap.

pub mod bumpallocator;
pub mod partition;
pub mod space;

pub use self::bumpallocator::BumpAllocator;
pub use self::partition::{Partition, RegionKind};
pub use self::space::MemorySpace;
