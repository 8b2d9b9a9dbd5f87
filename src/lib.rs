//! emberheap is the memory manager of the Ember embedded language runtime.
//!
//! The crate owns four concerns and nothing else:
//!
//! - the object layout and header scheme (`object`): bit-tagged header
//!   words distinguishing instance, array and method blocks, plus the lazy
//!   object-association records that stand in for a class slot when an
//!   object needs a hashcode or a monitor;
//! - bump allocation over the RAM heap (`heap`) with a collect-and-retry
//!   ladder and an optional stress mode;
//! - the pluggable stop-the-world collector contract and the committed
//!   two-space copying strategy (`gc`);
//! - loading, verifying and relocating serialized object-memory images
//!   that form parent-chained read-only code/data regions (`image`).
//!
//! Everything is reached through one explicit [`MemoryManager`] context;
//! there is no global state. The address space itself is modeled as an
//! owned, bounds-checked buffer, which keeps the crate safe Rust while
//! preserving the word- and tag-level semantics of the runtime.
//!
//! The manager is not internally synchronized. Its correctness depends on
//! the host scheduler's guarantee that a single logical thread of managed
//! execution is active at any instant; collection runs to completion on
//! the calling context.

#[macro_use]
extern crate log;

pub mod error;
pub mod gc;
pub mod global_state;
pub mod heap;
pub mod image;
pub mod manager;
pub mod object;
pub mod util;

pub use crate::error::{MemoryError, Result};
pub use crate::manager::MemoryManager;
pub use crate::util::address::Address;
pub use crate::util::options::Options;
