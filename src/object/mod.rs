//! The object model: header codec, class metadata, and object
//! associations.

pub mod association;
pub mod classtable;
pub mod header;

pub use self::classtable::{ClassInfo, ClassLayout, ClassTable};
pub use self::header::{ClassSlot, HeaderTag};
