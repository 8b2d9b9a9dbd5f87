//! Utilities used across the crate.

pub mod address;
pub mod constants;
pub mod conversions;
pub mod logger;
pub mod options;

pub use self::address::Address;
pub use self::address::{ByteOffset, ByteSize};
