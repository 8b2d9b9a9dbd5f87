//! The error taxonomy of the memory manager.
//!
//! Format and integrity errors abort an image load before any registration
//! occurs; out-of-memory propagates to the original allocation site after
//! the collection retries are exhausted; relocation-invariant violations
//! are fatal to the load because there is no safe partial-completion state
//! once pointer rewriting has begun. Re-entrant collection is a host
//! scheduling bug and fails an assertion instead of returning an error.

use thiserror::Error;

use crate::util::ByteSize;

pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// The allocator exhausted the heap after a non-forced and a forced
    /// collection, or a requested array length cannot be encoded in a
    /// header word.
    #[error("out of memory: {reason}")]
    OutOfMemory { reason: String },

    /// Bad magic, unsupported version, or a word width that does not match
    /// the running platform.
    #[error("malformed object memory {uri}: {reason}")]
    Format { uri: String, reason: String },

    /// The hash a child recorded for its parent does not match the
    /// resolved parent's content hash.
    #[error(
        "object memory {uri}: recorded parent hash {expected:#010x} does not \
         match parent {parent_uri} hash {actual:#010x}"
    )]
    Integrity {
        uri: String,
        parent_uri: String,
        expected: u32,
        actual: u32,
    },

    /// Oop-bitmap residue, a marked word outside the image, a canonical
    /// address outside the parent chain, or a working buffer that moved
    /// under a collection.
    #[error("relocation invariant violated in {uri}: {reason}")]
    RelocationInvariant { uri: String, reason: String },

    /// An object graph being serialized reaches an address that is neither
    /// in the collected heap nor covered by the chosen parent chain.
    #[error("cannot serialize object graph: {reason}")]
    Serialization { reason: String },

    /// A host-runtime bug observable as an error value, such as allocating
    /// while allocation is globally disabled.
    #[error("illegal state: {reason}")]
    IllegalState { reason: String },

    /// The image source could not produce the bytes for a URI.
    #[error("failed to read object memory {uri}")]
    Io {
        uri: String,
        #[source]
        source: std::io::Error,
    },
}

impl MemoryError {
    pub(crate) fn oom_bytes(size: ByteSize) -> MemoryError {
        MemoryError::OutOfMemory {
            reason: format!("failed to allocate {} bytes", size),
        }
    }
}
