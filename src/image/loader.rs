//! Loading object memories: decode the wire format, resolve the parent
//! chain, verify content hashes, relocate pointers, and optionally migrate
//! the image into read-only storage.
//!
//! Failure modes: malformed magic/version/word-size are format errors, a
//! parent hash mismatch is an integrity error, and both abort the load
//! before any registration. Once pointer rewriting has begun, any
//! violation of the relocation invariants is fatal to the load. The whole
//! load runs on the privileged service context; a forced full collection
//! runs immediately before relocation so the working buffer cannot move
//! mid-walk, and its identity is re-checked afterwards.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{MemoryError, Result};
use crate::global_state::GlobalState;
use crate::image::relocator::{self, CanonicalRange, OopBitmap};
use crate::image::wire::{self, Reader};
use crate::image::{content_hash, parent_chain, ObjectMemory};
use crate::manager::MemoryManager;
use crate::object::header;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::conversions;

/// Resolves an object-memory URI to its wire bytes. Wire-level I/O itself
/// belongs to the host; the manager only consumes this capability.
pub trait ImageResolver {
    fn read(&self, uri: &str) -> io::Result<Vec<u8>>;
}

/// Resolver mapping URIs to files beneath a base directory.
pub struct FileImageResolver {
    base: PathBuf,
}

impl FileImageResolver {
    pub fn new(base: impl Into<PathBuf>) -> FileImageResolver {
        FileImageResolver { base: base.into() }
    }
}

impl ImageResolver for FileImageResolver {
    fn read(&self, uri: &str) -> io::Result<Vec<u8>> {
        fs::read(self.base.join(uri))
    }
}

/// In-memory resolver, convenient for tests and embedding.
impl ImageResolver for std::collections::HashMap<String, Vec<u8>> {
    fn read(&self, uri: &str) -> io::Result<Vec<u8>> {
        self.get(uri).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no image for {}", uri))
        })
    }
}

/// Marks the service context privileged for the duration of a load.
struct PrivilegedGuard {
    state: Arc<GlobalState>,
    was: bool,
}

impl PrivilegedGuard {
    fn enter(state: Arc<GlobalState>) -> PrivilegedGuard {
        let was = state.is_privileged();
        state.set_privileged(true);
        PrivilegedGuard { state, was }
    }
}

impl Drop for PrivilegedGuard {
    fn drop(&mut self) {
        self.state.set_privileged(self.was);
    }
}

pub(crate) fn load(
    mgr: &mut MemoryManager,
    resolver: &dyn ImageResolver,
    uri: &str,
    read_only: bool,
) -> Result<Arc<ObjectMemory>> {
    // an already-registered image is never loaded twice
    if let Some(memory) = mgr.lookup_by_uri(uri) {
        debug!("reusing registered object memory {}", uri);
        return Ok(memory);
    }

    let data = resolver.read(uri).map_err(|source| MemoryError::Io {
        uri: uri.to_string(),
        source,
    })?;
    let format = |reason: String| MemoryError::Format {
        uri: uri.to_string(),
        reason,
    };

    let mut r = Reader::new(&data);
    let wire_err = |e: wire::WireError| MemoryError::Format {
        uri: uri.to_string(),
        reason: e.to_string(),
    };

    let magic = r.read_u32().map_err(wire_err)?;
    if magic != wire::MAGIC {
        return Err(format(format!("bad magic {:#010x}", magic)));
    }
    let minor = r.read_u16().map_err(wire_err)?;
    let major = r.read_u16().map_err(wire_err)?;
    if (major, minor) != (wire::MAJOR_VERSION, wire::MINOR_VERSION) {
        return Err(format(format!("unsupported version {}.{}", major, minor)));
    }

    let attributes = r.read_u32().map_err(wire_err)?;
    let has_typemap = attributes & wire::ATTRIBUTE_TYPEMAP != 0;
    let image_32bit = attributes & wire::ATTRIBUTE_32BIT != 0;
    if image_32bit != cfg!(target_pointer_width = "32") {
        return Err(format(format!(
            "image word width ({}-bit) does not match the platform",
            if image_32bit { 32 } else { 64 }
        )));
    }
    let image_big_endian = attributes & wire::ATTRIBUTE_BIGENDIAN != 0;
    let swap = image_big_endian != cfg!(target_endian = "big");

    let parent_hash = r.read_u32().map_err(wire_err)?;
    let parent_uri = r.read_utf().map_err(wire_err)?;

    let root_offset = r.read_u32().map_err(wire_err)? as usize;
    let size = r.read_u32().map_err(wire_err)? as usize;
    if size == 0 || !conversions::raw_is_aligned(size, BYTES_IN_WORD) {
        return Err(format(format!("memory size {} is not a whole number of words", size)));
    }
    if root_offset >= size || !conversions::raw_is_aligned(root_offset, BYTES_IN_WORD) {
        return Err(format(format!("root offset {} escapes the memory", root_offset)));
    }

    let oopmap_bytes = r
        .read_bytes(wire::oopmap_len(size, BYTES_IN_WORD))
        .map_err(wire_err)?;
    r.align(wire::WIRE_ALIGNMENT).map_err(wire_err)?;
    let memory_bytes = r.read_bytes(size).map_err(wire_err)?;
    let typemap = if has_typemap {
        Some(r.read_bytes(size).map_err(wire_err)?)
    } else {
        None
    };

    // resolve the parent: the registry, a recursive load, or implicitly
    // the bootstrap memory when no parent is named
    let parent: Arc<ObjectMemory> = if parent_uri.is_empty() {
        mgr.registry().bootstrap().clone()
    } else if let Some(memory) = mgr.lookup_by_uri(&parent_uri) {
        memory
    } else {
        load(mgr, resolver, &parent_uri, read_only)?
    };
    if !parent_uri.is_empty() && parent.hash() != parent_hash {
        return Err(MemoryError::Integrity {
            uri: uri.to_string(),
            parent_uri,
            expected: parent_hash,
            actual: parent.hash(),
        });
    }

    // the canonical form is hashed before any relocation touches it
    let hash = content_hash(memory_bytes);
    let canonical_start = parent.canonical_end();

    let _privileged = PrivilegedGuard::enter(mgr.state());

    // place the raw bytes in a heap byte array
    let buffer = mgr.allocate_array(mgr.classes().byte_array_class(), size)?;
    mgr.memory_mut().write_bytes(buffer, memory_bytes);

    // force a full collection now so nothing can move once rewriting
    // starts, tracking the buffer through the pinned roots
    mgr.push_tmp_root(buffer);
    mgr.collect_garbage(true);
    let buffer = mgr.pop_tmp_root();

    let residency = if read_only {
        mgr.partition_mut().carve_nvm(size)?
    } else {
        buffer
    };

    let mut ranges: Vec<CanonicalRange> = parent_chain(&parent)
        .iter()
        .map(|m| CanonicalRange::from_memory(m.as_ref()))
        .collect();
    ranges.push(CanonicalRange {
        canonical_start,
        canonical_end: canonical_start + size,
        residency,
    });

    let mut bitmap = OopBitmap::from_bytes(oopmap_bytes, size / BYTES_IN_WORD);
    let pristine_bitmap = bitmap.clone();
    mgr.push_tmp_root(buffer);
    let relocated = relocator::relocate(
        mgr.memory_mut(),
        uri,
        buffer,
        size,
        &mut bitmap,
        &ranges,
        swap,
    );
    let buffer_after = mgr.pop_tmp_root();
    relocated?;
    if buffer_after != buffer {
        return Err(MemoryError::RelocationInvariant {
            uri: uri.to_string(),
            reason: "working buffer moved during relocation".to_string(),
        });
    }

    if swap {
        relocator::swap_image(mgr.memory_mut(), buffer, size, &pristine_bitmap, typemap);
    }

    if read_only {
        // migrate the relocated bytes, then shrink the transient buffer so
        // the collector sees a harmless zero-length array
        mgr.memory_mut().copy(buffer, residency, size);
        mgr.memory_mut()
            .store_word(buffer - 2 * BYTES_IN_WORD, header::encode_length_word(0)?);
    }

    let root = residency + root_offset;
    let memory = Arc::new(ObjectMemory::new(
        uri,
        residency,
        size,
        root,
        hash,
        canonical_start,
        Some(parent),
    ));
    if read_only {
        mgr.register_object_memory(memory.clone());
    }
    info!(
        "loaded object memory {} ({} bytes) at {}, root {}",
        uri, size, residency, root
    );
    Ok(memory)
}
