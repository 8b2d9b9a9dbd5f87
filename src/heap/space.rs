//! The backing store of the modeled address space.
//!
//! Every word of ROM, NVM and RAM lives in one owned buffer, and every
//! load/store goes through here with bounds and alignment checks. An
//! out-of-range or misaligned access is a manager bug and panics; it is
//! never reported as a recoverable error.

use crate::util::constants::BYTES_IN_WORD;
use crate::util::conversions;
use crate::util::{Address, ByteSize};

pub struct MemorySpace {
    bytes: Vec<u8>,
}

impl MemorySpace {
    pub fn new(size: ByteSize) -> MemorySpace {
        assert!(
            conversions::raw_is_aligned(size, BYTES_IN_WORD),
            "modeled space size {} is not word aligned",
            size
        );
        MemorySpace {
            bytes: vec![0; size],
        }
    }

    pub fn size(&self) -> ByteSize {
        self.bytes.len()
    }

    fn check(&self, addr: Address, len: ByteSize) {
        assert!(
            addr.as_usize() + len <= self.bytes.len(),
            "access of {} bytes at {} escapes the modeled space of {} bytes",
            len,
            addr,
            self.bytes.len()
        );
    }

    fn check_word(&self, addr: Address) {
        self.check(addr, BYTES_IN_WORD);
        debug_assert!(
            conversions::is_word_aligned(addr),
            "word access at unaligned address {}",
            addr
        );
    }

    pub fn load_word(&self, addr: Address) -> usize {
        self.check_word(addr);
        let i = addr.as_usize();
        usize::from_ne_bytes(self.bytes[i..i + BYTES_IN_WORD].try_into().unwrap())
    }

    pub fn store_word(&mut self, addr: Address, value: usize) {
        self.check_word(addr);
        let i = addr.as_usize();
        self.bytes[i..i + BYTES_IN_WORD].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn load_addr(&self, addr: Address) -> Address {
        Address::from_usize(self.load_word(addr))
    }

    pub fn store_addr(&mut self, addr: Address, value: Address) {
        self.store_word(addr, value.as_usize());
    }

    pub fn zero(&mut self, start: Address, len: ByteSize) {
        self.check(start, len);
        let i = start.as_usize();
        self.bytes[i..i + len].fill(0);
    }

    /// Copy `len` bytes from `src` to `dst` within the space. The ranges
    /// may overlap.
    pub fn copy(&mut self, src: Address, dst: Address, len: ByteSize) {
        self.check(src, len);
        self.check(dst, len);
        let s = src.as_usize();
        self.bytes.copy_within(s..s + len, dst.as_usize());
    }

    pub fn bytes(&self, start: Address, len: ByteSize) -> &[u8] {
        self.check(start, len);
        let i = start.as_usize();
        &self.bytes[i..i + len]
    }

    pub fn write_bytes(&mut self, start: Address, data: &[u8]) {
        self.check(start, data.len());
        let i = start.as_usize();
        self.bytes[i..i + data.len()].copy_from_slice(data);
    }

    /// Swap the byte order of the `width`-byte slot at `addr`.
    pub fn swap_bytes(&mut self, addr: Address, width: usize) {
        self.check(addr, width);
        let i = addr.as_usize();
        self.bytes[i..i + width].reverse();
    }
}
