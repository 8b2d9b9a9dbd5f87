//! The static ROM / NVM / RAM partition of the modeled address space.
//!
//! ROM holds the system class objects burned in at bootstrap and is
//! registered as the primordial object memory. NVM is where read-only
//! object memories are migrated; it is carved monotonically and never
//! collected. RAM is the collected heap. The word at address zero belongs
//! to no region so a zero word always reads as the null reference.

use std::ops::Range;

use enum_map::{enum_map, Enum, EnumMap};

use crate::error::{MemoryError, Result};
use crate::util::constants::BYTES_IN_WORD;
use crate::util::conversions;
use crate::util::options::Options;
use crate::util::{Address, ByteSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
pub enum RegionKind {
    Rom,
    Nvm,
    Ram,
}

pub struct Partition {
    regions: EnumMap<RegionKind, Range<Address>>,
    rom_top: Address,
    nvm_top: Address,
}

impl Partition {
    pub fn new(options: &Options) -> Partition {
        let rom_start = Address::ZERO + BYTES_IN_WORD;
        let rom_end = rom_start + options.rom_size;
        let nvm_end = rom_end + options.nvm_size;
        let ram_end = nvm_end + options.heap_size;
        let regions = enum_map! {
            RegionKind::Rom => rom_start..rom_end,
            RegionKind::Nvm => rom_end..nvm_end,
            RegionKind::Ram => nvm_end..ram_end,
        };
        Partition {
            regions,
            rom_top: rom_start,
            nvm_top: rom_end,
        }
    }

    /// Total extent of the modeled space, including the reserved null word.
    pub fn total_size(&self) -> ByteSize {
        self.regions[RegionKind::Ram].end.as_usize()
    }

    pub fn region(&self, kind: RegionKind) -> Range<Address> {
        self.regions[kind].clone()
    }

    pub fn kind_of(&self, addr: Address) -> Option<RegionKind> {
        self.regions
            .iter()
            .find(|(_, r)| r.contains(&addr))
            .map(|(k, _)| k)
    }

    pub fn in_rom(&self, addr: Address) -> bool {
        self.regions[RegionKind::Rom].contains(&addr)
    }

    pub fn in_nvm(&self, addr: Address) -> bool {
        self.regions[RegionKind::Nvm].contains(&addr)
    }

    pub fn in_ram(&self, addr: Address) -> bool {
        self.regions[RegionKind::Ram].contains(&addr)
    }

    pub fn overlaps_ram(&self, start: Address, size: ByteSize) -> bool {
        let ram = &self.regions[RegionKind::Ram];
        start < ram.end && start + size > ram.start
    }

    /// Carve a word-aligned slot from ROM. Only meaningful while the
    /// bootstrap is burning in system objects.
    pub fn carve_rom(&mut self, size: ByteSize) -> Result<Address> {
        debug_assert!(conversions::raw_is_aligned(size, BYTES_IN_WORD));
        let end = self.regions[RegionKind::Rom].end;
        if self.rom_top + size > end {
            return Err(MemoryError::OutOfMemory {
                reason: format!("rom exhausted carving {} bytes", size),
            });
        }
        let slot = self.rom_top;
        self.rom_top += size;
        Ok(slot)
    }

    /// Address one past the last byte burned into ROM.
    pub fn rom_top(&self) -> Address {
        self.rom_top
    }

    /// Carve a word-aligned slot from NVM for a read-only object memory.
    pub fn carve_nvm(&mut self, size: ByteSize) -> Result<Address> {
        debug_assert!(conversions::raw_is_aligned(size, BYTES_IN_WORD));
        let end = self.regions[RegionKind::Nvm].end;
        if self.nvm_top + size > end {
            return Err(MemoryError::OutOfMemory {
                reason: format!("nvm exhausted carving {} bytes", size),
            });
        }
        let slot = self.nvm_top;
        self.nvm_top += size;
        trace!("carved {} nvm bytes at {}", size, slot);
        Ok(slot)
    }
}
