//! Manager configuration, read once from the environment at construction.

use std::env;
use std::str::FromStr;

use crate::util::constants::DEFAULT_STRESS_PERIOD;
use crate::util::conversions;
use crate::util::ByteSize;

/// Options controlling the memory manager. Every field can be overridden
/// from an `EMBERHEAP_*` environment variable; malformed values are logged
/// and ignored. Sizes are in bytes and are rounded up to a whole number of
/// words.
#[derive(Debug, Clone)]
pub struct Options {
    /// Size of the immutable ROM region holding the system class objects
    /// and whatever else the bootstrap burns in.
    pub rom_size: ByteSize,
    /// Size of the non-volatile region that read-only object memories are
    /// migrated into.
    pub nvm_size: ByteSize,
    /// Size of the collected RAM heap. A two-space collector halves this
    /// into semispaces.
    pub heap_size: ByteSize,
    /// Divert every Nth eligible allocation to the slow path and collect
    /// first. `usize::MAX` (the default) disables stress mode; 1 stresses
    /// every unprivileged allocation.
    pub stress_period: usize,
    /// Log collection statistics at info level rather than debug.
    pub verbose_gc: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            rom_size: 256 << 10,
            nvm_size: 256 << 10,
            heap_size: 256 << 10,
            stress_period: DEFAULT_STRESS_PERIOD,
            verbose_gc: false,
        }
    }
}

impl Options {
    /// Build options from the environment on top of the defaults.
    pub fn from_env() -> Options {
        let mut options = Options::default();
        if let Some(v) = env_parse("EMBERHEAP_ROM_SIZE") {
            options.rom_size = v;
        }
        if let Some(v) = env_parse("EMBERHEAP_NVM_SIZE") {
            options.nvm_size = v;
        }
        if let Some(v) = env_parse("EMBERHEAP_HEAP_SIZE") {
            options.heap_size = v;
        }
        if let Some(v) = env_parse("EMBERHEAP_STRESS_PERIOD") {
            options.stress_period = v;
        }
        if let Some(v) = env_parse("EMBERHEAP_VERBOSE_GC") {
            options.verbose_gc = v;
        }
        options.normalize()
    }

    /// Round sizes to whole words. Zero-sized regions are allowed for ROM
    /// and NVM (a RAM-only manager), not for the heap.
    pub fn normalize(mut self) -> Options {
        self.rom_size = conversions::word_align_up(self.rom_size);
        self.nvm_size = conversions::word_align_up(self.nvm_size);
        self.heap_size = conversions::word_align_up(self.heap_size);
        assert!(self.heap_size > 0, "heap size must be non-zero");
        assert!(self.stress_period > 0, "stress period must be non-zero");
        self
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Options;
    use crate::util::constants::BYTES_IN_WORD;

    #[test]
    fn defaults_are_word_rounded() {
        let o = Options::default().normalize();
        assert_eq!(o.rom_size % BYTES_IN_WORD, 0);
        assert_eq!(o.heap_size % BYTES_IN_WORD, 0);
    }

    #[test]
    fn normalize_rounds_up() {
        let o = Options {
            heap_size: BYTES_IN_WORD + 1,
            ..Options::default()
        }
        .normalize();
        assert_eq!(o.heap_size, 2 * BYTES_IN_WORD);
    }
}
