//! Real register access through `/dev/mem`.
//!
//! Each PMU block is mapped once with `memmap2`; register accesses are
//! volatile 32-bit loads and stores into those mappings. Needs root and a
//! kernel that allows `/dev/mem` access to the PMU range.

use anyhow::{Context, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::{Duration, Instant};

use super::backend::RegisterBackend;

/// Register backend over `/dev/mem` mappings.
pub struct DevMemBackend {
    file: File,
    maps: Vec<MmapMut>,
}

impl DevMemBackend {
    /// Open `/dev/mem`.
    pub fn open() -> Result<Self> {
        Self::open_path("/dev/mem")
    }

    /// Open a memory device at `path`.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self { file, maps: Vec::new() })
    }

    /// Check that a 32-bit access at `addr` stays inside one mapping.
    fn is_mapped(&self, addr: u64) -> bool {
        self.maps.iter().any(|m| {
            let start = m.as_ptr() as u64;
            addr >= start && addr + 4 <= start + m.len() as u64 && addr % 4 == 0
        })
    }
}

impl RegisterBackend for DevMemBackend {
    fn map_block(&mut self, phys_base: u64, size: u64) -> Option<u64> {
        // SAFETY: the mapping covers device registers, not memory shared with
        // Rust objects; it is only ever accessed through volatile operations.
        let map = unsafe {
            MmapOptions::new()
                .offset(phys_base)
                .len(size as usize)
                .map_mut(&self.file)
        };
        match map {
            Ok(mut map) => {
                let base = map.as_mut_ptr() as u64;
                self.maps.push(map);
                Some(base)
            }
            Err(e) => {
                log::error!("mmap of 0x{:08X}+0x{:X} failed: {}", phys_base, size, e);
                None
            }
        }
    }

    fn read32(&mut self, addr: u64) -> u32 {
        if !self.is_mapped(addr) {
            log::error!("read of unmapped address 0x{:X}", addr);
            return 0;
        }
        // SAFETY: `addr` is aligned and inside a live mapping (checked above).
        unsafe { std::ptr::read_volatile(addr as *const u32) }
    }

    fn write32(&mut self, addr: u64, value: u32) {
        if !self.is_mapped(addr) {
            log::error!("write of unmapped address 0x{:X}", addr);
            return;
        }
        // SAFETY: `addr` is aligned and inside a live mapping (checked above).
        unsafe { std::ptr::write_volatile(addr as *mut u32, value) }
    }

    fn delay_us(&mut self, us: u32) {
        let deadline = Instant::now() + Duration::from_micros(us as u64);
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }
}
