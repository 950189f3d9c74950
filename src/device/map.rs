//! Physical-to-mapped address resolution.
//!
//! Sequence tables name registers by physical address. At init every PMU
//! block listed in the table is mapped once through the backend, and the
//! resulting [`AddressMap`] is the only way a step obtains a [`RegAddr`].
//! The map is never modified afterwards, so concurrent lookups need no lock.

use std::fmt;

use super::backend::RegisterBackend;
use crate::table::BlockDesc;

/// Offset of the hardware atomic-set alias.
pub const ATOMIC_SET_OFFSET: u32 = 0xC000;
/// Offset of the hardware atomic-clear alias.
pub const ATOMIC_CLEAR_OFFSET: u32 = 0x8000;
/// Atomic aliases exist only for offsets below this limit.
pub const ATOMIC_OFFSET_LIMIT: u32 = 0x4000;

/// A resolved register: the block it lives in plus its offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegAddr {
    /// Physical base of the owning block.
    pub phys_base: u64,
    /// Mapped base of the owning block.
    pub base: u64,
    /// Offset within the block.
    pub offset: u32,
}

impl RegAddr {
    /// Mapped address of the register.
    #[inline]
    pub fn mapped(&self) -> u64 {
        self.base + self.offset as u64
    }

    /// Physical address of the register.
    #[inline]
    pub fn phys(&self) -> u64 {
        self.phys_base + self.offset as u64
    }

    /// Mapped address of the atomic-set alias, if the offset has one.
    pub fn atomic_set(&self) -> Option<u64> {
        (self.offset < ATOMIC_OFFSET_LIMIT).then(|| self.base + (self.offset | ATOMIC_SET_OFFSET) as u64)
    }

    /// Mapped address of the atomic-clear alias, if the offset has one.
    pub fn atomic_clear(&self) -> Option<u64> {
        (self.offset < ATOMIC_OFFSET_LIMIT).then(|| self.base + (self.offset | ATOMIC_CLEAR_OFFSET) as u64)
    }
}

impl fmt::Display for RegAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.phys())
    }
}

/// One mapped block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedBlock {
    /// Block name from the table.
    pub name: String,
    /// Physical base.
    pub phys_base: u64,
    /// Mapped base.
    pub base: u64,
    /// Size in bytes.
    pub size: u64,
}

impl MappedBlock {
    /// Check if a physical address falls within this block.
    #[inline]
    pub fn contains(&self, phys: u64) -> bool {
        phys >= self.phys_base && phys < self.phys_base + self.size
    }
}

/// Address Resolution Table.
#[derive(Debug, Clone, Default)]
pub struct AddressMap {
    blocks: Vec<MappedBlock>,
}

impl AddressMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map every block through the backend.
    ///
    /// Blocks that fail to map are logged and left out; steps that use them
    /// fail to resolve later, which makes only the affected entities unusable.
    pub fn build<B: RegisterBackend + ?Sized>(backend: &mut B, blocks: &[BlockDesc]) -> Self {
        let mut map = Self::new();
        for block in blocks {
            match backend.map_block(block.base, block.size) {
                Some(base) => {
                    log::debug!(
                        "mapped block {} 0x{:08X}+0x{:X} -> 0x{:X}",
                        block.name,
                        block.base,
                        block.size,
                        base
                    );
                    map.insert(&block.name, block.base, base, block.size);
                }
                None => {
                    log::error!("failed to map block {} at 0x{:08X}", block.name, block.base);
                }
            }
        }
        map
    }

    /// Record a mapped block.
    pub fn insert(&mut self, name: &str, phys_base: u64, base: u64, size: u64) {
        self.blocks.push(MappedBlock {
            name: name.to_string(),
            phys_base,
            base,
            size,
        });
    }

    /// Resolve a physical address to its block and offset.
    pub fn resolve(&self, phys: u64) -> Option<RegAddr> {
        self.blocks.iter().find(|b| b.contains(phys)).map(|b| RegAddr {
            phys_base: b.phys_base,
            base: b.base,
            offset: (phys - b.phys_base) as u32,
        })
    }

    /// All mapped blocks.
    pub fn blocks(&self) -> &[MappedBlock] {
        &self.blocks
    }

    /// Number of mapped blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True when nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> AddressMap {
        let mut map = AddressMap::new();
        map.insert("pmu", 0x1586_0000, 0xFFFF_0000_1586_0000, 0x1_0000);
        map
    }

    #[test]
    fn test_resolve_inside_block() {
        let reg = map().resolve(0x1586_1004).unwrap();
        assert_eq!(reg.offset, 0x1004);
        assert_eq!(reg.phys(), 0x1586_1004);
        assert_eq!(reg.mapped(), 0xFFFF_0000_1586_1004);
    }

    #[test]
    fn test_resolve_outside_block() {
        assert!(map().resolve(0x1587_0000).is_none());
        assert!(map().resolve(0x1585_FFFC).is_none());
    }

    #[test]
    fn test_atomic_aliases() {
        let reg = map().resolve(0x1586_1008).unwrap();
        assert_eq!(reg.atomic_set(), Some(0xFFFF_0000_1586_D008));
        assert_eq!(reg.atomic_clear(), Some(0xFFFF_0000_1586_9008));

        let high = map().resolve(0x1586_4000).unwrap();
        assert_eq!(high.atomic_set(), None);
        assert_eq!(high.atomic_clear(), None);
    }
}
