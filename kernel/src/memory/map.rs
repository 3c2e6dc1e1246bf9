//! The boot-time physical memory map.

use crate::constants::memory::MAX_MEMORY_MAP_ENTRIES;
use crate::memory::error::MemoryError;
use crate::memory::range::{MemoryRange, MemoryType};
use arrayvec::ArrayVec;

/// Address-ordered collection of memory ranges describing the physical
/// layout. Populated exactly once by the bootloader-protocol parser during
/// boot; read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct MemoryMap {
    entries: ArrayVec<MemoryRange, MAX_MEMORY_MAP_ENTRIES>,
}

impl MemoryMap {
    pub fn new() -> Self {
        MemoryMap {
            entries: ArrayVec::new(),
        }
    }

    /// Appends an entry. The parser supplies entries in address order;
    /// callers with unsorted data should use `insert`.
    pub fn push(&mut self, range: MemoryRange) -> Result<(), MemoryError> {
        self.entries
            .try_push(range)
            .map_err(|_| MemoryError::InvalidArgument)
    }

    /// Inserts an entry, keeping the map address-ordered.
    pub fn insert(&mut self, range: MemoryRange) -> Result<(), MemoryError> {
        if self.entries.is_full() {
            return Err(MemoryError::InvalidArgument);
        }
        let index = self
            .entries
            .iter()
            .position(|entry| entry.base() > range.base())
            .unwrap_or(self.entries.len());
        self.entries.insert(index, range);
        Ok(())
    }

    pub fn entries(&self) -> &[MemoryRange] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRange> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes of usable memory reported by the map.
    pub fn total_usable(&self) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.kind() == MemoryType::Usable)
            .map(|entry| entry.size())
            .sum()
    }
}

impl<'a> IntoIterator for &'a MemoryMap {
    type Item = &'a MemoryRange;
    type IntoIter = core::slice::Iter<'a, MemoryRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_totals() {
        let mut map = MemoryMap::new();
        map.push(MemoryRange::new(0x0, 0x9f000, MemoryType::Usable))
            .unwrap();
        map.push(MemoryRange::new(0x9f000, 0x1000, MemoryType::Reserved))
            .unwrap();
        map.push(MemoryRange::new(0x100000, 0x400000, MemoryType::Usable))
            .unwrap();

        assert_eq!(map.len(), 3);
        assert_eq!(map.total_usable(), 0x9f000 + 0x400000);
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut map = MemoryMap::new();
        map.insert(MemoryRange::new(0x100000, 0x1000, MemoryType::Usable))
            .unwrap();
        map.insert(MemoryRange::new(0x0, 0x1000, MemoryType::Reserved))
            .unwrap();
        map.insert(MemoryRange::new(0x50000, 0x1000, MemoryType::Usable))
            .unwrap();

        let bases: Vec<u64> = map.iter().map(|entry| entry.base()).collect();
        assert_eq!(bases, vec![0x0, 0x50000, 0x100000]);
    }

    #[test]
    fn test_capacity_limit() {
        let mut map = MemoryMap::new();
        for i in 0..MAX_MEMORY_MAP_ENTRIES {
            map.push(MemoryRange::new(
                i as u64 * 0x1000,
                0x1000,
                MemoryType::Usable,
            ))
            .unwrap();
        }
        assert_eq!(
            map.push(MemoryRange::new(0, 0x1000, MemoryType::Usable)),
            Err(MemoryError::InvalidArgument)
        );
        assert_eq!(
            map.insert(MemoryRange::new(0, 0x1000, MemoryType::Usable)),
            Err(MemoryError::InvalidArgument)
        );
    }
}
