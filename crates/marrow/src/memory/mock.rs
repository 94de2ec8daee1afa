//! In-memory stand-in for a target address space, used by unit tests.
//!
//! Backed by plain byte segments: one main region at a configurable base
//! (standing in for the target's main module) plus one segment per live
//! allocation. Ranges can be marked inaccessible to exercise read/write
//! failure paths without a real process.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::layout::LayoutCache;
use crate::memory::space::MemorySpace;

const ALLOC_AREA: u64 = 0x7F00_0000_0000;
const ALLOC_ALIGN: u64 = 16;

#[derive(Debug)]
pub struct MockSpace {
    base: u64,
    region: Mutex<Vec<u8>>,
    denied: Vec<(u64, u64)>,
    allocations: Mutex<HashMap<u64, Vec<u8>>>,
    next_alloc: Mutex<u64>,
    cache: LayoutCache,
    attached: bool,
}

impl MockSpace {
    /// A space whose main region spans `[base, base + size)`, zero-filled.
    pub fn with_base(base: u64, size: usize) -> Self {
        MockSpaceBuilder::new().base(base).region_size(size).build()
    }

    pub fn builder() -> MockSpaceBuilder {
        MockSpaceBuilder::new()
    }

    /// Number of allocations that have not been freed yet.
    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().unwrap().len()
    }

    fn is_denied(&self, address: u64, count: usize) -> bool {
        let end = address.saturating_add(count as u64);
        self.denied
            .iter()
            .any(|&(start, len)| address < start.saturating_add(len) && end > start)
    }
}

impl MemorySpace for MockSpace {
    fn base_address(&self) -> u64 {
        self.base
    }

    fn layout_cache(&self) -> &LayoutCache {
        &self.cache
    }

    fn is_attached(&self) -> bool {
        self.attached
    }

    fn detach(&mut self) {
        self.attached = false;
    }

    fn read_raw(&self, address: u64, count: usize) -> Result<Vec<u8>> {
        if self.is_denied(address, count) {
            return Err(Error::MemoryReadFailed { address, count });
        }

        let region = self.region.lock().unwrap();
        let region_end = self.base + region.len() as u64;
        if address >= self.base && address.saturating_add(count as u64) <= region_end {
            let start = (address - self.base) as usize;
            return Ok(region[start..start + count].to_vec());
        }
        drop(region);

        let allocations = self.allocations.lock().unwrap();
        for (&start, data) in allocations.iter() {
            let end = start + data.len() as u64;
            if address >= start && address.saturating_add(count as u64) <= end {
                let offset = (address - start) as usize;
                return Ok(data[offset..offset + count].to_vec());
            }
        }

        Err(Error::MemoryReadFailed { address, count })
    }

    fn write_raw(&self, address: u64, bytes: &[u8]) -> Result<()> {
        if self.is_denied(address, bytes.len()) {
            return Err(Error::MemoryWriteFailed {
                address,
                count: bytes.len(),
            });
        }

        let mut region = self.region.lock().unwrap();
        let region_end = self.base + region.len() as u64;
        if address >= self.base && address.saturating_add(bytes.len() as u64) <= region_end {
            let start = (address - self.base) as usize;
            region[start..start + bytes.len()].copy_from_slice(bytes);
            return Ok(());
        }
        drop(region);

        let mut allocations = self.allocations.lock().unwrap();
        for (&start, data) in allocations.iter_mut() {
            let end = start + data.len() as u64;
            if address >= start && address.saturating_add(bytes.len() as u64) <= end {
                let offset = (address - start) as usize;
                data[offset..offset + bytes.len()].copy_from_slice(bytes);
                return Ok(());
            }
        }

        Err(Error::MemoryWriteFailed {
            address,
            count: bytes.len(),
        })
    }

    fn alloc_raw(&self, size: usize) -> Result<u64> {
        let mut next = self.next_alloc.lock().unwrap();
        let address = *next;
        *next += (size as u64).next_multiple_of(ALLOC_ALIGN);

        self.allocations
            .lock()
            .unwrap()
            .insert(address, vec![0u8; size]);
        Ok(address)
    }

    fn free_raw(&self, address: u64) -> Result<()> {
        match self.allocations.lock().unwrap().remove(&address) {
            Some(_) => Ok(()),
            None => Err(Error::invalid_argument(format!(
                "no live allocation at {address:#x}"
            ))),
        }
    }
}

pub struct MockSpaceBuilder {
    base: u64,
    size: usize,
    seeds: Vec<(u64, Vec<u8>)>,
    denied: Vec<(u64, u64)>,
    cache: Option<LayoutCache>,
}

impl MockSpaceBuilder {
    pub fn new() -> Self {
        MockSpaceBuilder {
            base: 0x0040_0000,
            size: 0x1000,
            seeds: Vec::new(),
            denied: Vec::new(),
            cache: None,
        }
    }

    pub fn base(mut self, base: u64) -> Self {
        self.base = base;
        self
    }

    pub fn region_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Pre-populate bytes at an absolute address inside the main region.
    pub fn seed(mut self, address: u64, bytes: &[u8]) -> Self {
        self.seeds.push((address, bytes.to_vec()));
        self
    }

    /// Mark `[address, address + len)` as inaccessible.
    pub fn deny(mut self, address: u64, len: u64) -> Self {
        self.denied.push((address, len));
        self
    }

    /// Substitute a pre-built layout cache.
    pub fn layout_cache(mut self, cache: LayoutCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> MockSpace {
        let mut region = vec![0u8; self.size];
        for (address, bytes) in &self.seeds {
            let start = (address - self.base) as usize;
            region[start..start + bytes.len()].copy_from_slice(bytes);
        }

        MockSpace {
            base: self.base,
            region: Mutex::new(region),
            denied: self.denied,
            allocations: Mutex::new(HashMap::new()),
            next_alloc: Mutex::new(ALLOC_AREA),
            cache: self.cache.unwrap_or_default(),
            attached: true,
        }
    }
}

impl Default for MockSpaceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::space::Address;

    #[test]
    fn denied_ranges_fail_like_inaccessible_memory() {
        let space = MockSpace::builder()
            .base(0x1000)
            .region_size(0x100)
            .deny(0x1040, 0x10)
            .build();

        let err = space.read_bytes(Address::Absolute(0x1044), 4).unwrap_err();
        assert!(err.is_memory_error());

        // A read that merely borders the denied range still succeeds.
        space.read_bytes(Address::Absolute(0x1050), 4).unwrap();
    }

    #[test]
    fn seeded_bytes_are_visible() {
        let space = MockSpace::builder()
            .base(0x1000)
            .region_size(0x100)
            .seed(0x1010, &[0xAA, 0xBB])
            .build();

        assert_eq!(
            space.read_bytes(Address::Absolute(0x1010), 2).unwrap(),
            vec![0xAA, 0xBB]
        );
    }

    #[test]
    fn reads_outside_every_segment_fail_without_truncation() {
        let space = MockSpace::with_base(0x1000, 0x100);

        // Crosses the end of the region: no short read, only an error.
        let err = space.read_bytes(Address::Absolute(0x10F0), 0x20).unwrap_err();
        assert!(err.is_memory_error());
    }

    #[test]
    fn freeing_an_unknown_address_is_an_error() {
        let space = MockSpace::with_base(0x1000, 0x100);
        assert!(space.free_raw(0xDEAD).is_err());
    }

    #[test]
    fn substituted_layout_cache_is_the_one_consulted() {
        let cache = LayoutCache::new();
        cache.layout_of::<i32>();

        let space = MockSpace::builder()
            .base(0x1000)
            .region_size(0x100)
            .layout_cache(cache)
            .build();

        assert_eq!(space.layout_cache().len(), 1);
        space.read::<u64>(Address::Absolute(0x1008)).unwrap();
        assert_eq!(space.layout_cache().len(), 2);
    }
}
