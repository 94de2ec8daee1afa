//! RAII wrapper for a span of memory reserved inside a target.

use encoding_rs::Encoding;
use tracing::warn;

use crate::error::{Error, Result};
use crate::layout::MemValue;
use crate::memory::space::{Address, MemorySpace};

/// A chunk of target memory owned by the space that allocated it.
///
/// The chunk exposes the same typed/byte/string surface as its owning space,
/// with every address given as an offset from the chunk's own base: offset 0
/// is always the chunk's first byte, and the absolute/relative distinction of
/// the backend never shows through. The reservation is released on drop;
/// releasing twice is a no-op.
#[derive(Debug)]
pub struct AllocatedChunk<'a, S: MemorySpace> {
    space: &'a S,
    address: u64,
    size: usize,
    allocated: bool,
}

impl<'a, S: MemorySpace> AllocatedChunk<'a, S> {
    pub(crate) fn new(space: &'a S, address: u64, size: usize) -> Self {
        AllocatedChunk {
            space,
            address,
            size,
            allocated: true,
        }
    }

    /// Absolute address of the chunk's first byte in the target.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Reserved size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// False once the chunk has been released.
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Bounds-check `[offset, offset+len)` against the chunk and return the
    /// absolute target address of `offset`.
    fn slot(&self, offset: u64, len: usize) -> Result<Address> {
        if !self.allocated {
            return Err(Error::invalid_argument("chunk has been released"));
        }
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size as u64 => {
                Ok(Address::Absolute(self.address.wrapping_add(offset)))
            }
            _ => Err(Error::invalid_argument(format!(
                "range {offset:#x}+{len:#x} exceeds chunk size {:#x}",
                self.size
            ))),
        }
    }

    pub fn read_bytes(&self, offset: u64, count: usize) -> Result<Vec<u8>> {
        let at = self.slot(offset, count)?;
        self.space.read_bytes(at, count)
    }

    pub fn write_bytes(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let at = self.slot(offset, bytes.len())?;
        self.space.write_bytes(at, bytes)
    }

    pub fn read<T: MemValue>(&self, offset: u64) -> Result<T> {
        let size = self.space.layout_cache().layout_of::<T>().size;
        let at = self.slot(offset, size)?;
        self.space.read(at)
    }

    pub fn write<T: MemValue>(&self, offset: u64, value: T) -> Result<()> {
        let size = self.space.layout_cache().layout_of::<T>().size;
        let at = self.slot(offset, size)?;
        self.space.write(at, value)
    }

    /// Read a string from the chunk, capped at the chunk's remaining bytes.
    pub fn read_string(&self, offset: u64, encoding: &'static Encoding) -> Result<String> {
        if !self.allocated {
            return Err(Error::invalid_argument("chunk has been released"));
        }
        let remaining = (self.size as u64).saturating_sub(offset) as usize;
        let at = self.slot(offset, remaining)?;
        self.space.read_string(at, encoding, remaining)
    }

    pub fn write_string(
        &self,
        offset: u64,
        value: &str,
        encoding: &'static Encoding,
    ) -> Result<()> {
        let mut terminated = value.to_owned();
        if !terminated.ends_with('\0') {
            terminated.push('\0');
        }
        let (encoded, _, _) = encoding.encode(&terminated);
        self.write_bytes(offset, &encoded)
    }

    /// Release the reservation. The transition is one-directional: a second
    /// call is a no-op and reports success.
    pub fn free(&mut self) -> Result<()> {
        if !self.allocated {
            return Ok(());
        }
        self.allocated = false;
        self.space.free_raw(self.address)
    }
}

impl<S: MemorySpace> Drop for AllocatedChunk<'_, S> {
    fn drop(&mut self) {
        if let Err(err) = self.free() {
            warn!("failed to release chunk at 0x{:X}: {}", self.address, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::mock::MockSpace;

    const BASE: u64 = 0x0040_0000;

    #[test]
    fn allocation_yields_nonzero_address_and_exact_size() {
        let space = MockSpace::with_base(BASE, 0x1000);
        let chunk = space.allocate(64).unwrap();

        assert_ne!(chunk.address(), 0);
        assert_eq!(chunk.size(), 64);
        assert!(chunk.is_allocated());
    }

    #[test]
    fn zero_sized_allocation_is_rejected() {
        let space = MockSpace::with_base(BASE, 0x1000);
        assert!(space.allocate(0).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn chunk_round_trips_offset_addressed_data() {
        let space = MockSpace::with_base(BASE, 0x1000);
        let chunk = space.allocate(64).unwrap();

        chunk.write_bytes(0, &[1, 2, 3]).unwrap();
        assert_eq!(chunk.read_bytes(0, 3).unwrap(), vec![1, 2, 3]);

        chunk.write(8, 0x5566_7788_u32).unwrap();
        assert_eq!(chunk.read::<u32>(8).unwrap(), 0x5566_7788);

        chunk
            .write_string(16, "payload", encoding_rs::UTF_8)
            .unwrap();
        assert_eq!(
            chunk.read_string(16, encoding_rs::UTF_8).unwrap(),
            "payload"
        );
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let space = MockSpace::with_base(BASE, 0x1000);
        let chunk = space.allocate(16).unwrap();

        assert!(chunk.read_bytes(8, 16).unwrap_err().is_invalid_argument());
        assert!(chunk.write(15, 0_u32).unwrap_err().is_invalid_argument());
        // The last byte is still addressable.
        chunk.write(15, 0xAA_u8).unwrap();
    }

    #[test]
    fn free_flips_state_once_and_is_idempotent() {
        let space = MockSpace::with_base(BASE, 0x1000);
        let mut chunk = space.allocate(32).unwrap();

        chunk.free().unwrap();
        assert!(!chunk.is_allocated());
        chunk.free().unwrap(); // no-op, not an error

        assert!(chunk.read_bytes(0, 4).unwrap_err().is_invalid_argument());
        assert!(
            chunk
                .write_bytes(0, &[1])
                .unwrap_err()
                .is_invalid_argument()
        );
    }

    #[test]
    fn drop_releases_the_reservation() {
        let space = MockSpace::with_base(BASE, 0x1000);
        let before = space.live_allocations();
        {
            let _chunk = space.allocate(32).unwrap();
            assert_eq!(space.live_allocations(), before + 1);
        }
        assert_eq!(space.live_allocations(), before);
    }
}
