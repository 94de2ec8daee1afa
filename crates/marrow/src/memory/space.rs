//! The address-space contract shared by all backends.
//!
//! A backend supplies four primitives (raw read, raw write, raw alloc, raw
//! free) plus its cached main-module base; every derived operation — typed
//! values, arrays, pointer chains, strings, address translation, allocation —
//! is implemented once here in terms of those primitives.

use encoding_rs::Encoding;

use crate::error::{Error, Result};
use crate::layout::{LayoutCache, MemValue};
use crate::memory::chunk::AllocatedChunk;

/// Default byte cap for [`MemorySpace::read_string`].
pub const DEFAULT_STRING_CAP: usize = 512;

/// An address into a target's memory, tagged with its flavor.
///
/// The two flavors are never silently conflated: a `Relative` address is an
/// offset from the target's main-module base and is translated to absolute
/// before any backend primitive runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    /// Usable as-is in the target address space.
    Absolute(u64),
    /// Offset from the target's main-module base address.
    Relative(u64),
}

impl Address {
    pub fn raw(self) -> u64 {
        match self {
            Address::Absolute(value) | Address::Relative(value) => value,
        }
    }
}

/// Read, write and allocation access to one target address space.
///
/// The binding to the target is immutable for the instance's lifetime. A
/// space is *active* from construction until [`detach`](Self::detach); every
/// operation on a detached space is a precondition violation, and re-detaching
/// is a no-op. Operations from a single calling thread are strictly ordered;
/// concurrent callers must serialize externally.
pub trait MemorySpace {
    /// Base address of the target's main module.
    fn base_address(&self) -> u64;

    /// The layout cache consulted by every typed operation.
    fn layout_cache(&self) -> &LayoutCache;

    /// False once the space has been detached.
    fn is_attached(&self) -> bool;

    /// Release the backing OS resources. Idempotent; never fails.
    fn detach(&mut self);

    /// Copy exactly `count` bytes out of the target at an absolute address.
    ///
    /// A short copy is a failure even if the underlying call reports success;
    /// partial reads are never surfaced as data.
    fn read_raw(&self, address: u64, count: usize) -> Result<Vec<u8>>;

    /// Copy `bytes` into the target at an absolute address, completely or not
    /// at all.
    fn write_raw(&self, address: u64, bytes: &[u8]) -> Result<()>;

    /// Reserve `size` bytes of committed, read-write-execute memory in the
    /// target, returning its absolute address.
    fn alloc_raw(&self, size: usize) -> Result<u64>;

    /// Release a reservation previously produced by
    /// [`alloc_raw`](Self::alloc_raw).
    fn free_raw(&self, address: u64) -> Result<()>;

    /// Translate a relative address to absolute. Zero is allowed: relative
    /// zero plus base is the base itself.
    fn to_absolute(&self, relative: u64) -> u64 {
        self.base_address().wrapping_add(relative)
    }

    /// Translate an absolute address to relative. Zero input is a caller bug.
    fn to_relative(&self, absolute: u64) -> Result<u64> {
        if absolute == 0 {
            return Err(Error::invalid_argument(
                "cannot make a relative address from zero",
            ));
        }
        Ok(absolute.wrapping_sub(self.base_address()))
    }

    /// Resolve an [`Address`] to a non-zero absolute address, verifying the
    /// space is still attached.
    fn resolve(&self, address: Address) -> Result<u64> {
        if !self.is_attached() {
            return Err(Error::invalid_argument("memory space is detached"));
        }
        match address {
            Address::Absolute(0) => Err(Error::invalid_argument("address must not be zero")),
            Address::Absolute(absolute) => Ok(absolute),
            Address::Relative(relative) => Ok(self.to_absolute(relative)),
        }
    }

    /// Read exactly `count` bytes at `address`.
    fn read_bytes(&self, address: Address, count: usize) -> Result<Vec<u8>> {
        if count == 0 {
            return Err(Error::invalid_argument("read count must not be zero"));
        }
        let absolute = self.resolve(address)?;
        self.read_raw(absolute, count)
    }

    /// Write all of `bytes` at `address`.
    fn write_bytes(&self, address: Address, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(Error::invalid_argument("write payload must not be empty"));
        }
        let absolute = self.resolve(address)?;
        self.write_raw(absolute, bytes)
    }

    /// Read one `T` at `address`.
    fn read<T: MemValue>(&self, address: Address) -> Result<T> {
        let layout = self.layout_cache().layout_of::<T>();
        let bytes = self.read_bytes(address, layout.size)?;
        T::decode(&bytes)
    }

    /// Read `count` values of `T` laid out sequentially at `address`.
    /// The first failing element aborts the whole call.
    fn read_array<T: MemValue>(&self, address: Address, count: usize) -> Result<Vec<T>> {
        if count == 0 {
            return Err(Error::invalid_argument("element count must not be zero"));
        }
        let size = self.layout_cache().layout_of::<T>().size as u64;
        let base = self.resolve(address)?;

        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            let element = Address::Absolute(base.wrapping_add(i as u64 * size));
            values.push(self.read::<T>(element)?);
        }
        Ok(values)
    }

    /// Write one `T` at `address`.
    fn write<T: MemValue>(&self, address: Address, value: T) -> Result<()> {
        let layout = self.layout_cache().layout_of::<T>();
        let mut buf = Vec::with_capacity(layout.size);
        value.encode(&mut buf);
        self.write_bytes(address, &buf)
    }

    /// Follow a pointer chain and read a `T` at its end.
    ///
    /// With empty `offsets` this is a plain [`read`](Self::read) at `start`.
    /// Otherwise a pointer is read at `start`, dereferenced through every
    /// offset but the last, and the value is read at the final pointer plus
    /// the last offset. The `Relative` flavor applies to `start` only;
    /// computed hops are absolute by construction. The first failing hop
    /// surfaces as a read error.
    fn read_chain<T: MemValue>(&self, start: Address, offsets: &[u64]) -> Result<T> {
        let Some((&last, hops)) = offsets.split_last() else {
            return self.read(start);
        };

        let mut pointer = self.read::<usize>(start)? as u64;
        for &offset in hops {
            pointer = read_chain_pointer(self, pointer.wrapping_add(offset))?;
        }

        let end = pointer.wrapping_add(last);
        if end == 0 {
            return Err(chain_null_hop::<T>());
        }
        self.read(Address::Absolute(end))
    }

    /// Follow a pointer chain and write `value` at its end.
    /// Same traversal as [`read_chain`](Self::read_chain).
    fn write_chain<T: MemValue>(&self, start: Address, offsets: &[u64], value: T) -> Result<()> {
        let Some((&last, hops)) = offsets.split_last() else {
            return self.write(start, value);
        };

        let mut pointer = self.read::<usize>(start)? as u64;
        for &offset in hops {
            pointer = read_chain_pointer(self, pointer.wrapping_add(offset))?;
        }

        let end = pointer.wrapping_add(last);
        if end == 0 {
            return Err(chain_null_hop::<T>());
        }
        self.write(Address::Absolute(end), value)
    }

    /// Read a string of at most `max_len` bytes at `address`, decoded with
    /// `encoding` and truncated at the first null character. A string that
    /// fills the cap without a terminator is returned whole; that is not an
    /// error.
    fn read_string(
        &self,
        address: Address,
        encoding: &'static Encoding,
        max_len: usize,
    ) -> Result<String> {
        if max_len == 0 {
            return Err(Error::invalid_argument("string cap must not be zero"));
        }
        let bytes = self.read_bytes(address, max_len)?;
        let (decoded, _, _) = encoding.decode(&bytes);
        let mut text = decoded.into_owned();
        if let Some(nul) = text.find('\0') {
            text.truncate(nul);
        }
        Ok(text)
    }

    /// Write `value` at `address` with `encoding`, appending a null
    /// terminator if the string does not already carry one.
    fn write_string(
        &self,
        address: Address,
        value: &str,
        encoding: &'static Encoding,
    ) -> Result<()> {
        let mut terminated = value.to_owned();
        if !terminated.ends_with('\0') {
            terminated.push('\0');
        }
        let (encoded, _, _) = encoding.encode(&terminated);
        self.write_bytes(address, &encoded)
    }

    /// Reserve a chunk of `size` bytes in the target, owned by this space.
    fn allocate(&self, size: usize) -> Result<AllocatedChunk<'_, Self>>
    where
        Self: Sized,
    {
        if size == 0 {
            return Err(Error::invalid_argument("allocation size must not be zero"));
        }
        if !self.is_attached() {
            return Err(Error::invalid_argument("memory space is detached"));
        }
        let address = self.alloc_raw(size)?;
        Ok(AllocatedChunk::new(self, address, size))
    }
}

fn read_chain_pointer<S: MemorySpace + ?Sized>(space: &S, address: u64) -> Result<u64> {
    if address == 0 {
        return Err(Error::MemoryReadFailed {
            address: 0,
            count: std::mem::size_of::<usize>(),
        });
    }
    Ok(space.read::<usize>(Address::Absolute(address))? as u64)
}

fn chain_null_hop<T: MemValue>() -> Error {
    Error::MemoryReadFailed {
        address: 0,
        count: T::layout().size,
    }
}
