//! In-process backend: the target is the calling process itself.
//!
//! Reads and writes are direct pointer copies; no OS-mediated transfer and no
//! protection toggling is involved, since the caller already owns the address
//! space. Addresses handed to this backend must point at memory the calling
//! process actually owns — dereferencing foreign addresses is undefined
//! behavior here exactly as it is for any raw pointer.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};
use crate::layout::LayoutCache;
use crate::memory::space::MemorySpace;

const ALLOC_ALIGN: usize = 16;

/// Memory access bound to the calling process.
pub struct LocalMemory {
    base: u64,
    cache: LayoutCache,
    attached: bool,
    allocations: Mutex<HashMap<u64, std::alloc::Layout>>,
}

impl LocalMemory {
    /// Bind to the calling process, caching its main-module base address.
    pub fn attach() -> Result<Self> {
        let base = main_module_base()?;
        debug!("attached to own process, main module at 0x{:X}", base);
        Ok(LocalMemory {
            base,
            cache: LayoutCache::new(),
            attached: true,
            allocations: Mutex::new(HashMap::new()),
        })
    }
}

impl MemorySpace for LocalMemory {
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
        // SAFETY: the contract of this backend is that `address` names
        // `count` readable bytes inside the calling process.
        let bytes = unsafe { std::slice::from_raw_parts(address as *const u8, count) };
        Ok(bytes.to_vec())
    }

    fn write_raw(&self, address: u64, bytes: &[u8]) -> Result<()> {
        // SAFETY: same ownership contract as `read_raw`, for writable bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }
        Ok(())
    }

    fn alloc_raw(&self, size: usize) -> Result<u64> {
        let layout = std::alloc::Layout::from_size_align(size, ALLOC_ALIGN).map_err(|e| {
            Error::AllocationFailed {
                size,
                message: e.to_string(),
            }
        })?;

        // SAFETY: `layout` has non-zero size (checked by `allocate`).
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::AllocationFailed {
                size,
                message: "heap allocator returned null".to_owned(),
            });
        }

        self.allocations
            .lock()
            .expect("allocation table poisoned")
            .insert(ptr as u64, layout);
        Ok(ptr as u64)
    }

    fn free_raw(&self, address: u64) -> Result<()> {
        let layout = self
            .allocations
            .lock()
            .expect("allocation table poisoned")
            .remove(&address)
            .ok_or_else(|| {
                Error::invalid_argument(format!("no live allocation at {address:#x}"))
            })?;

        // SAFETY: the pointer and layout were produced by `alloc_raw` and the
        // table entry guarantees it has not been freed yet.
        unsafe { std::alloc::dealloc(address as *mut u8, layout) };
        Ok(())
    }
}

impl Drop for LocalMemory {
    fn drop(&mut self) {
        let mut allocations = match self.allocations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (address, layout) in allocations.drain() {
            // SAFETY: every entry is a live alloc_raw reservation.
            unsafe { std::alloc::dealloc(address as *mut u8, layout) };
        }
    }
}

#[cfg(target_os = "windows")]
fn main_module_base() -> Result<u64> {
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::core::PCWSTR;

    // SAFETY: a null module name returns the handle of the calling process'
    // main executable image.
    let module = unsafe { GetModuleHandleW(PCWSTR::null()) }.map_err(|e| {
        Error::ProcessOpenFailed {
            pid: std::process::id(),
            message: e.to_string(),
        }
    })?;
    Ok(module.0 as u64)
}

#[cfg(not(target_os = "windows"))]
fn main_module_base() -> Result<u64> {
    // No portable main-module handle; relative addressing degrades to
    // absolute (base zero) on non-Windows hosts.
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::space::{Address, DEFAULT_STRING_CAP};

    #[test]
    fn byte_round_trip_in_caller_owned_buffer() {
        let space = LocalMemory::attach().unwrap();
        let mut buffer = [0u8; 32];
        let at = Address::Absolute(buffer.as_mut_ptr() as u64);

        space.write_bytes(at, &[9, 8, 7, 6]).unwrap();
        assert_eq!(space.read_bytes(at, 4).unwrap(), vec![9, 8, 7, 6]);
        assert_eq!(&buffer[..4], &[9, 8, 7, 6]);
    }

    #[test]
    fn typed_round_trip_in_caller_owned_buffer() {
        let space = LocalMemory::attach().unwrap();
        let mut slot = 0u64;
        let at = Address::Absolute(&mut slot as *mut u64 as u64);

        space.write(at, 0x0123_4567_89AB_CDEF_u64).unwrap();
        assert_eq!(space.read::<u64>(at).unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(slot, 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn bool_round_trip_touches_exactly_one_byte() {
        let space = LocalMemory::attach().unwrap();
        let mut buffer = [0x55u8; 2];
        let at = Address::Absolute(buffer.as_mut_ptr() as u64);

        space.write(at, true).unwrap();
        assert!(space.read::<bool>(at).unwrap());
        // The neighboring byte is untouched.
        assert_eq!(buffer[1], 0x55);
    }

    #[test]
    fn heap_chunk_round_trip_and_release() {
        let space = LocalMemory::attach().unwrap();
        let mut chunk = space.allocate(64).unwrap();

        assert_ne!(chunk.address(), 0);
        assert_eq!(chunk.size(), 64);

        chunk.write(0, 31_337_i32).unwrap();
        assert_eq!(chunk.read::<i32>(0).unwrap(), 31_337);

        chunk
            .write_string(8, "test string", encoding_rs::UTF_8)
            .unwrap();
        assert_eq!(
            chunk.read_string(8, encoding_rs::UTF_8).unwrap(),
            "test string"
        );

        chunk.free().unwrap();
        chunk.free().unwrap();
        assert!(!chunk.is_allocated());
    }

    #[test]
    fn chain_read_through_caller_owned_pointers() {
        let space = LocalMemory::attach().unwrap();

        let mut value_holder = Box::new([0u8; 16]);
        let value_addr = value_holder.as_mut_ptr() as u64;
        space
            .write(Address::Absolute(value_addr + 4), 777_i32)
            .unwrap();

        let mut pointer_slot: usize = value_addr as usize;
        let start = Address::Absolute(&mut pointer_slot as *mut usize as u64);

        let value = space.read_chain::<i32>(start, &[4]).unwrap();
        assert_eq!(value, 777);
    }

    #[test]
    fn string_cap_round_trip_matches_written_text() {
        let space = LocalMemory::attach().unwrap();
        let chunk = space.allocate(DEFAULT_STRING_CAP).unwrap();

        chunk
            .write_string(0, "no nulls here", encoding_rs::WINDOWS_1252)
            .unwrap();
        assert_eq!(
            chunk.read_string(0, encoding_rs::WINDOWS_1252).unwrap(),
            "no nulls here"
        );
    }
}
