//! Out-of-process backend: memory access to a separate running process.
//!
//! Reads and writes cross the process boundary through OS-mediated copies.
//! A copy that moves fewer bytes than requested is treated as a failure even
//! when the call itself reports success — partial cross-process transfers
//! have no well-defined semantics. Writes relax the target's page protection
//! to read-write-execute around the copy and restore the original protection
//! unconditionally afterwards.

use std::ffi::c_void;
use std::time::Duration;

use windows::Win32::Foundation::{WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
    VirtualAllocEx, VirtualFreeEx, VirtualProtectEx,
};
use windows::Win32::System::Threading::{
    INFINITE, OpenThread, PROCESS_ACCESS_RIGHTS, ResumeThread, SuspendThread,
    THREAD_SUSPEND_RESUME, WaitForSingleObject,
};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::layout::LayoutCache;
use crate::memory::space::MemorySpace;
use crate::process::{
    DebugPrivilege, OwnedHandle, default_access_rights, first_thread_of, main_module_of,
    open_process,
};

/// Memory access bound to a separate, already-running process.
///
/// The binding (process id, handle, main-module base) is immutable after
/// construction. Detaching closes the handles and drops the debug privilege;
/// afterwards every operation is a precondition violation.
pub struct ExternalMemory {
    pid: u32,
    handle: OwnedHandle,
    main_thread: Option<OwnedHandle>,
    base: u64,
    main_module_size: usize,
    cache: LayoutCache,
    attached: bool,
    debug_privilege: DebugPrivilege,
}

impl ExternalMemory {
    /// Bind to `pid` with the engine's default access rights.
    pub fn open(pid: u32) -> Result<Self> {
        Self::open_with_access(pid, default_access_rights())
    }

    /// Bind to `pid` with caller-supplied access rights.
    pub fn open_with_access(pid: u32, access: PROCESS_ACCESS_RIGHTS) -> Result<Self> {
        let debug_privilege = DebugPrivilege::acquire();
        let handle = open_process(pid, access)?;
        let main_module = main_module_of(pid)?;

        // Best effort: a handle to the target's first thread, for callers
        // that want to pause the target around a burst of writes.
        let main_thread = first_thread_of(pid)
            .ok()
            .and_then(|tid| {
                // SAFETY: plain handle acquisition.
                unsafe { OpenThread(THREAD_SUSPEND_RESUME, false, tid) }.ok()
            })
            .map(OwnedHandle::new);

        info!(
            "attached to process {} ({}), main module at 0x{:X}",
            pid, main_module.name, main_module.base
        );

        Ok(ExternalMemory {
            pid,
            handle,
            main_thread,
            base: main_module.base,
            main_module_size: main_module.size,
            cache: LayoutCache::new(),
            attached: true,
            debug_privilege,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Size in bytes of the target's main module image.
    pub fn main_module_size(&self) -> usize {
        self.main_module_size
    }

    pub(crate) fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    /// Non-blocking liveness poll.
    pub fn is_alive(&self) -> bool {
        if !self.attached {
            return false;
        }
        // SAFETY: zero-timeout wait never blocks.
        unsafe { WaitForSingleObject(self.handle.raw(), 0) } == WAIT_TIMEOUT
    }

    /// Block until the target exits, or until `timeout` elapses.
    /// Returns whether the target has exited.
    pub fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<bool> {
        if !self.attached {
            return Err(Error::invalid_argument("memory space is detached"));
        }
        let millis = timeout
            .map(|t| t.as_millis().min(u128::from(INFINITE - 1)) as u32)
            .unwrap_or(INFINITE);

        // SAFETY: the process handle is live while attached.
        let wait = unsafe { WaitForSingleObject(self.handle.raw(), millis) };
        match wait {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            WAIT_FAILED => Err(Error::ProcessOpenFailed {
                pid: self.pid,
                message: format!("wait on process failed: {}", windows::core::Error::from_win32()),
            }),
            other => Err(Error::ProcessOpenFailed {
                pid: self.pid,
                message: format!("unexpected wait result: {:#x}", other.0),
            }),
        }
    }

    /// Suspend the target's main thread, if a handle to it could be opened.
    pub fn suspend_main_thread(&self) -> Result<()> {
        let thread = self.main_thread.as_ref().ok_or_else(|| {
            Error::invalid_argument("no main thread handle available for this target")
        })?;
        // SAFETY: the thread handle is live while attached.
        let previous = unsafe { SuspendThread(thread.raw()) };
        if previous == u32::MAX {
            return Err(Error::ProcessOpenFailed {
                pid: self.pid,
                message: "SuspendThread failed".to_owned(),
            });
        }
        Ok(())
    }

    /// Resume the target's main thread after [`suspend_main_thread`](Self::suspend_main_thread).
    pub fn resume_main_thread(&self) -> Result<()> {
        let thread = self.main_thread.as_ref().ok_or_else(|| {
            Error::invalid_argument("no main thread handle available for this target")
        })?;
        // SAFETY: the thread handle is live while attached.
        let previous = unsafe { ResumeThread(thread.raw()) };
        if previous == u32::MAX {
            return Err(Error::ProcessOpenFailed {
                pid: self.pid,
                message: "ResumeThread failed".to_owned(),
            });
        }
        Ok(())
    }
}

impl MemorySpace for ExternalMemory {
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
        if !self.attached {
            return;
        }
        self.attached = false;
        if let Some(mut thread) = self.main_thread.take() {
            thread.close();
        }
        self.handle.close();
        self.debug_privilege.release();
        debug!("detached from process {}", self.pid);
    }

    fn read_raw(&self, address: u64, count: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; count];
        let mut copied = 0usize;

        // SAFETY: the buffer spans `count` writable bytes; a stale address in
        // the target at worst fails the call.
        let result = unsafe {
            ReadProcessMemory(
                self.handle.raw(),
                address as *const c_void,
                buffer.as_mut_ptr() as *mut c_void,
                count,
                Some(&mut copied),
            )
        };

        match result {
            // A short copy is a failure even though the call succeeded.
            Ok(()) if copied == count => Ok(buffer),
            Ok(()) => {
                debug!(
                    "short read at 0x{:X}: {} of {} bytes",
                    address, copied, count
                );
                Err(Error::MemoryReadFailed { address, count })
            }
            Err(err) => {
                debug!("read of {} bytes at 0x{:X} failed: {}", count, address, err);
                Err(Error::MemoryReadFailed { address, count })
            }
        }
    }

    fn write_raw(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let count = bytes.len();
        let mut original = PAGE_PROTECTION_FLAGS::default();

        // SAFETY: protection is widened only for the range being written.
        unsafe {
            VirtualProtectEx(
                self.handle.raw(),
                address as *const c_void,
                count,
                PAGE_EXECUTE_READWRITE,
                &mut original,
            )
        }
        .map_err(|err| {
            debug!("protection change at 0x{:X} failed: {}", address, err);
            Error::MemoryWriteFailed { address, count }
        })?;

        let mut copied = 0usize;
        // SAFETY: the source slice spans `count` readable bytes.
        let result = unsafe {
            WriteProcessMemory(
                self.handle.raw(),
                address as *const c_void,
                bytes.as_ptr() as *const c_void,
                count,
                Some(&mut copied),
            )
        };

        // The original protection is restored unconditionally, even when the
        // copy itself failed, so the target is never left writable.
        let mut scratch = PAGE_PROTECTION_FLAGS::default();
        // SAFETY: same range as the widening call above.
        if let Err(err) = unsafe {
            VirtualProtectEx(
                self.handle.raw(),
                address as *const c_void,
                count,
                original,
                &mut scratch,
            )
        } {
            warn!("failed to restore page protection at 0x{:X}: {}", address, err);
        }

        match result {
            Ok(()) if copied == count => Ok(()),
            Ok(()) => {
                debug!(
                    "short write at 0x{:X}: {} of {} bytes",
                    address, copied, count
                );
                Err(Error::MemoryWriteFailed { address, count })
            }
            Err(err) => {
                debug!("write of {} bytes at 0x{:X} failed: {}", count, address, err);
                Err(Error::MemoryWriteFailed { address, count })
            }
        }
    }

    fn alloc_raw(&self, size: usize) -> Result<u64> {
        // SAFETY: the OS picks the placement; a null result signals failure.
        let chunk = unsafe {
            VirtualAllocEx(
                self.handle.raw(),
                None,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if chunk.is_null() {
            return Err(Error::AllocationFailed {
                size,
                message: windows::core::Error::from_win32().to_string(),
            });
        }
        debug!("allocated {} bytes in target at 0x{:X}", size, chunk as u64);
        Ok(chunk as u64)
    }

    fn free_raw(&self, address: u64) -> Result<()> {
        // SAFETY: `address` came from alloc_raw against the same handle.
        unsafe { VirtualFreeEx(self.handle.raw(), address as *mut c_void, 0, MEM_RELEASE) }
            .map_err(|err| Error::AllocationFailed {
                size: 0,
                message: format!("failed to release chunk at {address:#x}: {err}"),
            })
    }
}

impl Drop for ExternalMemory {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::space::Address;

    // The external backend can legitimately target the calling process: the
    // OS-mediated copies work on any process the caller may open, including
    // itself. That keeps these tests self-contained.

    #[test]
    fn attaches_to_own_process_with_nonzero_base() {
        let space = ExternalMemory::open(std::process::id()).unwrap();
        assert_eq!(space.pid(), std::process::id());
        assert_ne!(space.base_address(), 0);
        assert!(space.main_module_size() > 0);
        assert!(space.is_alive());
    }

    #[test]
    fn byte_round_trip_through_process_boundary() {
        let space = ExternalMemory::open(std::process::id()).unwrap();
        let mut buffer = [0u8; 16];
        let at = Address::Absolute(buffer.as_mut_ptr() as u64);

        space.write_bytes(at, &[0xCA, 0xFE, 0xBA, 0xBE]).unwrap();
        assert_eq!(
            space.read_bytes(at, 4).unwrap(),
            vec![0xCA, 0xFE, 0xBA, 0xBE]
        );
        assert_eq!(&buffer[..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
    }

    #[test]
    fn typed_round_trip_through_process_boundary() {
        let space = ExternalMemory::open(std::process::id()).unwrap();
        let mut slot = 0i64;
        let at = Address::Absolute(&mut slot as *mut i64 as u64);

        space.write(at, -40_000_000_000_i64).unwrap();
        assert_eq!(space.read::<i64>(at).unwrap(), -40_000_000_000);
    }

    #[test]
    fn inaccessible_address_fails_without_truncation() {
        let space = ExternalMemory::open(std::process::id()).unwrap();
        // Kernel-space address: never readable from user mode.
        let err = space
            .read_bytes(Address::Absolute(0xFFFF_8000_0000_0000), 16)
            .unwrap_err();
        assert!(err.is_memory_error());
    }

    #[test]
    fn allocation_round_trip_in_target() {
        let space = ExternalMemory::open(std::process::id()).unwrap();
        let mut chunk = space.allocate(128).unwrap();

        assert_ne!(chunk.address(), 0);
        chunk.write(0, 0xFEED_u16).unwrap();
        assert_eq!(chunk.read::<u16>(0).unwrap(), 0xFEED);

        chunk.free().unwrap();
        chunk.free().unwrap();
        assert!(!chunk.is_allocated());
    }

    #[test]
    fn wait_for_exit_times_out_while_alive() {
        let space = ExternalMemory::open(std::process::id()).unwrap();
        let exited = space
            .wait_for_exit(Some(Duration::from_millis(10)))
            .unwrap();
        assert!(!exited);
    }

    #[test]
    fn detach_is_idempotent_and_blocks_operations() {
        let mut space = ExternalMemory::open(std::process::id()).unwrap();
        space.detach();
        space.detach();

        assert!(!space.is_attached());
        assert!(!space.is_alive());
        let err = space
            .read_bytes(Address::Absolute(0x1000), 4)
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }
}
