//! Owned process and thread handles.

use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_ACCESS_RIGHTS, PROCESS_CREATE_THREAD, PROCESS_QUERY_INFORMATION,
    PROCESS_SET_INFORMATION, PROCESS_SYNCHRONIZE, PROCESS_VM_OPERATION, PROCESS_VM_READ,
    PROCESS_VM_WRITE,
};
use tracing::warn;

use crate::error::{Error, Result};

/// An OS handle that is closed exactly once.
///
/// The handle is an exclusive capability: it is never cloned, and reusing it
/// after [`close`](Self::close) is prevented by the validity check.
#[derive(Debug)]
pub struct OwnedHandle(HANDLE);

impl OwnedHandle {
    pub(crate) fn new(handle: HANDLE) -> Self {
        OwnedHandle(handle)
    }

    pub(crate) fn raw(&self) -> HANDLE {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_invalid()
    }

    /// Close the handle now instead of at drop time. Idempotent.
    pub(crate) fn close(&mut self) {
        if self.0.is_invalid() {
            return;
        }
        // SAFETY: the handle is live and owned exclusively by this wrapper.
        if let Err(err) = unsafe { CloseHandle(self.0) } {
            warn!("CloseHandle failed: {err}");
        }
        self.0 = HANDLE::default();
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// The access the engine requests by default: memory read/write/operation,
/// thread creation, query, set-information, plus synchronize for the
/// liveness poll/wait contract.
pub(crate) fn default_access_rights() -> PROCESS_ACCESS_RIGHTS {
    PROCESS_CREATE_THREAD
        | PROCESS_QUERY_INFORMATION
        | PROCESS_VM_READ
        | PROCESS_VM_WRITE
        | PROCESS_VM_OPERATION
        | PROCESS_SET_INFORMATION
        | PROCESS_SYNCHRONIZE
}

pub(crate) fn open_process(pid: u32, access: PROCESS_ACCESS_RIGHTS) -> Result<OwnedHandle> {
    // SAFETY: plain handle acquisition; ownership moves into OwnedHandle.
    let handle = unsafe { OpenProcess(access, false, pid) }.map_err(|e| {
        Error::ProcessOpenFailed {
            pid,
            message: e.to_string(),
        }
    })?;
    Ok(OwnedHandle::new(handle))
}
