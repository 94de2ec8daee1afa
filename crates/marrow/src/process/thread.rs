//! Remote thread execution: create, wait, collect the exit code.

use std::ffi::c_void;

use windows::Win32::Foundation::WAIT_OBJECT_0;
use windows::Win32::System::Threading::{CreateRemoteThread, GetExitCodeThread, INFINITE,
    WaitForSingleObject};
use tracing::debug;

use crate::error::{Error, Result};
use crate::process::handle::OwnedHandle;

/// Run code at `entry` inside the target with one pointer-sized argument.
///
/// Blocks the calling thread until the remote thread finishes — the wait is
/// unbounded by contract, so a target that never returns hangs the caller.
/// Returns the remote thread's exit code.
pub(crate) fn spawn_and_wait(process: &OwnedHandle, entry: u64, argument: u64) -> Result<u32> {
    if !process.is_valid() {
        return Err(Error::InjectionFailed(
            "process handle is no longer valid".to_owned(),
        ));
    }

    // SAFETY: `entry` must be the address of an extern "system" routine taking
    // one pointer argument inside the target; that is the caller's contract.
    let routine: unsafe extern "system" fn(*mut c_void) -> u32 =
        unsafe { std::mem::transmute(entry as usize) };

    // SAFETY: handle is valid; the argument is passed by value to the target.
    let thread = unsafe {
        CreateRemoteThread(
            process.raw(),
            None,
            0,
            Some(routine),
            Some(argument as *const c_void),
            0,
            None,
        )
    }
    .map_err(|e| Error::InjectionFailed(format!("CreateRemoteThread failed: {e}")))?;
    let thread = OwnedHandle::new(thread);

    debug!("remote thread started at 0x{:X} (arg 0x{:X})", entry, argument);

    // SAFETY: the thread handle is live until this wrapper drops.
    let wait = unsafe { WaitForSingleObject(thread.raw(), INFINITE) };
    if wait != WAIT_OBJECT_0 {
        return Err(Error::InjectionFailed(format!(
            "unexpected wait result for remote thread: {:#x}",
            wait.0
        )));
    }

    let mut exit_code = 0u32;
    // SAFETY: out-pointer is valid for the duration of the call.
    unsafe { GetExitCodeThread(thread.raw(), &mut exit_code) }
        .map_err(|e| Error::InjectionFailed(format!("GetExitCodeThread failed: {e}")))?;

    debug!("remote thread finished with exit code {}", exit_code);
    Ok(exit_code)
}
