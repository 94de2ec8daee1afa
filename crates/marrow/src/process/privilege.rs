//! SeDebugPrivilege acquisition for the calling process.

use windows::Win32::Foundation::{HANDLE, LUID};
use windows::Win32::Security::{
    AdjustTokenPrivileges, LUID_AND_ATTRIBUTES, LookupPrivilegeValueW, SE_DEBUG_NAME,
    SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES,
    TOKEN_PRIVILEGES_ATTRIBUTES, TOKEN_QUERY,
};
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
use windows::core::PCWSTR;
use tracing::debug;

/// Best-effort elevation to SeDebugPrivilege while an external space is
/// attached; the privilege is dropped again at teardown.
#[derive(Debug)]
pub(crate) struct DebugPrivilege {
    enabled: bool,
}

impl DebugPrivilege {
    pub(crate) fn acquire() -> Self {
        match set_debug_privilege(true) {
            Ok(()) => DebugPrivilege { enabled: true },
            Err(err) => {
                // Not fatal: reading an unprotected target works without it.
                debug!("could not acquire SeDebugPrivilege: {err}");
                DebugPrivilege { enabled: false }
            }
        }
    }

    /// Drop the privilege now instead of at drop time. Idempotent.
    pub(crate) fn release(&mut self) {
        if !self.enabled {
            return;
        }
        self.enabled = false;
        if let Err(err) = set_debug_privilege(false) {
            debug!("could not release SeDebugPrivilege: {err}");
        }
    }
}

impl Drop for DebugPrivilege {
    fn drop(&mut self) {
        self.release();
    }
}

fn set_debug_privilege(enable: bool) -> windows::core::Result<()> {
    let mut token = HANDLE::default();
    // SAFETY: adjusting the calling process' own token.
    unsafe {
        OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
            &mut token,
        )?;
    }

    let mut luid = LUID::default();
    let result = (|| {
        // SAFETY: out-pointer is valid for the duration of the call.
        unsafe { LookupPrivilegeValueW(PCWSTR::null(), SE_DEBUG_NAME, &mut luid)? };

        let privileges = TOKEN_PRIVILEGES {
            PrivilegeCount: 1,
            Privileges: [LUID_AND_ATTRIBUTES {
                Luid: luid,
                Attributes: if enable {
                    SE_PRIVILEGE_ENABLED
                } else {
                    TOKEN_PRIVILEGES_ATTRIBUTES(0)
                },
            }],
        };

        // SAFETY: `privileges` outlives the call.
        unsafe { AdjustTokenPrivileges(token, false, Some(&privileges), 0, None, None) }
    })();

    // SAFETY: the token handle was opened above and is closed exactly once.
    unsafe {
        let _ = windows::Win32::Foundation::CloseHandle(token);
    }

    result
}
