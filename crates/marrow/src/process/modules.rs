//! Module and thread snapshots of a target process.

use std::path::PathBuf;

use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, MODULEENTRY32W, Module32FirstW, Module32NextW, THREADENTRY32,
    TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32, TH32CS_SNAPTHREAD, Thread32First, Thread32Next,
};

use crate::error::{Error, Result};
use crate::process::handle::OwnedHandle;

/// One module loaded in a target process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Module file name, e.g. `payload.dll`.
    pub name: String,
    /// Full path of the backing image on disk.
    pub path: PathBuf,
    /// Base address of the mapped image in the target.
    pub base: u64,
    /// Size of the mapped image in bytes.
    pub size: usize,
}

fn utf16_until_nul(buffer: &[u16]) -> String {
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..len])
}

/// Enumerate the modules currently loaded in `pid`, main module first.
pub(crate) fn modules_of(pid: u32) -> Result<Vec<ModuleInfo>> {
    // SAFETY: snapshot handle ownership moves into OwnedHandle.
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid) }
        .map_err(|e| Error::ProcessOpenFailed {
            pid,
            message: format!("module snapshot failed: {e}"),
        })?;
    let snapshot = OwnedHandle::new(snapshot);

    let mut entry = MODULEENTRY32W {
        dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
        ..Default::default()
    };

    let mut modules = Vec::new();
    // SAFETY: `entry` is a properly sized MODULEENTRY32W for every call.
    unsafe {
        if Module32FirstW(snapshot.raw(), &mut entry).is_err() {
            return Err(Error::ProcessOpenFailed {
                pid,
                message: "no modules visible in target".to_owned(),
            });
        }
        loop {
            modules.push(ModuleInfo {
                name: utf16_until_nul(&entry.szModule),
                path: PathBuf::from(utf16_until_nul(&entry.szExePath)),
                base: entry.modBaseAddr as u64,
                size: entry.modBaseSize as usize,
            });
            if Module32NextW(snapshot.raw(), &mut entry).is_err() {
                break;
            }
        }
    }

    Ok(modules)
}

/// The target's main module (the first entry of the module snapshot).
pub(crate) fn main_module_of(pid: u32) -> Result<ModuleInfo> {
    modules_of(pid)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::ProcessOpenFailed {
            pid,
            message: "target has no main module".to_owned(),
        })
}

/// Thread id of the target's first (main) thread.
pub(crate) fn first_thread_of(pid: u32) -> Result<u32> {
    // SAFETY: snapshot handle ownership moves into OwnedHandle.
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) }.map_err(|e| {
        Error::ProcessOpenFailed {
            pid,
            message: format!("thread snapshot failed: {e}"),
        }
    })?;
    let snapshot = OwnedHandle::new(snapshot);

    let mut entry = THREADENTRY32 {
        dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
        ..Default::default()
    };

    // SAFETY: `entry` is a properly sized THREADENTRY32 for every call.
    unsafe {
        if Thread32First(snapshot.raw(), &mut entry).is_ok() {
            loop {
                if entry.th32OwnerProcessID == pid {
                    return Ok(entry.th32ThreadID);
                }
                if Thread32Next(snapshot.raw(), &mut entry).is_err() {
                    break;
                }
            }
        }
    }

    Err(Error::ProcessOpenFailed {
        pid,
        message: "target has no visible threads".to_owned(),
    })
}
