//! Local module loading and export lookup.

use std::path::Path;

use windows::Win32::Foundation::{HANDLE, HMODULE};
use windows::Win32::System::LibraryLoader::{
    DONT_RESOLVE_DLL_REFERENCES, FreeLibrary, GetModuleHandleW, GetProcAddress, LoadLibraryExW,
    LoadLibraryW,
};
use windows::core::{HSTRING, PCSTR, w};
use tracing::warn;

use crate::error::{Error, Result};

/// A module mapped into the calling process, unloaded on drop.
///
/// Loaded with `DONT_RESOLVE_DLL_REFERENCES`: the image is mapped purely to
/// compute export offsets, so none of its code ever runs on the calling
/// thread.
pub(crate) struct LocalLibrary(HMODULE);

impl LocalLibrary {
    pub(crate) fn load_for_export_lookup(path: &Path) -> Result<Self> {
        let name = HSTRING::from(path.as_os_str());
        // SAFETY: plain library mapping; ownership moves into LocalLibrary.
        let module = unsafe { LoadLibraryExW(&name, HANDLE::default(), DONT_RESOLVE_DLL_REFERENCES) }
            .map_err(|e| {
                Error::InjectionFailed(format!(
                    "could not map {} locally for export lookup: {e}",
                    path.display()
                ))
            })?;
        Ok(LocalLibrary(module))
    }

    pub(crate) fn base(&self) -> u64 {
        self.0.0 as u64
    }

    /// Absolute address of a named export within this local mapping.
    pub(crate) fn export(&self, name: &str) -> Result<u64> {
        let ansi = std::ffi::CString::new(name)
            .map_err(|_| Error::invalid_argument("export name contains a null byte"))?;
        // SAFETY: `ansi` outlives the call.
        let address = unsafe { GetProcAddress(self.0, PCSTR::from_raw(ansi.as_ptr().cast())) };
        match address {
            Some(function) => Ok(function as usize as u64),
            None => Err(Error::InjectionFailed(format!(
                "export '{name}' not found in module"
            ))),
        }
    }
}

impl Drop for LocalLibrary {
    fn drop(&mut self) {
        // SAFETY: the mapping is live and owned exclusively by this wrapper.
        if let Err(err) = unsafe { FreeLibrary(self.0) } {
            warn!("FreeLibrary failed for local export mapping: {err}");
        }
    }
}

/// Fully load a module into the calling process and keep it loaded,
/// returning its base address.
pub(crate) fn load_local_library(path: &Path) -> Result<u64> {
    let name = HSTRING::from(path.as_os_str());
    // SAFETY: plain library load; the mapping intentionally stays alive.
    let module = unsafe { LoadLibraryW(&name) }.map_err(|e| {
        Error::InjectionFailed(format!("LoadLibrary failed for {}: {e}", path.display()))
    })?;
    Ok(module.0 as u64)
}

/// Unload a module previously loaded into the calling process.
pub(crate) fn free_local_library(base: u64) -> Result<()> {
    // SAFETY: `base` is a module handle obtained from a load in this process.
    unsafe { FreeLibrary(HMODULE(base as *mut _)) }
        .map_err(|e| Error::InjectionFailed(format!("FreeLibrary failed: {e}")))
}

/// Address of a kernel32 export.
///
/// kernel32 is mapped at one base address system-wide, so an address resolved
/// in the calling process is equally valid inside any target.
pub(crate) fn kernel32_export(name: &str) -> Result<u64> {
    // SAFETY: kernel32 is always loaded in the calling process.
    let kernel32 = unsafe { GetModuleHandleW(w!("kernel32.dll")) }
        .map_err(|e| Error::InjectionFailed(format!("kernel32 not available: {e}")))?;

    let ansi = std::ffi::CString::new(name)
        .map_err(|_| Error::invalid_argument("export name contains a null byte"))?;
    // SAFETY: `ansi` outlives the call.
    let address = unsafe { GetProcAddress(kernel32, PCSTR::from_raw(ansi.as_ptr().cast())) };
    match address {
        Some(function) => Ok(function as usize as u64),
        None => Err(Error::InjectionFailed(format!(
            "kernel32 export '{name}' not found"
        ))),
    }
}
