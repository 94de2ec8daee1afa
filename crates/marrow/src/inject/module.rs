//! A module that was forcibly loaded into a target.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::inject::InjectionTarget;
use crate::layout::MemValue;
use crate::process::{LocalLibrary, free_local_library, kernel32_export};

/// One successfully injected module inside a target.
pub struct InjectedModule<'a, S: InjectionTarget> {
    space: &'a S,
    path: PathBuf,
    base: u64,
}

impl<'a, S: InjectionTarget> InjectedModule<'a, S> {
    pub(crate) fn new(space: &'a S, path: PathBuf, base: u64) -> Self {
        InjectedModule { space, path, base }
    }

    /// Canonical path of the injected image on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base address of the module inside the target.
    pub fn base_address(&self) -> u64 {
        self.base
    }

    /// Resolve the address of a named export inside the target.
    ///
    /// The module's file is mapped a second time into the calling process
    /// without resolving its references — no target code runs — purely to
    /// compute the export's offset from the image base. That offset plus the
    /// target-side base is the target-valid address.
    pub fn export_address(&self, name: &str) -> Result<u64> {
        let local = LocalLibrary::load_for_export_lookup(&self.path)?;
        let offset = local.export(name)?.wrapping_sub(local.base());
        Ok(self.base.wrapping_add(offset))
    }

    /// Call a named export in the target with no argument.
    ///
    /// Blocks until the export returns; the wait is unbounded. Returns the
    /// thread exit code (the export's return value truncated to 32 bits).
    pub fn call(&self, export: &str) -> Result<u32> {
        let entry = self.export_address(export)?;
        debug!("calling export '{}' at 0x{:X}", export, entry);
        self.space.invoke(entry, 0)
    }

    /// Call a named export with a single scalar or struct argument.
    ///
    /// The value is written into a freshly allocated chunk in the target and
    /// the export receives that chunk's address. Multi-argument calling
    /// conventions are not supported. The chunk is released when the call
    /// completes, whether it succeeded or not.
    pub fn call_with<P: MemValue>(&self, export: &str, parameter: P) -> Result<u32> {
        let entry = self.export_address(export)?;

        let mut payload = Vec::new();
        parameter.encode(&mut payload);

        let chunk = self.space.allocate(payload.len())?;
        chunk.write_bytes(0, &payload)?;

        debug!(
            "calling export '{}' at 0x{:X} (argument chunk at 0x{:X})",
            export,
            entry,
            chunk.address()
        );
        self.space.invoke(entry, chunk.address())
    }

    /// Unload the module from the target.
    ///
    /// With `local` set the image is freed directly in the calling process
    /// (only meaningful for an in-process target); otherwise a second remote
    /// thread round trip invokes the target's unload entry point with the
    /// module base as its argument.
    pub fn free(&self, local: bool) -> Result<()> {
        if local {
            return free_local_library(self.base);
        }

        let unloader = kernel32_export("FreeLibrary")?;
        let exit_code = self.space.invoke(unloader, self.base)?;
        if exit_code == 0 {
            return Err(Error::InjectionFailed(format!(
                "remote FreeLibrary reported failure for {}",
                self.path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::local::LocalMemory;

    #[test]
    fn export_lookup_on_a_missing_image_fails() {
        let space = LocalMemory::attach().unwrap();
        let module = InjectedModule::new(
            &space,
            PathBuf::from(r"C:\missing\image.dll"),
            0x7FF8_0000_0000,
        );

        let err = module.export_address("AnyExport").unwrap_err();
        assert!(matches!(err, Error::InjectionFailed(_)));
    }

    #[test]
    fn export_offsets_are_rebased_onto_the_target() {
        // kernel32 is always loadable; its local base and the pretended
        // target base differ, so the rebasing arithmetic is observable.
        let space = LocalMemory::attach().unwrap();
        let kernel32 = std::path::PathBuf::from(r"C:\Windows\System32\kernel32.dll");
        let pretend_base = 0x1000_0000u64;
        let module = InjectedModule::new(&space, kernel32, pretend_base);

        let rebased = module.export_address("GetCurrentProcessId").unwrap();

        let local = LocalLibrary::load_for_export_lookup(module.path()).unwrap();
        let offset = local.export("GetCurrentProcessId").unwrap() - local.base();

        assert_eq!(rebased, pretend_base + offset);
    }
}
