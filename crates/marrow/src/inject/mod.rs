//! Module injection into a target address space.
//!
//! Out of process, the target is forced to load the module by a remote
//! thread running `LoadLibraryW`; in process, injection degrades to a direct
//! load with no thread round trip. Either way the loaded module is wrapped in
//! an [`InjectedModule`] and tracked by its canonical file path.

mod module;

use std::collections::HashMap;
use std::os::windows::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::memory::external::ExternalMemory;
use crate::memory::local::LocalMemory;
use crate::memory::space::MemorySpace;
use crate::process::{ModuleInfo, kernel32_export, load_local_library, modules_of, spawn_and_wait};

pub use module::InjectedModule;

/// A memory space code can be executed in.
///
/// Extends [`MemorySpace`] with the two capabilities the remote-execution
/// protocol needs: running a routine at an address with one pointer-sized
/// argument, and enumerating the target's loaded modules.
pub trait InjectionTarget: MemorySpace {
    /// Execute target code at `entry` with one pointer-sized argument,
    /// blocking until it returns. The wait is unbounded: a routine that never
    /// finishes hangs the caller.
    fn invoke(&self, entry: u64, argument: u64) -> Result<u32>;

    /// Snapshot of the modules currently loaded in the target.
    fn modules(&self) -> Result<Vec<ModuleInfo>>;

    /// Whether the target shares the calling process' address space.
    fn is_in_process(&self) -> bool;
}

impl InjectionTarget for ExternalMemory {
    fn invoke(&self, entry: u64, argument: u64) -> Result<u32> {
        if !self.is_attached() {
            return Err(Error::invalid_argument("memory space is detached"));
        }
        spawn_and_wait(self.handle(), entry, argument)
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>> {
        modules_of(self.pid())
    }

    fn is_in_process(&self) -> bool {
        false
    }
}

impl InjectionTarget for LocalMemory {
    fn invoke(&self, entry: u64, argument: u64) -> Result<u32> {
        if !self.is_attached() {
            return Err(Error::invalid_argument("memory space is detached"));
        }
        // SAFETY: `entry` must be the address of an extern "system" routine
        // taking one pointer argument; same contract as the remote variant.
        let routine: unsafe extern "system" fn(usize) -> u32 =
            unsafe { std::mem::transmute(entry as usize) };
        Ok(unsafe { routine(argument as usize) })
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>> {
        modules_of(std::process::id())
    }

    fn is_in_process(&self) -> bool {
        true
    }
}

/// Construction-time injector options.
#[derive(Debug, Clone, Copy, Default)]
pub struct InjectorOptions {
    /// Eject every still-tracked module when the injector is dropped.
    pub eject_on_dispose: bool,
}

/// Loads modules into one target and tracks what it has loaded.
///
/// The module map is keyed by canonical file path and is append-only except
/// for explicit ejection.
pub struct Injector<'a, S: InjectionTarget> {
    space: &'a S,
    options: InjectorOptions,
    modules: HashMap<PathBuf, InjectedModule<'a, S>>,
}

impl<'a, S: InjectionTarget> Injector<'a, S> {
    pub fn new(space: &'a S) -> Self {
        Self::with_options(space, InjectorOptions::default())
    }

    pub fn with_options(space: &'a S, options: InjectorOptions) -> Self {
        Injector {
            space,
            options,
            modules: HashMap::new(),
        }
    }

    /// The modules this injector has successfully injected, by path.
    pub fn injected_modules(&self) -> impl Iterator<Item = &InjectedModule<'a, S>> {
        self.modules.values()
    }

    /// Look up a tracked module by the path it was injected from.
    pub fn module(&self, path: impl AsRef<Path>) -> Option<&InjectedModule<'a, S>> {
        self.modules.get(&canonical_key(path.as_ref()))
    }

    /// Force the target to load the module at `path`.
    pub fn inject(&mut self, path: impl AsRef<Path>) -> Result<&InjectedModule<'a, S>> {
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path).map_err(|e| {
            Error::InjectionFailed(format!("module file not found: {}: {e}", path.display()))
        })?;

        if self.modules.contains_key(&canonical) {
            return Err(Error::InjectionFailed(format!(
                "module already injected: {}",
                canonical.display()
            )));
        }

        let base = if self.space.is_in_process() {
            // In process there is nothing to cross: load directly and wrap.
            load_local_library(&canonical)?
        } else {
            self.inject_remote(&canonical)?
        };

        info!("injected {} at 0x{:X}", canonical.display(), base);

        let module = InjectedModule::new(self.space, canonical.clone(), base);
        Ok(self.modules.entry(canonical).or_insert(module))
    }

    /// Unload a module previously injected by this injector instance.
    pub fn eject(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let key = canonical_key(path.as_ref());
        let module = self.modules.remove(&key).ok_or_else(|| {
            Error::InjectionFailed(format!(
                "module was not injected by this injector: {}",
                key.display()
            ))
        })?;

        module.free(self.space.is_in_process())?;
        info!("ejected {}", key.display());
        Ok(())
    }

    fn inject_remote(&self, path: &Path) -> Result<u64> {
        let loader = kernel32_export("LoadLibraryW")?;

        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        let payload: Vec<u8> = wide.iter().flat_map(|unit| unit.to_le_bytes()).collect();

        // The chunk is released when it drops, so the path buffer is cleaned
        // up whether or not any later step fails.
        let chunk = self.space.allocate(payload.len())?;
        chunk.write_bytes(0, &payload)?;

        debug!(
            "invoking remote loader for {} (path chunk at 0x{:X})",
            path.display(),
            chunk.address()
        );
        let exit_code = self.space.invoke(loader, chunk.address())?;
        if exit_code == 0 {
            return Err(Error::InjectionFailed(format!(
                "remote loader returned null for {}",
                path.display()
            )));
        }

        // The exit code is the loader's module handle truncated to 32 bits;
        // re-resolve the full base from the target's module list.
        let modules = self.space.modules()?;
        let loaded = modules
            .iter()
            .find(|m| (m.base & 0xFFFF_FFFF) as u32 == exit_code)
            .or_else(|| {
                let name = path.file_name();
                modules
                    .iter()
                    .find(|m| name.is_some_and(|n| m.path.file_name() == Some(n)))
            })
            .ok_or_else(|| {
                Error::InjectionFailed(format!(
                    "module not found in target after load: {}",
                    path.display()
                ))
            })?;

        Ok(loaded.base)
    }
}

impl<S: InjectionTarget> Drop for Injector<'_, S> {
    fn drop(&mut self) {
        if !self.options.eject_on_dispose {
            return;
        }
        // Teardown must not fail: per-module eject errors are logged and the
        // remaining modules are still attempted.
        let local = self.space.is_in_process();
        for (path, module) in self.modules.drain() {
            if let Err(err) = module.free(local) {
                warn!("failed to eject {} during teardown: {}", path.display(), err);
            }
        }
    }
}

fn canonical_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
