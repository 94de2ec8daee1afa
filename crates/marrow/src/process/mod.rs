//! Thin, owned wrappers over the Win32 process primitives the engine rests
//! on: handle lifetime, access rights, module and thread snapshots, remote
//! thread execution and the debug privilege. Everything above this module is
//! expressed in terms of these wrappers, never raw API calls.

mod handle;
mod library;
mod modules;
mod privilege;
mod thread;

pub use handle::OwnedHandle;
pub use modules::ModuleInfo;

pub(crate) use handle::{default_access_rights, open_process};
pub(crate) use library::{LocalLibrary, free_local_library, kernel32_export, load_local_library};
pub(crate) use modules::{first_thread_of, main_module_of, modules_of};
pub(crate) use privilege::DebugPrivilege;
pub(crate) use thread::spawn_and_wait;
