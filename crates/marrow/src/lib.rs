//! # marrow
//!
//! Controlled read/write access to the address space of a process — the
//! calling process itself or a separate running one — plus module injection
//! and byte-signature scanning. Infrastructure for introspection and
//! instrumentation tools: lightweight debuggers, automation bots, binary
//! patchers.
//!
//! The engine is built around one contract, [`MemorySpace`], with two
//! backends:
//!
//! - [`LocalMemory`] — the target is the calling process; reads and writes
//!   are direct pointer copies.
//! - [`ExternalMemory`] (Windows) — the target is another process, accessed
//!   through OS-mediated copies behind an exclusively owned process handle.
//!
//! On top of the contract sit [`AllocatedChunk`] (RAII spans of target
//! memory), [`PatternScanner`] (wildcard byte-signature search) and, on
//! Windows, [`Injector`]/[`InjectedModule`] (forcing a target to load a
//! module and calling its exports).
//!
//! Every operation is fallible and surfaces a typed [`Error`]; partial
//! cross-process copies are never silently accepted, and callers pass
//! [`Address`] values that are explicit about being absolute or
//! module-relative.

pub mod error;
pub mod layout;
pub mod memory;
pub mod scan;

#[cfg(target_os = "windows")]
pub mod inject;
#[cfg(target_os = "windows")]
pub(crate) mod process;

pub use error::{Error, Result};
pub use layout::{LayoutCache, MemValue, TypeLayout};
pub use memory::{Address, AllocatedChunk, DEFAULT_STRING_CAP, LocalMemory, MemorySpace};
pub use scan::{
    MaskByte, Pattern, PatternScanner, SignatureEntry, SignatureSet, load_signatures,
    save_signatures,
};

#[cfg(target_os = "windows")]
pub use inject::{InjectedModule, InjectionTarget, Injector, InjectorOptions};
#[cfg(target_os = "windows")]
pub use memory::ExternalMemory;
#[cfg(target_os = "windows")]
pub use process::ModuleInfo;
