pub mod chunk;
pub mod space;

pub(crate) mod local;

#[cfg(target_os = "windows")]
pub(crate) mod external;

#[cfg(test)]
pub mod mock;

pub use chunk::AllocatedChunk;
pub use local::LocalMemory;
pub use space::{Address, DEFAULT_STRING_CAP, MemorySpace};

#[cfg(target_os = "windows")]
pub use external::ExternalMemory;

#[cfg(test)]
pub use mock::{MockSpace, MockSpaceBuilder};
