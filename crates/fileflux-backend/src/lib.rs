//! Storage backends for the fileflux operation engine.
//!
//! - [`MemoryBackend`] keeps everything in process memory.
//! - [`LocalBackend`] serves a scope from a directory on the host.

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
