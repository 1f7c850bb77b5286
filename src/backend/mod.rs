//! Backend Registry
//!
//! Discovers installed backends and tracks which one is current.
//!
//! Module structure:
//! - types.rs: Backend record
//! - version.rs: folder/binary version parsing and ordering
//! - registry.rs: BackendRegistry (listing, cache, current pointer, delete)

pub mod registry;
pub mod types;
pub mod version;

pub use registry::BackendRegistry;
pub use types::Backend;
pub use version::{compare_versions, version_from_folder_name, version_from_output};
