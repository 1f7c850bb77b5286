//! Model Resolver
//!
//! Turns remote model URLs in launch arguments into cached local files.
//!
//! Module structure:
//! - cache_path.rs: remote-reference detection and cache path derivation
//! - resolver.rs: ModelResolver (download, abort registry)
//! - args.rs: rewriting model-bearing launch flags

pub mod args;
pub mod cache_path;
pub mod resolver;

pub use args::{resolve_launch_args, MODEL_FLAGS};
pub use cache_path::{cache_relative_path, is_remote_model, MODEL_EXTENSIONS};
pub use resolver::ModelResolver;
