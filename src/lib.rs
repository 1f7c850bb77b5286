// Kindling - desktop orchestrator for a local LLM inference backend
//
// Installs packed backend releases, resolves remote model references to a
// local cache, launches the current backend behind a loopback proxy and
// optionally exposes it through a public tunnel.

// Shared infrastructure
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod fs_utils;
pub mod platform;
pub mod settings;
pub mod state;

// Core modules
pub mod backend;
pub mod launcher;
pub mod model;
pub mod proxy;
pub mod release;
pub mod tunnel;

#[cfg(test)]
mod test_support;

pub use config::LauncherConfig;
pub use error::{LauncherError, Result, TunnelFailure};
pub use events::{EventBus, LauncherEvent};
pub use state::AppState;

/// Initialize logging to stderr (reads RUST_LOG, defaults to info)
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}
