//! Error types for backend lifecycle operations
//!
//! One enum covers every component so failures can cross component
//! boundaries (resolver -> launcher -> caller) without re-wrapping.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Why a tunnel could not be brought up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelFailure {
    /// Nothing answered at the tunnel target before the wait timeout
    TargetUnreachable,
    /// The tunnel provider answered with HTTP 429
    RateLimited,
    /// No public URL was announced before the timeout
    TimedOut,
    /// The tunnel process exited before announcing a URL
    Exited(String),
    /// The tunnel binary could not be downloaded or spawned
    Unavailable(String),
}

impl std::fmt::Display for TunnelFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelFailure::TargetUnreachable => write!(f, "tunnel target is not reachable"),
            TunnelFailure::RateLimited => write!(f, "tunnel provider rate limited the request (429)"),
            TunnelFailure::TimedOut => write!(f, "timed out waiting for the tunnel URL"),
            TunnelFailure::Exited(detail) => write!(f, "tunnel process exited: {}", detail),
            TunnelFailure::Unavailable(detail) => write!(f, "tunnel binary unavailable: {}", detail),
        }
    }
}

/// Error type shared by the registry, installer, resolver, launcher, proxy and tunnel
#[derive(Debug, Error)]
pub enum LauncherError {
    /// No backend has been installed or selected yet
    #[error("No backend is configured. Install or select a backend first.")]
    NoBackendConfigured,

    /// The current backend pointer names a file that no longer exists
    #[error("Backend executable not found: {}", .0.display())]
    BackendMissing(PathBuf),

    /// A path handed to the registry does not exist
    #[error("Backend not found: {}", .0.display())]
    BackendNotFound(PathBuf),

    /// Refused to delete the backend that is currently selected
    #[error("Cannot delete the active backend: {}", .0.display())]
    DeleteActiveBackend(PathBuf),

    /// User-requested cancellation
    #[error("Operation aborted")]
    Aborted,

    /// Network or filesystem failure during a download
    #[error("Download failed: {0}")]
    Download(String),

    /// Stream ended before the declared number of bytes arrived
    #[error("Download incomplete: received {actual} of {expected} bytes")]
    IntegrityMismatch { expected: u64, actual: u64 },

    /// Too many redirects while resolving a download URL
    #[error("Too many redirects while downloading {0}")]
    RedirectLoop(String),

    /// The packed release could not unpack itself
    #[error("Unpack failed: {detail}")]
    Unpack { detail: String },

    /// The backend exited before it reported readiness
    #[error("Backend failed to start: {0}")]
    LaunchFailed(String),

    #[error("Tunnel failed: {0}")]
    Tunnel(TunnelFailure),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LauncherError {
    /// True when the error represents a user cancellation rather than a failure
    pub fn is_aborted(&self) -> bool {
        matches!(self, LauncherError::Aborted)
    }
}

impl From<reqwest::Error> for LauncherError {
    fn from(e: reqwest::Error) -> Self {
        LauncherError::Download(e.to_string())
    }
}

impl From<anyhow::Error> for LauncherError {
    fn from(e: anyhow::Error) -> Self {
        LauncherError::Settings(format!("{:#}", e))
    }
}

pub type Result<T> = std::result::Result<T, LauncherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_distinguishable() {
        assert!(LauncherError::Aborted.is_aborted());
        assert!(!LauncherError::Download("reset".to_string()).is_aborted());
    }

    #[test]
    fn test_unpack_error_keeps_tool_output() {
        let err = LauncherError::Unpack {
            detail: "zlib: invalid block".to_string(),
        };
        assert_eq!(err.to_string(), "Unpack failed: zlib: invalid block");
    }
}
