//! Launcher configuration
//!
//! Defaults are rooted in the platform data directory; environment variables
//! and CLI flags override individual fields.

use std::path::PathBuf;
use std::time::Duration;

/// Default port the local proxy listens on
pub const DEFAULT_PROXY_PORT: u16 = 5002;

/// Host and port the backend binds when launch arguments don't say otherwise
pub const DEFAULT_BACKEND_HOST: &str = "127.0.0.1";
pub const DEFAULT_BACKEND_PORT: u16 = 5001;

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Directory holding unpacked backends, cached models and the tunnel binary
    pub install_dir: PathBuf,
    /// JSON key/value settings file
    pub settings_path: PathBuf,
    /// Port the local proxy binds on 127.0.0.1 (0 picks a free port)
    pub proxy_port: u16,
    /// Forward every backend output line, including known-noisy ones
    pub debug_output: bool,
    /// Bound on `<packed> --unpack <dir>`
    pub unpack_timeout: Duration,
    /// Bound on `<launcher> --version`
    pub version_timeout: Duration,
    /// How long `stop()` waits after SIGTERM before force-killing
    pub stop_timeout: Duration,
    /// How long the tunnel waits for its target to answer
    pub tunnel_target_timeout: Duration,
    /// How long the tunnel waits for its public URL
    pub tunnel_url_timeout: Duration,
    /// Tunnel executable to use instead of the managed download
    pub tunnel_binary: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let install_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kindling");

        Self::with_install_dir(install_dir)
    }
}

impl LauncherConfig {
    /// Default configuration rooted at a specific install directory
    pub fn with_install_dir(install_dir: PathBuf) -> Self {
        Self {
            settings_path: install_dir.join("settings.json"),
            install_dir,
            proxy_port: DEFAULT_PROXY_PORT,
            debug_output: false,
            unpack_timeout: Duration::from_secs(120),
            version_timeout: Duration::from_secs(15),
            stop_timeout: Duration::from_secs(5),
            tunnel_target_timeout: Duration::from_secs(30),
            tunnel_url_timeout: Duration::from_secs(30),
            tunnel_binary: None,
        }
    }

    /// Apply `KINDLING_INSTALL_DIR`, `KINDLING_PROXY_PORT`, `KINDLING_DEBUG`
    /// and `KINDLING_CLOUDFLARED`
    pub fn from_env() -> Self {
        let mut config = match std::env::var("KINDLING_INSTALL_DIR") {
            Ok(dir) if !dir.trim().is_empty() => Self::with_install_dir(PathBuf::from(dir)),
            _ => Self::default(),
        };

        if let Ok(port) = std::env::var("KINDLING_PROXY_PORT") {
            match port.trim().parse::<u16>() {
                Ok(p) => config.proxy_port = p,
                Err(e) => log::warn!("Ignoring invalid KINDLING_PROXY_PORT '{}': {}", port, e),
            }
        }

        if let Ok(debug) = std::env::var("KINDLING_DEBUG") {
            config.debug_output = matches!(debug.trim(), "1" | "true" | "yes");
        }

        if let Ok(binary) = std::env::var("KINDLING_CLOUDFLARED") {
            if !binary.trim().is_empty() {
                config.tunnel_binary = Some(PathBuf::from(binary));
            }
        }

        config
    }

    /// Directory that holds cached model files
    pub fn models_dir(&self) -> PathBuf {
        self.install_dir.join("models")
    }
}
