//! Backend Registry - installed backend discovery and current selection

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::RwLock;

use super::types::Backend;
use super::version::{compare_versions, version_from_folder_name, version_from_output};
use crate::error::{LauncherError, Result};
use crate::events::{EventBus, LauncherEvent};
use crate::fs_utils::{dir_size, path_exists, remove_dir_with_retry};
use crate::platform::{hide_console_window, launcher_candidates};
use crate::settings::{SettingsStore, CURRENT_BACKEND_KEY};

/// Name of the model cache folder inside the install directory
pub const MODELS_DIR_NAME: &str = "models";

/// Version reported for a current backend that can't be introspected
pub const UNKNOWN_VERSION: &str = "unknown";

const REMOVE_ATTEMPTS: u32 = 5;
const REMOVE_INITIAL_DELAY: Duration = Duration::from_millis(200);

/// Tracks installed backends and the current selection
pub struct BackendRegistry {
    install_dir: PathBuf,
    settings: Arc<dyn SettingsStore>,
    events: EventBus,
    version_timeout: Duration,
    /// Resolved backends by launcher path; only invalidated explicitly
    cache: RwLock<HashMap<PathBuf, Backend>>,
}

impl BackendRegistry {
    pub fn new(
        install_dir: PathBuf,
        settings: Arc<dyn SettingsStore>,
        events: EventBus,
        version_timeout: Duration,
    ) -> Self {
        Self {
            install_dir,
            settings,
            events,
            version_timeout,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// List every backend folder with a launcher and a resolvable version,
    /// newest first. A missing install directory yields an empty list.
    pub async fn list_backends(&self) -> Vec<Backend> {
        let mut entries = match tokio::fs::read_dir(&self.install_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                log::warn!("Failed to read install directory {}: {}", self.install_dir.display(), e);
                return Vec::new();
            }
        };

        let mut backends = Vec::new();

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Failed to read install directory entry: {}", e);
                    break;
                }
            };

            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir || entry.file_name() == MODELS_DIR_NAME {
                continue;
            }

            let Some(launcher) = find_launcher(&entry.path()) else {
                continue;
            };

            match self.describe(&launcher).await {
                Some(backend) => backends.push(backend),
                None => log::warn!(
                    "Skipping backend {}: unable to determine its version",
                    launcher.display()
                ),
            }
        }

        backends.sort_by(|a, b| compare_versions(&b.version, &a.version));
        backends
    }

    /// Resolve (or fetch from cache) the Backend record for a launcher
    async fn describe(&self, launcher: &Path) -> Option<Backend> {
        if let Some(cached) = self.cache.read().await.get(launcher) {
            return Some(cached.clone());
        }

        let folder = launcher.parent()?;
        let folder_name = folder.file_name()?.to_string_lossy().to_string();

        let folder_version = version_from_folder_name(&folder_name);
        let binary_version = self.query_binary_version(launcher).await;

        let (version, actual_version) = match (folder_version, binary_version) {
            (Some(from_folder), Some(from_binary)) if from_folder != from_binary => {
                log::debug!(
                    "Backend {} reports {} but folder says {}",
                    launcher.display(),
                    from_binary,
                    from_folder
                );
                (from_folder, Some(from_binary))
            }
            (Some(from_folder), _) => (from_folder, None),
            (None, Some(from_binary)) => (from_binary, None),
            (None, None) => return None,
        };

        let backend = Backend {
            path: launcher.to_path_buf(),
            folder_name,
            version,
            actual_version,
            size_bytes: dir_size(folder),
        };

        self.cache
            .write()
            .await
            .insert(launcher.to_path_buf(), backend.clone());

        Some(backend)
    }

    /// Run `<launcher> --version` and parse the last non-blank output line
    async fn query_binary_version(&self, launcher: &Path) -> Option<String> {
        let mut cmd = Command::new(launcher);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        hide_console_window(&mut cmd);

        let output = match tokio::time::timeout(self.version_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                log::warn!("Failed to run {} --version: {}", launcher.display(), e);
                return None;
            }
            Err(_) => {
                log::warn!("Timed out running {} --version", launcher.display());
                return None;
            }
        };

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        version_from_output(&combined)
    }

    /// Drop the cached record for a launcher path
    pub async fn invalidate(&self, launcher: &Path) {
        self.cache.write().await.remove(launcher);
    }

    /// Raw Current Backend Pointer, without existence checks
    pub fn current_path(&self) -> Option<PathBuf> {
        self.settings
            .get_setting(CURRENT_BACKEND_KEY)
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
    }

    fn persist_current(&self, path: Option<&Path>) -> Result<()> {
        let value = path.map(|p| p.to_string_lossy().to_string());
        self.settings.set_setting(CURRENT_BACKEND_KEY, value.as_deref())?;

        self.events.emit(LauncherEvent::CurrentBackendChanged { path: value });
        Ok(())
    }

    /// The current backend, self-healing a dangling pointer.
    ///
    /// Falls back to the first listed backend (persisting the choice) when
    /// the pointer is unset or names a missing path, and clears it when
    /// nothing is installed. An existing launcher stays current even when
    /// its version can't be detected.
    pub async fn get_current(&self) -> Result<Option<Backend>> {
        if let Some(path) = self.current_path() {
            if path_exists(&path).await {
                if let Some(backend) = self.describe(&path).await {
                    return Ok(Some(backend));
                }
                log::warn!("Current backend {} has no detectable version", path.display());
                return Ok(Some(unversioned(&path)));
            } else {
                log::warn!("Current backend {} no longer exists", path.display());
            }
        }

        match self.list_backends().await.into_iter().next() {
            Some(first) => {
                log::info!("Selecting {} as current backend", first.path.display());
                self.persist_current(Some(&first.path))?;
                Ok(Some(first))
            }
            None => {
                if self.current_path().is_some() {
                    self.persist_current(None)?;
                }
                Ok(None)
            }
        }
    }

    /// Select a backend; fails without mutating anything if `path` is missing
    pub async fn set_current(&self, path: &Path) -> Result<()> {
        if !path_exists(path).await {
            return Err(LauncherError::BackendNotFound(path.to_path_buf()));
        }

        self.persist_current(Some(path))?;
        log::info!("Current backend set to {}", path.display());
        Ok(())
    }

    /// Delete a non-current backend's folder
    pub async fn delete(&self, path: &Path) -> Result<()> {
        if self.current_path().as_deref() == Some(path) {
            return Err(LauncherError::DeleteActiveBackend(path.to_path_buf()));
        }

        let folder = path
            .parent()
            .ok_or_else(|| LauncherError::BackendNotFound(path.to_path_buf()))?;

        if folder == self.install_dir || !folder.starts_with(&self.install_dir) {
            // Loose launcher outside a versioned folder: only the file goes
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            remove_dir_with_retry(folder, REMOVE_ATTEMPTS, REMOVE_INITIAL_DELAY).await?;
        }

        self.invalidate(path).await;
        self.events.emit(LauncherEvent::BackendsChanged);

        log::info!("Deleted backend {}", path.display());
        Ok(())
    }
}

/// Record for a launcher whose version could not be determined
fn unversioned(launcher: &Path) -> Backend {
    let folder = launcher.parent();
    Backend {
        path: launcher.to_path_buf(),
        folder_name: folder
            .and_then(|f| f.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        version: UNKNOWN_VERSION.to_string(),
        actual_version: None,
        size_bytes: folder.map(dir_size).unwrap_or(0),
    }
}

/// First launcher candidate present in a backend folder
pub fn find_launcher(dir: &Path) -> Option<PathBuf> {
    launcher_candidates()
        .into_iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}
