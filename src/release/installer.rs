//! Release Installer - download, unpack and register a packed backend

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::types::{DownloadAsset, InstallOptions};
use crate::backend::registry::find_launcher;
use crate::backend::BackendRegistry;
use crate::download::{download_file, http_client, DownloadRequest};
use crate::error::{LauncherError, Result};
use crate::events::{EventBus, LauncherEvent};
use crate::fs_utils::{make_executable, path_exists, remove_dir_with_retry};
use crate::platform::{hide_console_window, primary_launcher_name, LAUNCHER_BASE_NAMES};

/// Installer progress granularity (about ten updates per second)
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

const REMOVE_ATTEMPTS: u32 = 5;
const REMOVE_INITIAL_DELAY: Duration = Duration::from_millis(200);

pub struct ReleaseInstaller {
    registry: Arc<BackendRegistry>,
    client: reqwest::Client,
    events: EventBus,
    unpack_timeout: Duration,
}

impl ReleaseInstaller {
    pub fn new(registry: Arc<BackendRegistry>, events: EventBus, unpack_timeout: Duration) -> Result<Self> {
        Ok(Self {
            registry,
            client: http_client()?,
            events,
            unpack_timeout,
        })
    }

    /// Install `asset` and return the new launcher path.
    ///
    /// The current pointer only moves after the unpack succeeded and a
    /// launcher was found. Any failure removes the packed download and the
    /// partially unpacked folder.
    pub async fn install(
        &self,
        asset: &DownloadAsset,
        options: &InstallOptions,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let install_dir = self.registry.install_dir().to_path_buf();
        tokio::fs::create_dir_all(&install_dir).await?;

        let first_install = self.registry.get_current().await?.is_none();
        let packed = install_dir.join(format!("{}.packed", asset.name));
        let dest = install_dir.join(asset.folder_name());

        log::info!("Installing {} {} into {}", asset.name, asset.version, dest.display());

        let launcher = match self.download_and_unpack(asset, &packed, &dest, cancel).await {
            Ok(launcher) => launcher,
            Err(e) => {
                self.cleanup_failed(&packed, &dest).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::remove_file(&packed).await {
            log::warn!("Failed to remove packed file {}: {}", packed.display(), e);
        }

        self.registry.invalidate(&launcher).await;

        if first_install || (options.is_update && options.was_current) {
            self.registry.set_current(&launcher).await?;
        }

        if options.is_update {
            if let Some(old) = &options.old_backend_path {
                self.retire(old, &launcher).await;
            }
        }

        self.events.emit(LauncherEvent::BackendsChanged);
        log::info!("Installed backend {}", launcher.display());

        Ok(launcher)
    }

    async fn download_and_unpack(
        &self,
        asset: &DownloadAsset,
        packed: &Path,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        download_file(
            &self.client,
            DownloadRequest {
                url: &asset.source_url,
                dest: packed,
                label: &asset.name,
                expected_size: Some(asset.expected_size_bytes).filter(|n| *n > 0),
                progress_interval: PROGRESS_INTERVAL,
            },
            &self.events,
            cancel,
        )
        .await?;

        make_executable(packed).await?;

        if path_exists(dest).await {
            log::info!("Replacing existing folder {}", dest.display());
            remove_dir_with_retry(dest, REMOVE_ATTEMPTS, REMOVE_INITIAL_DELAY).await?;
        }
        tokio::fs::create_dir_all(dest).await?;

        self.unpack(packed, dest).await?;
        locate_launcher(dest, asset).await
    }

    /// Run `<packed> --unpack <dest>`; a failure carries the tool's own output
    async fn unpack(&self, packed: &Path, dest: &Path) -> Result<()> {
        let mut cmd = Command::new(packed);
        cmd.arg("--unpack")
            .arg(dest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        hide_console_window(&mut cmd);

        let output = tokio::time::timeout(self.unpack_timeout, cmd.output())
            .await
            .map_err(|_| LauncherError::Timeout(format!("unpacking {}", packed.display())))?
            .map_err(|e| LauncherError::Unpack {
                detail: format!("failed to run {}: {}", packed.display(), e),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let detail = if !stderr.is_empty() {
            stderr
        } else if !stdout.is_empty() {
            stdout
        } else {
            format!("unpacker exited with {}", output.status)
        };

        Err(LauncherError::Unpack { detail })
    }

    async fn cleanup_failed(&self, packed: &Path, dest: &Path) {
        match tokio::fs::remove_file(packed).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {}: {}", packed.display(), e),
        }

        if let Err(e) = remove_dir_with_retry(dest, REMOVE_ATTEMPTS, REMOVE_INITIAL_DELAY).await {
            log::warn!("Failed to remove partial install {}: {}", dest.display(), e);
        }
    }

    /// Best-effort removal of the backend an update replaced
    async fn retire(&self, old: &Path, new: &Path) {
        if old == new || old.parent() == new.parent() {
            return;
        }

        match self.registry.delete(old).await {
            Ok(()) => log::info!("Removed previous backend {}", old.display()),
            Err(e) => log::warn!("Could not remove previous backend {}: {}", old.display(), e),
        }
    }
}

/// Find the launcher in a freshly unpacked folder, renaming the entry
/// executable to the primary launcher name when none matches
async fn locate_launcher(dest: &Path, asset: &DownloadAsset) -> Result<PathBuf> {
    if let Some(launcher) = find_launcher(dest) {
        return Ok(launcher);
    }

    let entry = unpacked_entry(dest, asset).await?.ok_or_else(|| LauncherError::Unpack {
        detail: format!("no launcher executable found in {}", dest.display()),
    })?;

    let launcher = dest.join(primary_launcher_name());
    log::info!("Renaming {} to {}", entry.display(), launcher.display());
    tokio::fs::rename(&entry, &launcher).await?;
    make_executable(&launcher).await?;

    Ok(launcher)
}

/// Top-level file that looks like the release's entry point
async fn unpacked_entry(dest: &Path, asset: &DownloadAsset) -> Result<Option<PathBuf>> {
    for name in [asset.name.as_str(), asset.base_name()] {
        let candidate = dest.join(name);
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
    }

    let mut entries = tokio::fs::read_dir(dest).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_lowercase();
        let looks_like_entry = LAUNCHER_BASE_NAMES.iter().any(|base| name.starts_with(base))
            && (!cfg!(windows) || name.ends_with(".exe"));

        if looks_like_entry && entry.file_type().await?.is_file() {
            return Ok(Some(entry.path()));
        }
    }

    Ok(None)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::settings::JsonSettingsStore;
    use crate::test_support::{write_script, TestServer};
    use hyper::{Body, Response};
    use tempfile::{tempdir, TempDir};

    /// Packed release that unpacks a launcher named `entry` printing `version`
    fn packed_release(entry: &str, version: &str) -> String {
        format!(
            "#!/bin/sh\n\
             if [ \"$1\" = \"--unpack\" ]; then\n\
               mkdir -p \"$2\"\n\
               printf '#!/bin/sh\\necho {version}\\n' > \"$2/{entry}\"\n\
               chmod +x \"$2/{entry}\"\n\
               exit 0\n\
             fi\n\
             exit 1\n",
        )
    }

    async fn serve(body: String) -> TestServer {
        TestServer::start(move |_| Response::new(Body::from(body.clone()))).await
    }

    fn setup() -> (TempDir, Arc<BackendRegistry>, ReleaseInstaller) {
        let dir = tempdir().unwrap();
        let settings = JsonSettingsStore::open(dir.path().join("settings.json")).unwrap();
        let registry = Arc::new(BackendRegistry::new(
            dir.path().join("backends"),
            Arc::new(settings),
            EventBus::new(),
            Duration::from_secs(5),
        ));
        let installer = ReleaseInstaller::new(registry.clone(), EventBus::new(), Duration::from_secs(10)).unwrap();
        (dir, registry, installer)
    }

    fn asset(server: &TestServer, name: &str, version: &str) -> DownloadAsset {
        DownloadAsset {
            name: name.to_string(),
            source_url: server.url(&format!("/{}", name)),
            expected_size_bytes: 0,
            version: version.to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_install_becomes_current() {
        let server = serve(packed_release("koboldcpp", "1.98.1")).await;
        let (_dir, registry, installer) = setup();

        let asset = asset(&server, "koboldcpp-linux-x64", "1.98.1");
        let launcher = installer
            .install(&asset, &InstallOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        let folder = registry.install_dir().join("koboldcpp-linux-x64-1.98.1");
        assert_eq!(launcher, folder.join("koboldcpp"));
        assert_eq!(registry.current_path(), Some(launcher));
        assert!(!registry.install_dir().join("koboldcpp-linux-x64.packed").exists());
    }

    #[tokio::test]
    async fn test_entry_is_renamed_to_launcher() {
        let server = serve(packed_release("koboldcpp-linux-x64", "1.98.1")).await;
        let (_dir, registry, installer) = setup();

        let asset = asset(&server, "koboldcpp-linux-x64", "1.98.1");
        let launcher = installer
            .install(&asset, &InstallOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(launcher.file_name().unwrap(), "koboldcpp-launcher");
        assert!(launcher.is_file());
        assert_eq!(registry.list_backends().await[0].version, "1.98.1");
    }

    #[tokio::test]
    async fn test_unpack_failure_cleans_up_and_keeps_pointer() {
        let server = serve("#!/bin/sh\necho 'zlib: invalid block' >&2\nexit 3\n".to_string()).await;
        let (_dir, registry, installer) = setup();

        let existing = registry.install_dir().join("koboldcpp-1.70").join("koboldcpp");
        write_script(&existing, "echo 1.70");
        registry.set_current(&existing).await.unwrap();

        let asset = asset(&server, "koboldcpp-linux-x64", "1.98.1");
        let options = InstallOptions {
            is_update: true,
            was_current: true,
            old_backend_path: Some(existing.clone()),
        };
        let err = installer
            .install(&asset, &options, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            LauncherError::Unpack { detail } => assert_eq!(detail, "zlib: invalid block"),
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(registry.current_path(), Some(existing.clone()));
        assert!(existing.exists());
        assert!(!registry.install_dir().join("koboldcpp-linux-x64-1.98.1").exists());
        assert!(!registry.install_dir().join("koboldcpp-linux-x64.packed").exists());
    }

    #[tokio::test]
    async fn test_update_switches_current_and_removes_old() {
        let server = serve(packed_release("koboldcpp", "1.98.1")).await;
        let (_dir, registry, installer) = setup();

        let old = registry.install_dir().join("koboldcpp-linux-x64-1.70").join("koboldcpp");
        write_script(&old, "echo 1.70");
        registry.set_current(&old).await.unwrap();

        let asset = asset(&server, "koboldcpp-linux-x64", "1.98.1");
        let options = InstallOptions {
            is_update: true,
            was_current: true,
            old_backend_path: Some(old.clone()),
        };
        let launcher = installer
            .install(&asset, &options, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(registry.current_path(), Some(launcher));
        assert!(!old.parent().unwrap().exists());
    }
}
