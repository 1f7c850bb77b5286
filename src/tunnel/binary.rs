//! Locate or download the tunnel binary

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::download::{download_file, DownloadRequest};
use crate::error::{LauncherError, Result, TunnelFailure};
use crate::events::EventBus;
use crate::fs_utils::{make_executable, path_exists};
use crate::platform::{tunnel_asset_name, tunnel_binary_name};

/// Latest-release download prefix for cloudflared assets
pub const TUNNEL_RELEASE_BASE: &str = "https://github.com/cloudflare/cloudflared/releases/latest/download";

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Path of the tunnel binary in the install directory, downloading it first
/// if it is not there yet
pub async fn ensure_tunnel_binary(
    install_dir: &Path,
    client: &reqwest::Client,
    events: &EventBus,
) -> Result<PathBuf> {
    let path = install_dir.join(tunnel_binary_name());
    if path_exists(&path).await {
        return Ok(path);
    }

    let asset = tunnel_asset_name().ok_or_else(|| {
        LauncherError::Tunnel(TunnelFailure::Unavailable(format!(
            "no prebuilt tunnel binary for {}-{}",
            std::env::consts::OS,
            std::env::consts::ARCH
        )))
    })?;

    tokio::fs::create_dir_all(install_dir).await?;

    let url = format!("{}/{}", TUNNEL_RELEASE_BASE, asset);
    log::info!("Downloading tunnel binary from {}", url);

    download_file(
        client,
        DownloadRequest {
            url: &url,
            dest: &path,
            label: asset,
            expected_size: None,
            progress_interval: PROGRESS_INTERVAL,
        },
        events,
        &CancellationToken::new(),
    )
    .await
    .map_err(|e| LauncherError::Tunnel(TunnelFailure::Unavailable(e.to_string())))?;

    make_executable(&path).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::http_client;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_existing_binary_is_reused() {
        let dir = tempdir().unwrap();
        let existing = dir.path().join(tunnel_binary_name());
        std::fs::write(&existing, b"binary").unwrap();

        let found = ensure_tunnel_binary(dir.path(), &http_client().unwrap(), &EventBus::new())
            .await
            .unwrap();
        assert_eq!(found, existing);
    }
}
