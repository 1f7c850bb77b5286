//! ModelResolver - download-once model cache with abortable transfers

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cache_path::{cache_relative_path, download_url, is_remote_model};
use crate::download::{download_file, http_client, staging_path, DownloadRequest};
use crate::error::{LauncherError, Result};
use crate::events::EventBus;
use crate::fs_utils::path_exists;

/// Resolver progress granularity
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// A download `abort_all` can cancel and clean up after
struct ActiveDownload {
    token: CancellationToken,
    staging: PathBuf,
}

pub struct ModelResolver {
    models_dir: PathBuf,
    client: reqwest::Client,
    events: EventBus,
    /// In-flight downloads; `abort_all` cancels every entry
    active: DashMap<Uuid, ActiveDownload>,
    /// One download per destination; later callers wait and reuse the file
    destinations: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl ModelResolver {
    pub fn new(models_dir: PathBuf, events: EventBus) -> Result<Self> {
        Ok(Self {
            models_dir,
            client: http_client()?,
            events,
            active: DashMap::new(),
            destinations: DashMap::new(),
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Local cache location for a remote model reference
    pub fn cache_path(&self, url: &str, param_type: &str) -> Option<PathBuf> {
        cache_relative_path(url).map(|rel| self.models_dir.join(param_type).join(rel))
    }

    /// Map a launch argument value to a local path.
    ///
    /// Non-URL values pass through unchanged. A cached file is returned
    /// without touching the network. Otherwise the model is downloaded, and
    /// `cancel` (or `abort_all`) aborts it with `LauncherError::Aborted`.
    pub async fn resolve(&self, value: &str, param_type: &str, cancel: &CancellationToken) -> Result<String> {
        if !is_remote_model(value) {
            return Ok(value.to_string());
        }

        let dest = self
            .cache_path(value, param_type)
            .ok_or_else(|| LauncherError::Download(format!("Cannot derive a cache path for {}", value)))?;

        if path_exists(&dest).await {
            log::debug!("Using cached model {}", dest.display());
            return Ok(dest.to_string_lossy().to_string());
        }

        let lock = self.destinations.entry(dest.clone()).or_default().clone();
        let _downloading = tokio::select! {
            _ = cancel.cancelled() => return Err(LauncherError::Aborted),
            guard = lock.lock() => guard,
        };

        // Another caller may have finished this file while we waited
        if path_exists(&dest).await {
            log::debug!("Using cached model {}", dest.display());
            return Ok(dest.to_string_lossy().to_string());
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let token = cancel.child_token();
        let id = Uuid::new_v4();
        self.active.insert(
            id,
            ActiveDownload {
                token: token.clone(),
                staging: staging_path(&dest),
            },
        );

        let url = download_url(value);
        log::info!("Downloading model {} -> {}", url, dest.display());

        let label = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| url.clone());

        let result = download_file(
            &self.client,
            DownloadRequest {
                url: &url,
                dest: &dest,
                label: &label,
                expected_size: None,
                progress_interval: PROGRESS_INTERVAL,
            },
            &self.events,
            &token,
        )
        .await;

        self.active.remove(&id);

        match result {
            Ok(bytes) => {
                log::info!("Downloaded {} ({} bytes)", dest.display(), bytes);
                Ok(dest.to_string_lossy().to_string())
            }
            Err(LauncherError::Aborted) => {
                log::info!("Model download aborted: {}", url);
                Err(LauncherError::Aborted)
            }
            Err(e) => Err(LauncherError::Download(format!("{}: {}", url, e))),
        }
    }

    /// Cancel every in-flight download and remove its partial file
    pub fn abort_all(&self) {
        let count = self.active.len();
        for entry in self.active.iter() {
            let download = entry.value();
            download.token.cancel();

            match std::fs::remove_file(&download.staging) {
                Ok(()) => log::debug!("Removed partial download {}", download.staging.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                // Windows refuses while the writer still holds the file; it cleans up itself
                Err(e) => log::debug!("Partial download {} not removed yet: {}", download.staging.display(), e),
            }
        }
        if count > 0 {
            log::info!("Aborted {} model download(s)", count);
        }
    }

    pub fn active_downloads(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestServer;
    use futures_util::{stream, StreamExt};
    use hyper::{Body, Response};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_local_values_pass_through() {
        let dir = tempdir().unwrap();
        let resolver = ModelResolver::new(dir.path().to_path_buf(), EventBus::new()).unwrap();
        let token = CancellationToken::new();

        assert_eq!(resolver.resolve("/data/m.gguf", "model", &token).await.unwrap(), "/data/m.gguf");
        assert_eq!(
            resolver.resolve("https://host/readme.txt", "model", &token).await.unwrap(),
            "https://host/readme.txt"
        );
    }

    #[tokio::test]
    async fn test_downloads_once_into_hub_layout() {
        let server = TestServer::start(|_| Response::new(Body::from("GGUF-weights"))).await;
        let dir = tempdir().unwrap();
        let resolver = ModelResolver::new(dir.path().to_path_buf(), EventBus::new()).unwrap();
        let token = CancellationToken::new();

        let url = server.url("/a/b/resolve/main/model.gguf");
        let first = resolver.resolve(&url, "model", &token).await.unwrap();
        let second = resolver.resolve(&url, "model", &token).await.unwrap();

        let expected = dir.path().join("model").join("a").join("b").join("model.gguf");
        assert_eq!(first, expected.to_string_lossy());
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&expected).unwrap(), "GGUF-weights");
        assert_eq!(server.hits(), 1);
        assert_eq!(resolver.active_downloads(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_download() {
        let server = TestServer::start(|_| {
            let chunks = stream::iter(vec!["GGUF", "-weights"]).then(|chunk| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, std::io::Error>(chunk)
            });
            Response::new(Body::wrap_stream(chunks))
        })
        .await;
        let dir = tempdir().unwrap();
        let resolver = Arc::new(ModelResolver::new(dir.path().to_path_buf(), EventBus::new()).unwrap());
        let url = server.url("/a/b/resolve/main/shared.gguf");

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let resolver = resolver.clone();
                let url = url.clone();
                tokio::spawn(async move { resolver.resolve(&url, "model", &CancellationToken::new()).await })
            })
            .collect();

        let mut paths = Vec::new();
        for task in tasks {
            paths.push(task.await.unwrap().unwrap());
        }

        assert!(paths.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(std::fs::read_to_string(&paths[0]).unwrap(), "GGUF-weights");
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_wrapped_and_leaves_nothing() {
        let server = TestServer::start(|_| {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
            resp
        })
        .await;
        let dir = tempdir().unwrap();
        let resolver = ModelResolver::new(dir.path().to_path_buf(), EventBus::new()).unwrap();

        let url = server.url("/files/broken.gguf");
        let err = resolver
            .resolve(&url, "model", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, LauncherError::Download(ref msg) if msg.contains("broken.gguf")));
        assert!(!resolver.cache_path(&url, "model").unwrap().exists());
    }

    #[tokio::test]
    async fn test_abort_all_removes_partial_file() {
        // Sends one chunk, then never finishes
        let server = TestServer::start(|_| {
            let first = stream::iter(vec![Ok::<_, std::io::Error>("partial")]);
            Response::new(Body::wrap_stream(first.chain(stream::pending())))
        })
        .await;

        let dir = tempdir().unwrap();
        let resolver = Arc::new(ModelResolver::new(dir.path().to_path_buf(), EventBus::new()).unwrap());
        let url = server.url("/files/big.gguf");
        let dest = resolver.cache_path(&url, "model").unwrap();
        let staging = crate::download::staging_path(&dest);

        let task = {
            let resolver = resolver.clone();
            let url = url.clone();
            tokio::spawn(async move { resolver.resolve(&url, "model", &CancellationToken::new()).await })
        };

        for _ in 0..100 {
            if staging.exists() && resolver.active_downloads() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(staging.exists());

        resolver.abort_all();
        assert!(!staging.exists());
        let err = task.await.unwrap().unwrap_err();

        assert!(err.is_aborted());
        assert!(!staging.exists());
        assert!(!dest.exists());
        assert_eq!(resolver.active_downloads(), 0);
    }
}
