//! Streaming HTTP downloads shared by the installer, model resolver and tunnel
//!
//! Every download goes to `<dest>.tmp` first and is renamed into place only
//! after the byte count checks out, so a half-written file never appears
//! at its final path.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::LOCATION;
use reqwest::{Client, Response, Url};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{LauncherError, Result};
use crate::events::{DownloadProgress, EventBus, LauncherEvent};

/// Hard cap on followed redirects
pub const MAX_REDIRECTS: usize = 10;

/// HTTP client used for downloads.
///
/// Redirects are followed manually by `fetch_following_redirects` so the
/// final URL and hop count stay under our control.
pub fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("kindling/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| LauncherError::Download(format!("Failed to create HTTP client: {}", e)))
}

/// Turns byte counts into throttled `DownloadProgress` snapshots
pub struct ProgressTracker {
    label: String,
    total: Option<u64>,
    started: Instant,
    last_emit: Option<Instant>,
    interval: Duration,
}

impl ProgressTracker {
    pub fn new(label: impl Into<String>, total: Option<u64>, interval: Duration) -> Self {
        Self {
            label: label.into(),
            total: total.filter(|t| *t > 0),
            started: Instant::now(),
            last_emit: None,
            interval,
        }
    }

    /// Snapshot if at least `interval` passed since the previous one
    pub fn update(&mut self, downloaded: u64) -> Option<DownloadProgress> {
        let now = Instant::now();
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < self.interval {
                return None;
            }
        }
        self.last_emit = Some(now);
        Some(self.snapshot(downloaded))
    }

    /// Final snapshot, never throttled
    pub fn finish(&self, downloaded: u64) -> DownloadProgress {
        let mut progress = self.snapshot(downloaded);
        progress.percent = 100.0;
        progress.eta_secs = Some(0);
        progress
    }

    fn snapshot(&self, downloaded: u64) -> DownloadProgress {
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed_bps = if elapsed > 0.0 { downloaded as f64 / elapsed } else { 0.0 };

        let (percent, eta_secs) = match self.total {
            Some(total) => {
                let percent = (downloaded as f32 / total as f32 * 100.0).min(100.0);
                let remaining = total.saturating_sub(downloaded) as f64;
                let eta = if speed_bps > 0.0 {
                    Some((remaining / speed_bps).ceil() as u64)
                } else {
                    None
                };
                (percent, eta)
            }
            None => (0.0, None),
        };

        DownloadProgress {
            label: self.label.clone(),
            downloaded_bytes: downloaded,
            total_bytes: self.total,
            percent,
            speed_bps,
            eta_secs,
        }
    }
}

/// GET `url`, following up to `MAX_REDIRECTS` redirects by hand.
///
/// Relative `Location` headers resolve against the current URL. Any
/// non-success final status is an error.
pub async fn fetch_following_redirects(
    client: &Client,
    url: &str,
    cancel: &CancellationToken,
) -> Result<Response> {
    let mut current =
        Url::parse(url).map_err(|e| LauncherError::Download(format!("Invalid URL {}: {}", url, e)))?;

    for _ in 0..=MAX_REDIRECTS {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(LauncherError::Aborted),
            sent = client.get(current.clone()).send() => sent?,
        };

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    LauncherError::Download(format!("Redirect from {} without a Location header", current))
                })?;

            let next = current.join(location).map_err(|e| {
                LauncherError::Download(format!("Invalid redirect target '{}': {}", location, e))
            })?;
            log::debug!("Following redirect {} -> {}", current, next);
            current = next;
            continue;
        }

        if !status.is_success() {
            return Err(LauncherError::Download(format!(
                "{} returned HTTP {}",
                current, status
            )));
        }

        return Ok(response);
    }

    Err(LauncherError::RedirectLoop(url.to_string()))
}

/// Where a download is staged before being renamed into place
pub fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dest.with_file_name(name)
}

/// Parameters of a single file download
pub struct DownloadRequest<'a> {
    pub url: &'a str,
    pub dest: &'a Path,
    /// Label attached to progress events
    pub label: &'a str,
    /// Size to verify against when the server sends no Content-Length
    pub expected_size: Option<u64>,
    pub progress_interval: Duration,
}

/// Download `request.url` to `request.dest`, returning the byte count.
///
/// On any error (including cancellation) the staging file is removed and
/// `dest` is left untouched.
pub async fn download_file(
    client: &Client,
    request: DownloadRequest<'_>,
    events: &EventBus,
    cancel: &CancellationToken,
) -> Result<u64> {
    let staging = staging_path(request.dest);

    let result = async {
        let response = fetch_following_redirects(client, request.url, cancel).await?;
        let written = stream_to_file(response, &staging, &request, events, cancel).await?;
        tokio::fs::rename(&staging, request.dest).await?;
        Ok::<_, LauncherError>(written)
    }
    .await;

    if result.is_err() {
        match tokio::fs::remove_file(&staging).await {
            Ok(()) => log::debug!("Removed partial download {}", staging.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove partial download {}: {}", staging.display(), e),
        }
    }

    result
}

async fn stream_to_file(
    response: Response,
    staging: &Path,
    request: &DownloadRequest<'_>,
    events: &EventBus,
    cancel: &CancellationToken,
) -> Result<u64> {
    let declared = response.content_length().or(request.expected_size).filter(|n| *n > 0);
    let mut tracker = ProgressTracker::new(request.label, declared, request.progress_interval);

    let mut file = tokio::fs::File::create(staging).await?;
    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LauncherError::Aborted),
            chunk = stream.next() => chunk,
        };

        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(|e| LauncherError::Download(format!("Download error: {}", e)))?;

        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        if let Some(progress) = tracker.update(downloaded) {
            events.emit(LauncherEvent::DownloadProgress(progress));
        }
    }

    file.flush().await?;
    drop(file);

    if let Some(expected) = declared {
        if downloaded != expected {
            return Err(LauncherError::IntegrityMismatch {
                expected,
                actual: downloaded,
            });
        }
    }

    events.emit(LauncherEvent::DownloadProgress(tracker.finish(downloaded)));
    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestServer;
    use hyper::{Body, Response as HttpResponse, StatusCode};
    use tempfile::tempdir;

    fn request<'a>(url: &'a str, dest: &'a Path) -> DownloadRequest<'a> {
        DownloadRequest {
            url,
            dest,
            label: "test",
            expected_size: None,
            progress_interval: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_progress_is_throttled() {
        let mut tracker = ProgressTracker::new("x", Some(100), Duration::from_secs(60));
        assert!(tracker.update(10).is_some());
        assert!(tracker.update(20).is_none());

        let done = tracker.finish(100);
        assert_eq!(done.percent, 100.0);
        assert_eq!(done.total_bytes, Some(100));
    }

    #[test]
    fn test_staging_path_appends_suffix() {
        assert_eq!(
            staging_path(Path::new("/m/model.gguf")),
            PathBuf::from("/m/model.gguf.tmp")
        );
    }

    #[tokio::test]
    async fn test_follows_relative_redirect() {
        let server = TestServer::start(|req| match req.uri().path() {
            "/start" => HttpResponse::builder()
                .status(StatusCode::FOUND)
                .header("location", "/files/blob.bin")
                .body(Body::empty())
                .unwrap(),
            _ => HttpResponse::new(Body::from("payload")),
        })
        .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("blob.bin");
        let url = server.url("/start");

        let client = http_client().unwrap();
        let written = download_file(&client, request(&url, &dest), &EventBus::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 7);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "payload");
        assert!(!staging_path(&dest).exists());
        assert_eq!(server.hits(), 2);
    }

    #[tokio::test]
    async fn test_redirect_loop_is_capped() {
        let server = TestServer::start(|_| {
            HttpResponse::builder()
                .status(StatusCode::FOUND)
                .header("location", "/again")
                .body(Body::empty())
                .unwrap()
        })
        .await;

        let client = http_client().unwrap();
        let err = fetch_following_redirects(&client, &server.url("/again"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, LauncherError::RedirectLoop(_)));
        assert_eq!(server.hits(), MAX_REDIRECTS + 1);
    }

    #[tokio::test]
    async fn test_size_mismatch_leaves_no_file() {
        // Chunked body: no Content-Length, so the expected size is the reference
        let server = TestServer::start(|_| {
            let chunks = futures_util::stream::iter(vec![Ok::<_, std::io::Error>("short")]);
            HttpResponse::new(Body::wrap_stream(chunks))
        })
        .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("asset.packed");
        let url = server.url("/asset");

        let client = http_client().unwrap();
        let err = download_file(
            &client,
            DownloadRequest {
                expected_size: Some(1024),
                ..request(&url, &dest)
            },
            &EventBus::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            LauncherError::IntegrityMismatch {
                expected: 1024,
                actual: 5
            }
        ));
        assert!(!dest.exists());
        assert!(!staging_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = TestServer::start(|_| {
            HttpResponse::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::empty())
                .unwrap()
        })
        .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("missing.gguf");
        let url = server.url("/missing.gguf");

        let client = http_client().unwrap();
        let err = download_file(&client, request(&url, &dest), &EventBus::new(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, LauncherError::Download(_)));
        assert!(!dest.exists());
    }
}
