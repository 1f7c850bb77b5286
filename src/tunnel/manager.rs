//! TunnelManager - one public tunnel at a time

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::binary::ensure_tunnel_binary;
use super::output::{find_public_url, is_rate_limited};
use crate::download::http_client;
use crate::error::{LauncherError, Result, TunnelFailure};
use crate::events::{EventBus, LauncherEvent};
use crate::launcher::process::{spawn_with_output, terminate, OutputLine};

const CHECK_TIMEOUT: Duration = Duration::from_secs(1);
const CHECK_INTERVAL: Duration = Duration::from_millis(500);
const KILL_TIMEOUT: Duration = Duration::from_secs(2);
/// How long to keep reading output after the process exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
/// Output lines quoted when the tunnel exits early
const TAIL_LINES: usize = 10;

struct TunnelSession {
    id: Uuid,
    public_url: Option<String>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

type SessionSlot = Arc<Mutex<Option<TunnelSession>>>;

pub struct TunnelManager {
    install_dir: PathBuf,
    binary_override: Option<PathBuf>,
    client: reqwest::Client,
    events: EventBus,
    target_timeout: Duration,
    url_timeout: Duration,
    start_lock: Mutex<()>,
    session: SessionSlot,
    /// Cancelled (and replaced) by every `stop`, so a start in progress gives up
    stop_token: std::sync::Mutex<CancellationToken>,
}

impl TunnelManager {
    pub fn new(install_dir: PathBuf, events: EventBus, target_timeout: Duration, url_timeout: Duration) -> Result<Self> {
        Ok(Self {
            install_dir,
            binary_override: None,
            client: http_client()?,
            events,
            target_timeout,
            url_timeout,
            start_lock: Mutex::new(()),
            session: Arc::new(Mutex::new(None)),
            stop_token: std::sync::Mutex::new(CancellationToken::new()),
        })
    }

    /// Use an existing tunnel executable instead of the managed download
    pub fn with_binary(mut self, binary: PathBuf) -> Self {
        self.binary_override = Some(binary);
        self
    }

    fn current_stop_token(&self) -> CancellationToken {
        match self.stop_token.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn cancel_pending_start(&self) {
        let fresh = CancellationToken::new();
        let previous = match self.stop_token.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, fresh),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), fresh),
        };
        previous.cancel();
    }

    pub async fn public_url(&self) -> Option<String> {
        self.session.lock().await.as_ref().and_then(|s| s.public_url.clone())
    }

    /// Open a tunnel to `target_url` and return its public URL.
    ///
    /// Returns the existing URL if a tunnel is already up. A `stop` issued
    /// while this is still waiting makes it return `LauncherError::Aborted`
    /// without leaving a tunnel behind.
    pub async fn start(&self, target_url: &str) -> Result<String> {
        let _starting = self.start_lock.lock().await;

        let stale = match self.session.lock().await.as_ref() {
            Some(session) => match &session.public_url {
                Some(url) => return Ok(url.clone()),
                None => true,
            },
            None => false,
        };
        if stale {
            self.stop().await;
        }

        let stopped = self.current_stop_token();

        self.wait_for_target(target_url, &stopped).await?;

        let binary = match &self.binary_override {
            Some(binary) => binary.clone(),
            None => tokio::select! {
                _ = stopped.cancelled() => return Err(LauncherError::Aborted),
                binary = ensure_tunnel_binary(&self.install_dir, &self.client, &self.events) => binary?,
            },
        };

        let mut cmd = Command::new(&binary);
        cmd.args(["tunnel", "--url", target_url, "--no-autoupdate"]);

        let (url_tx, url_rx) = oneshot::channel();
        {
            let mut slot = self.session.lock().await;

            // stop() cancels before it takes the slot, so checking under the
            // slot lock means a spawned tunnel is always seen by that stop()
            if stopped.is_cancelled() {
                log::info!("Tunnel start to {} cancelled", target_url);
                return Err(LauncherError::Aborted);
            }

            let (child, lines) = spawn_with_output(cmd).map_err(|e| {
                LauncherError::Tunnel(TunnelFailure::Unavailable(format!(
                    "failed to spawn {}: {}",
                    binary.display(),
                    e
                )))
            })?;
            log::info!("Started tunnel to {} (pid {:?})", target_url, child.id());

            let id = Uuid::new_v4();
            let (stop_tx, stop_rx) = oneshot::channel();
            let monitor = TunnelMonitor {
                id,
                url_tx: Some(url_tx),
                session: self.session.clone(),
                events: self.events.clone(),
                tail: VecDeque::with_capacity(TAIL_LINES),
            };
            let task = tokio::spawn(monitor.run(child, lines, stop_rx));

            // The monitor can't touch the slot until this guard drops
            *slot = Some(TunnelSession {
                id,
                public_url: None,
                stop_tx: Some(stop_tx),
                task,
            });
        }

        let waited = tokio::select! {
            _ = stopped.cancelled() => return Err(LauncherError::Aborted),
            waited = tokio::time::timeout(self.url_timeout, url_rx) => waited,
        };

        let failure = match waited {
            Ok(Ok(Ok(url))) => return Ok(url),
            Ok(Ok(Err(failure))) => failure,
            Ok(Err(_)) => TunnelFailure::Exited("tunnel monitor ended".to_string()),
            Err(_) => TunnelFailure::TimedOut,
        };

        log::error!("Tunnel failed: {}", failure);
        self.stop().await;
        Err(LauncherError::Tunnel(failure))
    }

    /// Kill the tunnel (if any) and announce that no URL is active
    pub async fn stop(&self) {
        self.cancel_pending_start();
        let session = self.session.lock().await.take();

        if let Some(mut session) = session {
            if let Some(tx) = session.stop_tx.take() {
                let _ = tx.send(());
            }
            if tokio::time::timeout(KILL_TIMEOUT * 2, &mut session.task).await.is_err() {
                session.task.abort();
            }
            log::info!("Tunnel stopped");
        }

        self.events.emit(LauncherEvent::TunnelUrlChanged { url: None });
    }

    /// Poll `target_url` with HEAD requests until anything answers
    async fn wait_for_target(&self, target_url: &str, stopped: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + self.target_timeout;

        loop {
            let reply = tokio::select! {
                _ = stopped.cancelled() => return Err(LauncherError::Aborted),
                reply = self.client.head(target_url).timeout(CHECK_TIMEOUT).send() => reply,
            };

            match reply {
                Ok(response) => {
                    log::debug!("Tunnel target {} answered {}", target_url, response.status());
                    return Ok(());
                }
                Err(e) => log::debug!("Tunnel target {} not ready: {}", target_url, e),
            }

            if Instant::now() + CHECK_INTERVAL >= deadline {
                log::warn!("Tunnel target {} did not answer within {:?}", target_url, self.target_timeout);
                return Err(LauncherError::Tunnel(TunnelFailure::TargetUnreachable));
            }
            tokio::select! {
                _ = stopped.cancelled() => return Err(LauncherError::Aborted),
                _ = tokio::time::sleep(CHECK_INTERVAL) => {}
            }
        }
    }
}

struct TunnelMonitor {
    id: Uuid,
    url_tx: Option<oneshot::Sender<std::result::Result<String, TunnelFailure>>>,
    session: SessionSlot,
    events: EventBus,
    tail: VecDeque<String>,
}

impl TunnelMonitor {
    async fn run(mut self, mut child: Child, mut lines: mpsc::Receiver<OutputLine>, mut stop_rx: oneshot::Receiver<()>) {
        let status = loop {
            tokio::select! {
                Some(line) = lines.recv() => self.on_line(line.text).await,
                _ = &mut stop_rx => break terminate(&mut child, KILL_TIMEOUT).await,
                status = child.wait() => break status,
            }
        };

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while let Ok(Some(line)) = tokio::time::timeout_at(deadline, lines.recv()).await {
            self.on_line(line.text).await;
        }

        let mut detail = match status {
            Ok(status) => status.to_string(),
            Err(e) => e.to_string(),
        };
        if !self.tail.is_empty() {
            detail.push('\n');
            detail.push_str(&self.tail.iter().cloned().collect::<Vec<_>>().join("\n"));
        }

        if let Some(tx) = self.url_tx.take() {
            let _ = tx.send(Err(TunnelFailure::Exited(detail)));
        }

        let mut slot = self.session.lock().await;
        if slot.as_ref().is_some_and(|s| s.id == self.id) {
            // Exited on its own; stop() already cleared the slot otherwise
            slot.take();
            drop(slot);
            log::warn!("Tunnel process exited");
            self.events.emit(LauncherEvent::TunnelUrlChanged { url: None });
        }
    }

    async fn on_line(&mut self, line: String) {
        log::debug!("[tunnel] {}", line);

        if let Some(tx) = self.url_tx.take() {
            if let Some(url) = find_public_url(&line) {
                if let Some(session) = self.session.lock().await.as_mut().filter(|s| s.id == self.id) {
                    session.public_url = Some(url.clone());
                }
                log::info!("Tunnel URL: {}", url);
                self.events.emit(LauncherEvent::TunnelUrlChanged { url: Some(url.clone()) });
                let _ = tx.send(Ok(url));
            } else if is_rate_limited(&line) {
                let _ = tx.send(Err(TunnelFailure::RateLimited));
            } else {
                self.url_tx = Some(tx);
            }
        }

        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{write_script, TestServer};
    use hyper::{Body, Response};
    use tempfile::{tempdir, TempDir};

    const URL_BANNER: &str = "echo 'INF |  https://quiet-lake-1234.trycloudflare.com  |' >&2";

    fn manager(dir: &TempDir, script: &str) -> TunnelManager {
        let binary = dir.path().join("fake-cloudflared");
        write_script(&binary, script);
        TunnelManager::new(
            dir.path().to_path_buf(),
            EventBus::new(),
            Duration::from_secs(2),
            Duration::from_secs(5),
        )
        .unwrap()
        .with_binary(binary)
    }

    #[tokio::test]
    async fn test_announced_url_is_returned_and_reused() {
        let target = TestServer::start(|_| Response::new(Body::empty())).await;
        let dir = tempdir().unwrap();
        let tunnel = manager(&dir, &format!("echo 'INF Requesting new quick Tunnel'\n{}\nsleep 30", URL_BANNER));
        let mut events = tunnel.events.subscribe();

        let url = tunnel.start(&target.url("/")).await.unwrap();
        assert_eq!(url, "https://quiet-lake-1234.trycloudflare.com");
        assert!(matches!(
            events.recv().await.unwrap(),
            LauncherEvent::TunnelUrlChanged { url: Some(_) }
        ));

        // Second start reuses the running tunnel without probing again
        assert_eq!(tunnel.start(&target.url("/")).await.unwrap(), url);
        assert_eq!(target.hits(), 1);

        tunnel.stop().await;
        assert_eq!(tunnel.public_url().await, None);
        assert!(matches!(
            events.recv().await.unwrap(),
            LauncherEvent::TunnelUrlChanged { url: None }
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_is_distinguished() {
        let target = TestServer::start(|_| Response::new(Body::empty())).await;
        let dir = tempdir().unwrap();
        let tunnel = manager(&dir, "echo 'ERR status_code=\"429 Too Many Requests\"' >&2\nsleep 30");

        let err = tunnel.start(&target.url("/")).await.unwrap_err();
        assert!(matches!(err, LauncherError::Tunnel(TunnelFailure::RateLimited)));
        assert_eq!(tunnel.public_url().await, None);
    }

    #[tokio::test]
    async fn test_unreachable_target_refuses_to_start() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let dir = tempdir().unwrap();
        let tunnel = manager(&dir, URL_BANNER);

        let err = tunnel
            .start(&format!("http://127.0.0.1:{}", port))
            .await
            .unwrap_err();
        assert!(matches!(err, LauncherError::Tunnel(TunnelFailure::TargetUnreachable)));
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_start() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let dir = tempdir().unwrap();
        let spawned = dir.path().join("spawned");
        let binary = dir.path().join("fake-cloudflared");
        write_script(&binary, &format!("touch '{}'\n{}\nsleep 30", spawned.display(), URL_BANNER));
        let tunnel = Arc::new(
            TunnelManager::new(
                dir.path().to_path_buf(),
                EventBus::new(),
                Duration::from_secs(30),
                Duration::from_secs(5),
            )
            .unwrap()
            .with_binary(binary),
        );

        let pending = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.start(&format!("http://127.0.0.1:{}", port)).await })
        };
        tokio::time::sleep(Duration::from_millis(700)).await;
        tunnel.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().is_aborted());
        assert_eq!(tunnel.public_url().await, None);
        assert!(!spawned.exists());

        // A later start is not affected by the earlier stop
        let target = TestServer::start(|_| Response::new(Body::empty())).await;
        assert!(tunnel.start(&target.url("/")).await.is_ok());
        tunnel.stop().await;
    }

    #[tokio::test]
    async fn test_early_exit_is_reported() {
        let target = TestServer::start(|_| Response::new(Body::empty())).await;
        let dir = tempdir().unwrap();
        let tunnel = manager(&dir, "echo 'ERR failed to connect'\nexit 2");

        match tunnel.start(&target.url("/")).await.unwrap_err() {
            LauncherError::Tunnel(TunnelFailure::Exited(detail)) => assert!(detail.contains("failed to connect")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_tunnel_exit_resets_url() {
        let target = TestServer::start(|_| Response::new(Body::empty())).await;
        let dir = tempdir().unwrap();
        let tunnel = manager(&dir, &format!("{}\nsleep 1\nexit 1", URL_BANNER));
        let mut events = tunnel.events.subscribe();

        tunnel.start(&target.url("/")).await.unwrap();

        let reset = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let LauncherEvent::TunnelUrlChanged { url: None } = events.recv().await.unwrap() {
                    break;
                }
            }
        })
        .await;
        assert!(reset.is_ok());
        assert_eq!(tunnel.public_url().await, None);
    }
}
