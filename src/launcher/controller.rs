//! Launcher - owns the single backend session and everything tied to it

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::frontend::{Frontend, BUILTIN_FRONTEND};
use super::prelaunch::PreLaunchCommands;
use super::process::{spawn_backend, SessionHandle, SupervisorOptions};
use super::session::LaunchState;
use crate::backend::BackendRegistry;
use crate::config::{LauncherConfig, DEFAULT_BACKEND_HOST, DEFAULT_BACKEND_PORT};
use crate::error::{LauncherError, Result};
use crate::events::EventBus;
use crate::fs_utils::path_exists;
use crate::model::{resolve_launch_args, ModelResolver};
use crate::proxy::LocalProxy;
use crate::tunnel::TunnelManager;

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Backend command line, possibly containing remote model URLs
    pub args: Vec<String>,
    /// Registered frontend to start once the backend is ready
    pub frontend: String,
    /// Shell commands started alongside the backend
    pub pre_launch_commands: Vec<String>,
    /// Expose the frontend through a public tunnel once ready
    pub tunnel: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            frontend: BUILTIN_FRONTEND.to_string(),
            pre_launch_commands: Vec::new(),
            tunnel: false,
        }
    }
}

pub struct Launcher {
    config: LauncherConfig,
    registry: Arc<BackendRegistry>,
    resolver: Arc<ModelResolver>,
    proxy: Arc<LocalProxy>,
    tunnel: Arc<TunnelManager>,
    events: EventBus,
    frontends: RwLock<HashMap<String, Arc<dyn Frontend>>>,
    active_frontend: Mutex<Option<Arc<dyn Frontend>>>,
    pre_launch: PreLaunchCommands,
    session: Mutex<Option<SessionHandle>>,
    /// Download scope of the launch in progress
    download_scope: std::sync::Mutex<CancellationToken>,
    /// Serializes `launch` calls
    launch_lock: Mutex<()>,
}

impl Launcher {
    pub fn new(
        config: LauncherConfig,
        registry: Arc<BackendRegistry>,
        resolver: Arc<ModelResolver>,
        proxy: Arc<LocalProxy>,
        tunnel: Arc<TunnelManager>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            registry,
            resolver,
            proxy,
            tunnel,
            events,
            frontends: RwLock::new(HashMap::new()),
            active_frontend: Mutex::new(None),
            pre_launch: PreLaunchCommands::new(),
            session: Mutex::new(None),
            download_scope: std::sync::Mutex::new(CancellationToken::new()),
            launch_lock: Mutex::new(()),
        }
    }

    pub async fn register_frontend(&self, frontend: Arc<dyn Frontend>) {
        let name = frontend.name().to_string();
        log::debug!("Registered frontend '{}'", name);
        self.frontends.write().await.insert(name, frontend);
    }

    pub async fn state(&self) -> LaunchState {
        match self.session.lock().await.as_ref() {
            Some(handle) => handle.state(),
            None => LaunchState::Idle,
        }
    }

    /// URL of the local proxy, which fronts the backend
    pub async fn proxy_url(&self) -> String {
        let port = self
            .proxy
            .local_addr()
            .await
            .map(|a| a.port())
            .unwrap_or(self.config.proxy_port);
        format!("http://127.0.0.1:{}", port)
    }

    fn new_download_scope(&self) -> CancellationToken {
        let scope = CancellationToken::new();
        match self.download_scope.lock() {
            Ok(mut guard) => *guard = scope.clone(),
            Err(poisoned) => *poisoned.into_inner() = scope.clone(),
        }
        scope
    }

    fn cancel_download_scope(&self) {
        match self.download_scope.lock() {
            Ok(guard) => guard.cancel(),
            Err(poisoned) => poisoned.into_inner().cancel(),
        }
    }

    /// Start the current backend and wait until it reports readiness.
    ///
    /// Any existing session is fully stopped first. Returns the backend pid.
    pub async fn launch(&self, options: LaunchOptions) -> Result<u32> {
        let _launching = self.launch_lock.lock().await;

        self.stop().await;

        let scope = self.new_download_scope();

        match self.start_session(&options, &scope).await {
            Ok(pid) => {
                self.after_ready(&options, &scope).await;
                Ok(pid)
            }
            Err(e) => {
                if !e.is_aborted() {
                    log::error!("Launch failed: {}", e);
                }
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn start_session(&self, options: &LaunchOptions, scope: &CancellationToken) -> Result<u32> {
        self.pre_launch
            .spawn_all(&options.pre_launch_commands, &self.events)
            .await;

        let backend = self
            .registry
            .get_current()
            .await?
            .ok_or(LauncherError::NoBackendConfigured)?;

        if !path_exists(&backend.path).await {
            return Err(LauncherError::BackendMissing(backend.path));
        }

        log::info!("Launching backend {} ({})", backend.path.display(), backend.version);

        let args = resolve_launch_args(&self.resolver, &options.args, scope).await?;
        if scope.is_cancelled() {
            return Err(LauncherError::Aborted);
        }

        let (host, port) = backend_address(&args);
        self.proxy.start(&host, port).await?;

        let (handle, ready) = spawn_backend(
            &backend.path,
            &args,
            SupervisorOptions {
                events: self.events.clone(),
                debug_output: self.config.debug_output,
                announce_ready: options.frontend == BUILTIN_FRONTEND,
                stop_timeout: self.config.stop_timeout,
            },
        )?;
        *self.session.lock().await = Some(handle);

        // stop() may have run between resolving arguments and storing the session
        if scope.is_cancelled() {
            return Err(LauncherError::Aborted);
        }

        match ready.await {
            Ok(result) => result,
            Err(_) => Err(LauncherError::LaunchFailed(
                "backend supervisor ended unexpectedly".to_string(),
            )),
        }
    }

    /// Fire-and-forget frontend and tunnel startup.
    ///
    /// Skipped once `stop()` has cancelled the launch scope; `stop()` cancels
    /// before clearing the frontend slot, so a frontend stored here is
    /// always seen by it.
    async fn after_ready(&self, options: &LaunchOptions, scope: &CancellationToken) {
        if scope.is_cancelled() {
            log::info!("Launch was stopped before the frontend could start");
            return;
        }

        let proxy_url = self.proxy_url().await;
        let mut tunnel_target = proxy_url.clone();

        if options.frontend != BUILTIN_FRONTEND {
            let frontend = self.frontends.read().await.get(&options.frontend).cloned();
            match frontend {
                Some(frontend) => {
                    if let Some(port) = frontend.port() {
                        tunnel_target = format!("http://127.0.0.1:{}", port);
                    }
                    {
                        let mut active = self.active_frontend.lock().await;
                        if scope.is_cancelled() {
                            return;
                        }
                        *active = Some(frontend.clone());
                    }

                    tokio::spawn(async move {
                        if let Err(e) = frontend.start(&proxy_url).await {
                            log::error!("Frontend '{}' failed to start: {:#}", frontend.name(), e);
                        }
                    });
                }
                None => log::warn!("Unknown frontend '{}'; only the built-in UI is available", options.frontend),
            }
        }

        if options.tunnel && !scope.is_cancelled() {
            let tunnel = self.tunnel.clone();
            let scope = scope.clone();
            tokio::spawn(async move {
                // A stop racing this task may have run tunnel.stop() already
                tokio::select! {
                    _ = scope.cancelled() => tunnel.stop().await,
                    started = tunnel.start(&tunnel_target) => match started {
                        Ok(url) => log::info!("Tunnel available at {}", url),
                        Err(e) if e.is_aborted() => log::info!("Tunnel start cancelled"),
                        Err(e) => log::error!("Tunnel failed: {}", e),
                    },
                }
            });
        }
    }

    /// Tear down the session: downloads, tunnel, proxy, frontend,
    /// pre-launch commands, then the backend itself
    pub async fn stop(&self) {
        let session = self.session.lock().await.take();

        self.cancel_download_scope();
        self.resolver.abort_all();

        self.tunnel.stop().await;
        self.proxy.stop().await;

        if let Some(frontend) = self.active_frontend.lock().await.take() {
            if let Err(e) = frontend.stop().await {
                log::warn!("Frontend '{}' failed to stop: {:#}", frontend.name(), e);
            }
        }

        self.pre_launch.kill_all(self.config.stop_timeout).await;

        if let Some(handle) = session {
            handle.stop().await;
        }
    }
}

/// Host and port the backend will listen on, from `--host` / `--port`
pub fn backend_address(args: &[String]) -> (String, u16) {
    let mut host = DEFAULT_BACKEND_HOST.to_string();
    let mut port = DEFAULT_BACKEND_PORT;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag, Some(value.to_string())),
            None => (arg.as_str(), None),
        };

        match flag {
            "--host" => {
                if let Some(value) = inline.or_else(|| iter.next().cloned()) {
                    if !value.is_empty() && value != "0.0.0.0" && value != "::" {
                        host = value;
                    }
                }
            }
            "--port" => {
                if let Some(value) = inline.or_else(|| iter.next().cloned()) {
                    match value.parse() {
                        Ok(p) => port = p,
                        Err(_) => log::warn!("Ignoring invalid --port value '{}'", value),
                    }
                }
            }
            _ => {}
        }
    }

    (host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_backend_address_defaults() {
        assert_eq!(
            backend_address(&strings(&["--model", "m.gguf"])),
            ("127.0.0.1".to_string(), 5001)
        );
    }

    #[test]
    fn test_backend_address_from_args() {
        assert_eq!(
            backend_address(&strings(&["--host", "192.168.1.5", "--port=6000"])),
            ("192.168.1.5".to_string(), 6000)
        );
        // Wildcard binds are reached through loopback
        assert_eq!(
            backend_address(&strings(&["--host", "0.0.0.0", "--port", "7000"])),
            ("127.0.0.1".to_string(), 7000)
        );
    }
}
