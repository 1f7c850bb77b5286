//! LocalProxy - loopback reverse proxy to the backend

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::header::{HeaderName, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::rewrite::{is_json_content_type, rewrite_json_body};
use crate::error::{LauncherError, Result};

/// Upper bound on draining open connections during `stop`
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Where proxied requests go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyBinding {
    pub target_host: String,
    pub target_port: u16,
}

impl ProxyBinding {
    fn url_for(&self, path_and_query: &str) -> String {
        // IPv6 literals need brackets inside a URL authority
        if self.target_host.contains(':') && !self.target_host.starts_with('[') {
            format!("http://[{}]:{}{}", self.target_host, self.target_port, path_and_query)
        } else {
            format!("http://{}:{}{}", self.target_host, self.target_port, path_and_query)
        }
    }
}

struct RunningProxy {
    binding: ProxyBinding,
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct LocalProxy {
    listen_port: u16,
    client: reqwest::Client,
    running: Mutex<Option<RunningProxy>>,
}

impl LocalProxy {
    /// Proxy that will listen on `127.0.0.1:<listen_port>` (0 = any free port)
    pub fn new(listen_port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| LauncherError::Proxy(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            listen_port,
            client,
            running: Mutex::new(None),
        })
    }

    /// Start listening and forwarding to `target_host:target_port`.
    ///
    /// Idempotent: while already listening, the existing binding is kept
    /// and its address returned.
    pub async fn start(&self, target_host: &str, target_port: u16) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;

        if let Some(existing) = running.as_ref() {
            log::debug!(
                "Proxy already listening on {} -> {}:{}",
                existing.local_addr,
                existing.binding.target_host,
                existing.binding.target_port
            );
            return Ok(existing.local_addr);
        }

        let binding = ProxyBinding {
            target_host: target_host.to_string(),
            target_port,
        };

        let addr = SocketAddr::from(([127, 0, 0, 1], self.listen_port));
        let shared_binding = Arc::new(binding.clone());
        let client = self.client.clone();

        let make_svc = make_service_fn(move |_conn| {
            let binding = shared_binding.clone();
            let client = client.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| forward(req, client.clone(), binding.clone())))
            }
        });

        let server = Server::try_bind(&addr)
            .map_err(|e| LauncherError::Proxy(format!("Failed to bind {}: {}", addr, e)))?
            .serve(make_svc);
        let local_addr = server.local_addr();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let graceful = server.with_graceful_shutdown(async {
            shutdown_rx.await.ok();
        });

        let task = tokio::spawn(async move {
            if let Err(e) = graceful.await {
                log::error!("Proxy server error: {}", e);
            }
        });

        log::info!("Proxy listening on {} -> {}:{}", local_addr, target_host, target_port);

        *running = Some(RunningProxy {
            binding,
            local_addr,
            shutdown_tx,
            task,
        });

        Ok(local_addr)
    }

    /// Stop listening; a no-op when not running
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown_tx.send(());
        let mut task = running.task;

        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            log::debug!("Proxy connections still open after {:?}, closing them", SHUTDOWN_GRACE);
            task.abort();
        }

        log::info!("Proxy on {} stopped", running.local_addr);
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    pub async fn binding(&self) -> Option<ProxyBinding> {
        self.running.lock().await.as_ref().map(|r| r.binding.clone())
    }
}

/// Connection-scoped headers that must not be forwarded
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

async fn forward(
    req: Request<Body>,
    client: reqwest::Client,
    binding: Arc<ProxyBinding>,
) -> std::result::Result<Response<Body>, Infallible> {
    match forward_request(req, &client, &binding).await {
        Ok(response) => Ok(response),
        Err(e) => {
            log::warn!("Proxy upstream error: {:#}", e);
            let mut response = Response::new(Body::from(format!("Bad Gateway: {:#}", e)));
            *response.status_mut() = StatusCode::BAD_GATEWAY;
            Ok(response)
        }
    }
}

async fn forward_request(
    req: Request<Body>,
    client: &reqwest::Client,
    binding: &ProxyBinding,
) -> anyhow::Result<Response<Body>> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let url = binding.url_for(path_and_query);

    let body = hyper::body::to_bytes(body).await?;

    let mut upstream_req = client.request(parts.method, &url);
    for (name, value) in parts.headers.iter() {
        if name == HOST || is_hop_by_hop(name) {
            continue;
        }
        upstream_req = upstream_req.header(name, value);
    }

    let upstream = upstream_req.body(body).send().await?;

    let status = upstream.status();
    let headers = upstream.headers().clone();

    let rewrite = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(is_json_content_type)
        .unwrap_or(false)
        && !headers.contains_key(CONTENT_ENCODING);

    let mut response = Response::builder().status(status);
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) || (rewrite && name == CONTENT_LENGTH) {
            continue;
        }
        response = response.header(name, value);
    }

    if rewrite {
        let rewritten = rewrite_json_body(upstream.bytes().await?);
        Ok(response
            .header(CONTENT_LENGTH, rewritten.len())
            .body(Body::from(rewritten))?)
    } else {
        Ok(response.body(Body::wrap_stream(upstream.bytes_stream()))?)
    }
}
