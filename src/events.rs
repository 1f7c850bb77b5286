//! Notifications delivered to the presentation layer
//!
//! Components publish `LauncherEvent`s on a broadcast channel; a UI (or the
//! CLI) subscribes and renders them. Publishing never fails: with no
//! subscribers the event is dropped.

use serde::Serialize;
use tokio::sync::broadcast;

/// Download progress snapshot
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DownloadProgress {
    /// What is being downloaded (asset or file name)
    pub label: String,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub percent: f32,
    /// Average bytes per second since the download started
    pub speed_bps: f64,
    /// Estimated seconds remaining, when the total is known
    pub eta_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Details of an unexpected backend exit after it became ready
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CrashReport {
    pub pid: u32,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LauncherEvent {
    DownloadProgress(DownloadProgress),
    /// A filtered line of backend (or pre-launch command) output
    Output { stream: OutputStream, line: String },
    ServerReady { pid: u32 },
    Crashed(CrashReport),
    LaunchFailed { message: String },
    Stopped,
    TunnelUrlChanged { url: Option<String> },
    BackendsChanged,
    CurrentBackendChanged { path: Option<String> },
}

/// Cloneable publisher handle shared by all components
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LauncherEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LauncherEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: LauncherEvent) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(LauncherEvent::ServerReady { pid: 42 }).unwrap();
        assert_eq!(json["type"], "server-ready");
        assert_eq!(json["pid"], 42);

        let json = serde_json::to_value(LauncherEvent::TunnelUrlChanged { url: None }).unwrap();
        assert_eq!(json["type"], "tunnel-url-changed");
        assert!(json["url"].is_null());
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(LauncherEvent::Stopped);

        let mut rx = bus.subscribe();
        bus.emit(LauncherEvent::BackendsChanged);
        assert!(matches!(rx.recv().await.unwrap(), LauncherEvent::BackendsChanged));
    }
}
