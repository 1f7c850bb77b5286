//! Companion frontend contract
//!
//! Frontends (chat UIs, image-generation UIs) are external collaborators:
//! the launcher only starts them after the backend is ready, hands them
//! the proxy URL, and stops them during teardown.

use async_trait::async_trait;

/// Frontend served by the backend itself; needs no separate process
pub const BUILTIN_FRONTEND: &str = "koboldcpp";

#[async_trait]
pub trait Frontend: Send + Sync {
    /// Name used to select this frontend in `LaunchOptions`
    fn name(&self) -> &str;

    /// Port the frontend serves on, when it exposes its own.
    ///
    /// Tunnels target this port instead of the proxy when set.
    fn port(&self) -> Option<u16> {
        None
    }

    /// Start serving, talking to the backend at `target_url`
    async fn start(&self, target_url: &str) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;
}
