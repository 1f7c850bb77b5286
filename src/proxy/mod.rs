//! Local Proxy
//!
//! A loopback HTTP reverse proxy in front of the backend. Clients (and
//! tunnels) always talk to the proxy port, which stays stable while the
//! backend behind it is restarted.
//!
//! Module structure:
//! - server.rs: LocalProxy (listener lifecycle, request forwarding)
//! - rewrite.rs: JSON body branding rewrite

pub mod rewrite;
pub mod server;

pub use server::{LocalProxy, ProxyBinding};
