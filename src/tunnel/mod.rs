//! Tunnel Manager
//!
//! Publishes the local proxy (or a frontend port) through a Cloudflare
//! quick tunnel. At most one tunnel runs at a time.
//!
//! Module structure:
//! - binary.rs: locating or downloading the `cloudflared` binary
//! - output.rs: public URL and rate-limit detection in tunnel output
//! - manager.rs: TunnelManager (start, stop, exit monitoring)

pub mod binary;
pub mod manager;
pub mod output;

pub use manager::TunnelManager;
