//! Process Launcher
//!
//! Runs the current backend with resolved arguments, detects readiness
//! from its output and classifies how it ends.
//!
//! Module structure:
//! - session.rs: pure launch state machine
//! - output_filter.rs: readiness marker and noisy-line patterns
//! - process.rs: child spawning, output readers, supervisor task
//! - prelaunch.rs: pre-launch shell commands
//! - frontend.rs: companion frontend contract
//! - controller.rs: Launcher (launch / stop orchestration)

pub mod controller;
pub mod frontend;
pub mod output_filter;
pub mod prelaunch;
pub mod process;
pub mod session;

pub use controller::{backend_address, LaunchOptions, Launcher};
pub use frontend::{Frontend, BUILTIN_FRONTEND};
pub use session::{LaunchState, SessionMachine};
