//! Release Installer
//!
//! Fetches packed backend releases, unpacks them into versioned folders
//! under the install directory and hands the result to the registry.
//!
//! Module structure:
//! - types.rs: DownloadAsset, InstallOptions
//! - catalog.rs: latest-release lookup and update checks
//! - installer.rs: ReleaseInstaller (download, unpack, select, retire)

pub mod catalog;
pub mod installer;
pub mod types;

pub use catalog::{
    assets_for_platform, fetch_latest_release, is_update_available, matching_asset, GithubRelease,
    DEFAULT_RELEASES_API,
};
pub use installer::ReleaseInstaller;
pub use types::{DownloadAsset, InstallOptions};
