//! Latest-release lookup and update checks

use std::cmp::Ordering;

use serde::Deserialize;

use super::types::DownloadAsset;
use crate::backend::{compare_versions, Backend};
use crate::error::{LauncherError, Result};
use crate::platform::release_asset_matches_platform;

/// GitHub API endpoint for the newest backend release
pub const DEFAULT_RELEASES_API: &str = "https://api.github.com/repos/LostRuins/koboldcpp/releases/latest";

#[derive(Debug, Clone, Deserialize)]
pub struct GithubRelease {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<GithubAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

impl GithubRelease {
    /// Tag without a leading `v`
    pub fn version(&self) -> &str {
        self.tag_name.trim_start_matches(['v', 'V'])
    }
}

pub async fn fetch_latest_release(client: &reqwest::Client, api_url: &str) -> Result<GithubRelease> {
    let response = client
        .get(api_url)
        .header(reqwest::header::ACCEPT, "application/vnd.github+json")
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(LauncherError::Download(format!(
            "{} returned HTTP {}",
            api_url,
            response.status()
        )));
    }

    let release: GithubRelease = response.json().await?;
    log::info!("Latest release is {} ({} assets)", release.tag_name, release.assets.len());
    Ok(release)
}

/// Assets of `release` that run on this OS
pub fn assets_for_platform(release: &GithubRelease) -> Vec<DownloadAsset> {
    release
        .assets
        .iter()
        .filter(|a| release_asset_matches_platform(&a.name))
        .map(|a| DownloadAsset {
            name: a.name.clone(),
            source_url: a.browser_download_url.clone(),
            expected_size_bytes: a.size,
            version: release.version().to_string(),
        })
        .collect()
}

pub fn is_update_available(current: &Backend, latest_version: &str) -> bool {
    compare_versions(latest_version, &current.version) == Ordering::Greater
}

/// The asset that replaces `current`: same base name as its folder
pub fn matching_asset<'a>(current: &Backend, assets: &'a [DownloadAsset]) -> Option<&'a DownloadAsset> {
    assets
        .iter()
        .filter(|a| {
            current
                .folder_name
                .strip_prefix(a.base_name())
                .is_some_and(|rest| rest.starts_with('-'))
        })
        .max_by_key(|a| a.base_name().len())
}
