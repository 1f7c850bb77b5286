//! Release asset descriptors

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A downloadable packed backend release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadAsset {
    /// Asset file name, e.g. `koboldcpp-linux-x64` or `koboldcpp.exe`
    pub name: String,
    pub source_url: String,
    /// Used when the server does not declare a content length; 0 = unknown
    #[serde(default)]
    pub expected_size_bytes: u64,
    pub version: String,
}

impl DownloadAsset {
    /// Asset name without a trailing `.exe`
    pub fn base_name(&self) -> &str {
        self.name.strip_suffix(".exe").unwrap_or(&self.name)
    }

    /// Folder the asset unpacks into: `<baseName>-<version>`
    pub fn folder_name(&self) -> String {
        format!("{}-{}", self.base_name(), self.version)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Replacing an existing install rather than adding one
    pub is_update: bool,
    /// The backend being replaced was the current one
    pub was_current: bool,
    /// Launcher of the backend being replaced, removed after success
    pub old_backend_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_name_drops_exe() {
        let asset = DownloadAsset {
            name: "koboldcpp_cu12.exe".to_string(),
            source_url: "https://example.invalid/koboldcpp_cu12.exe".to_string(),
            expected_size_bytes: 0,
            version: "1.98.1".to_string(),
        };
        assert_eq!(asset.base_name(), "koboldcpp_cu12");
        assert_eq!(asset.folder_name(), "koboldcpp_cu12-1.98.1");
    }
}
