//! Backend record types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// An installed copy of the inference binary, identified by its launcher path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    /// Launcher executable location
    pub path: PathBuf,
    /// Name of the folder containing the launcher
    pub folder_name: String,
    /// Folder-derived version, or the binary-reported one if the folder has none
    pub version: String,
    /// Binary-reported version when it disagrees with `version`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_version: Option<String>,
    /// Total size of the backend folder
    pub size_bytes: u64,
}
