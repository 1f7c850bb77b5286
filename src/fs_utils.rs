//! Filesystem helpers shared by every component

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

/// Async existence check that treats permission errors as "missing"
pub async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Read and parse a JSON file; `Ok(None)` if the file does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Write JSON through a sibling temp file and rename it into place
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

/// Remove a directory tree, retrying with exponential backoff.
///
/// A process that just exited can hold file locks for a moment on Windows,
/// so the first attempts may fail transiently. A missing directory counts
/// as success.
pub async fn remove_dir_with_retry(path: &Path, attempts: u32, initial_delay: Duration) -> std::io::Result<()> {
    let mut delay = initial_delay;
    let mut attempt = 1;

    loop {
        match fs::remove_dir_all(path).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                log::warn!(
                    "Failed to remove {} (attempt {}/{}): {}. Retrying in {:?}",
                    path.display(),
                    attempt,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

/// Total size of all regular files below `path`
pub fn dir_size(path: &Path) -> u64 {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(ft) if ft.is_dir() => dir_size(&entry.path()),
            Ok(_) => entry.metadata().map(|m| m.len()).unwrap_or(0),
            Err(_) => 0,
        })
        .sum()
}

/// Set the owner/group/other executable bits (no-op on Windows)
#[cfg(unix)]
pub async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path).await?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms).await
}

#[cfg(not(unix))]
pub async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_json_roundtrip_and_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let missing: Option<HashMap<String, String>> = read_json(&path).unwrap();
        assert!(missing.is_none());

        let mut map = HashMap::new();
        map.insert("currentBackend".to_string(), "/opt/kcpp".to_string());
        write_json_atomic(&path, &map).unwrap();

        let loaded: HashMap<String, String> = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, map);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_remove_dir_missing_is_ok() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("gone");
        remove_dir_with_retry(&target, 3, Duration::from_millis(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_dir_recursive() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("backend-1.0");
        std::fs::create_dir_all(target.join("lib")).unwrap();
        std::fs::write(target.join("lib").join("a.so"), b"1234").unwrap();

        assert_eq!(dir_size(&target), 4);
        remove_dir_with_retry(&target, 3, Duration::from_millis(1)).await.unwrap();
        assert!(!path_exists(&target).await);
    }
}
