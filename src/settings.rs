// Settings store - persisted key/value configuration
//
// The UI owns most settings; the engine only needs a handful of keys
// (currently the selected backend). Values are stored as strings in a flat
// JSON object.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};

use crate::fs_utils::{read_json, write_json_atomic};

/// Key holding the Current Backend Pointer
pub const CURRENT_BACKEND_KEY: &str = "currentBackend";

/// Forward noisy backend output as well
pub const DEBUG_OUTPUT_KEY: &str = "debugOutput";

/// Persisted key/value store consumed by the engine
pub trait SettingsStore: Send + Sync {
    fn get_setting(&self, key: &str) -> Option<String>;

    /// Store a value; `None` removes the key
    fn set_setting(&self, key: &str, value: Option<&str>) -> Result<()>;

    fn get_bool_setting(&self, key: &str, default: bool) -> bool {
        match self.get_setting(key).as_deref() {
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            _ => default,
        }
    }
}

/// `SettingsStore` backed by a JSON file, written atomically on every change
pub struct JsonSettingsStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonSettingsStore {
    /// Load the store, starting empty if the file doesn't exist yet
    pub fn open(path: PathBuf) -> Result<Self> {
        let values: BTreeMap<String, String> = read_json(&path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?
            .unwrap_or_default();

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }
}

impl SettingsStore for JsonSettingsStore {
    fn get_setting(&self, key: &str) -> Option<String> {
        let guard = self.values.lock().ok()?;
        guard.get(key).cloned()
    }

    fn set_setting(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut guard = self.values.lock().map_err(|e| anyhow!("Lock error: {}", e))?;

        match value {
            Some(v) => guard.insert(key.to_string(), v.to_string()),
            None => guard.remove(key),
        };

        write_json_atomic(&self.path, &*guard)
            .with_context(|| format!("Failed to write settings file {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_set_and_get_setting() {
        let dir = tempdir().unwrap();
        let store = JsonSettingsStore::open(dir.path().join("settings.json")).unwrap();

        store.set_setting("test_key", Some("test_value")).unwrap();
        assert_eq!(store.get_setting("test_key"), Some("test_value".to_string()));

        store.set_setting("test_key", None).unwrap();
        assert_eq!(store.get_setting("test_key"), None);
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");

        {
            let store = JsonSettingsStore::open(path.clone()).unwrap();
            store.set_setting(CURRENT_BACKEND_KEY, Some("/opt/kcpp/koboldcpp")).unwrap();
            store.set_setting("debug", Some("true")).unwrap();
        }

        let store = JsonSettingsStore::open(path).unwrap();
        assert_eq!(
            store.get_setting(CURRENT_BACKEND_KEY),
            Some("/opt/kcpp/koboldcpp".to_string())
        );
        assert!(store.get_bool_setting("debug", false));
        assert!(store.get_bool_setting("missing", true));
    }
}
