use crate::HarnessError;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const STRING_EXT: &str = "txt";
const BUNDLE_EXT: &str = "json";

/// Durable key/value state for one run, one file per key under the run's
/// working directory. Separate instances pointed at the same directory see the
/// same values, which is what lets a later invocation resume after skipping.
#[derive(Debug, Clone)]
pub struct StageStore {
    run_dir: PathBuf,
}

impl StageStore {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn save_string(&self, key: &str, value: &str) -> Result<(), HarnessError> {
        let path = self.key_path(key, STRING_EXT)?;
        atomic_write_bytes(&path, value.as_bytes())?;
        tracing::debug!(key, path = %path.display(), "saved string state");
        Ok(())
    }

    pub fn load_string(&self, key: &str) -> Result<String, HarnessError> {
        let path = self.key_path(key, STRING_EXT)?;
        let bytes = self.read_existing(key, &path)?;
        String::from_utf8(bytes).map_err(|e| HarnessError::CorruptState {
            run_dir: self.run_dir.clone(),
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    pub fn save_bundle<T: Serialize>(&self, key: &str, value: &T) -> Result<(), HarnessError> {
        let path = self.key_path(key, BUNDLE_EXT)?;
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| HarnessError::CorruptState {
            run_dir: self.run_dir.clone(),
            key: key.to_string(),
            message: e.to_string(),
        })?;
        atomic_write_bytes(&path, &bytes)?;
        tracing::debug!(key, path = %path.display(), "saved option bundle");
        Ok(())
    }

    pub fn load_bundle<T: DeserializeOwned>(&self, key: &str) -> Result<T, HarnessError> {
        let path = self.key_path(key, BUNDLE_EXT)?;
        let bytes = self.read_existing(key, &path)?;
        serde_json::from_slice(&bytes).map_err(|e| HarnessError::CorruptState {
            run_dir: self.run_dir.clone(),
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Keys persisted so far, sorted. Empty when the run directory is absent.
    pub fn keys(&self) -> Result<Vec<String>, HarnessError> {
        if !self.run_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.run_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let ext = path.extension().and_then(|s| s.to_str());
            if ext != Some(STRING_EXT) && ext != Some(BUNDLE_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn key_path(&self, key: &str, ext: &str) -> Result<PathBuf, HarnessError> {
        validate_key(key)?;
        Ok(self.run_dir.join(format!("{}.{}", key, ext)))
    }

    fn read_existing(&self, key: &str, path: &Path) -> Result<Vec<u8>, HarnessError> {
        if !self.run_dir.is_dir() {
            return Err(HarnessError::MissingState {
                run_dir: self.run_dir.clone(),
                key: key.to_string(),
                reason: "run directory does not exist".to_string(),
            });
        }
        match fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(HarnessError::MissingState {
                    run_dir: self.run_dir.clone(),
                    key: key.to_string(),
                    reason: "key was never saved".to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_key(key: &str) -> Result<(), HarnessError> {
    let ok = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c));
    if ok {
        Ok(())
    } else {
        Err(HarnessError::InvalidStateKey(key.to_string()))
    }
}

pub(crate) fn ensure_dir(path: &Path) -> Result<(), HarnessError> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<(), HarnessError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_root;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Bundle {
        module_dir: String,
        vars: BTreeMap<String, String>,
        no_color: bool,
    }

    #[test]
    fn string_survives_a_fresh_store_instance() {
        let root = temp_root("store_string");
        StageStore::new(&root)
            .save_string("region", "europe-west1")
            .expect("save");
        let loaded = StageStore::new(&root).load_string("region").expect("load");
        assert_eq!(loaded, "europe-west1");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn bundle_loaded_by_second_instance_equals_saved() {
        let root = temp_root("store_bundle");
        let bundle = Bundle {
            module_dir: "/tmp/copy/gke-basic".to_string(),
            vars: BTreeMap::from([
                ("cluster_name".to_string(), "gke-abc123".to_string()),
                ("region".to_string(), "us-east1".to_string()),
            ]),
            no_color: true,
        };
        // process A
        StageStore::new(&root)
            .save_bundle("provision_options", &bundle)
            .expect("save");
        // process B
        let loaded: Bundle = StageStore::new(&root)
            .load_bundle("provision_options")
            .expect("load");
        assert_eq!(loaded, bundle);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn load_without_run_dir_is_missing_state() {
        let root = temp_root("store_no_dir").join("never_created");
        let err = StageStore::new(&root)
            .load_string("project")
            .expect_err("should fail");
        assert!(matches!(err, HarnessError::MissingState { .. }), "{}", err);
    }

    #[test]
    fn load_of_unsaved_key_is_missing_state() {
        let root = temp_root("store_unsaved");
        let store = StageStore::new(&root);
        store.save_string("project", "p").expect("save");
        let err = store
            .load_bundle::<Bundle>("provision_options")
            .expect_err("should fail");
        match err {
            HarnessError::MissingState { key, .. } => assert_eq!(key, "provision_options"),
            other => panic!("unexpected error: {}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn garbage_bundle_is_corrupt_state() {
        let root = temp_root("store_corrupt");
        fs::write(root.join("access_options.json"), b"{not json").expect("write");
        let err = StageStore::new(&root)
            .load_bundle::<Bundle>("access_options")
            .expect_err("should fail");
        assert!(matches!(err, HarnessError::CorruptState { .. }), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn keys_with_path_separators_are_rejected() {
        let store = StageStore::new(temp_root("store_keys"));
        assert!(matches!(
            store.save_string("../escape", "x"),
            Err(HarnessError::InvalidStateKey(_))
        ));
        assert!(matches!(
            store.save_string("", "x"),
            Err(HarnessError::InvalidStateKey(_))
        ));
        let _ = fs::remove_dir_all(store.run_dir());
    }

    #[test]
    fn keys_lists_strings_and_bundles_once() {
        let root = temp_root("store_list");
        let store = StageStore::new(&root);
        store.save_string("unique_id", "abc123").expect("save");
        store.save_string("region", "us-east1").expect("save");
        store
            .save_bundle("region", &BTreeMap::<String, String>::new())
            .expect("save");
        assert_eq!(store.keys().expect("keys"), vec!["region", "unique_id"]);
        let _ = fs::remove_dir_all(root);
    }
}
