use crate::store::StageStore;
use crate::HarnessError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

pub const KEY_MODULE_PATH: &str = "module_path";
pub const KEY_UNIQUE_ID: &str = "unique_id";
pub const KEY_PROJECT: &str = "project";
pub const KEY_REGION: &str = "region";
pub const KEY_PROVISION_OPTIONS: &str = "provision_options";
pub const KEY_PROVISION_OUTPUTS: &str = "provision_outputs";
pub const KEY_ACCESS_OPTIONS: &str = "access_options";

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_LEN: usize = 6;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Short identifier for naming cloud and cluster resources of one run.
pub fn unique_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seed = format!(
        "{}:{}:{}",
        std::process::id(),
        nanos,
        ID_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let digest = Sha256::digest(seed.as_bytes());
    digest
        .iter()
        .take(ID_LEN)
        .map(|b| ID_ALPHABET[(*b as usize) % ID_ALPHABET.len()] as char)
        .collect()
}

/// Deterministic pick from `candidates`, keyed by `seed`.
pub fn pick_region(candidates: &[String], seed: &str) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }
    let digest = hex::encode(Sha256::digest(seed.as_bytes()));
    let n = u64::from_str_radix(&digest[..12], 16).unwrap_or(0);
    Some(candidates[(n % candidates.len() as u64) as usize].clone())
}

/// Identity of one run. Assembled once during `build_options`, persisted as
/// plain strings, and reloaded by every later stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_dir: PathBuf,
    pub unique_id: String,
    pub project: String,
    pub region: String,
}

impl RunContext {
    pub fn save(&self, store: &StageStore) -> Result<(), HarnessError> {
        store.save_string(KEY_UNIQUE_ID, &self.unique_id)?;
        store.save_string(KEY_PROJECT, &self.project)?;
        store.save_string(KEY_REGION, &self.region)
    }

    pub fn load(store: &StageStore) -> Result<Self, HarnessError> {
        Ok(Self {
            run_dir: store.run_dir().to_path_buf(),
            unique_id: store.load_string(KEY_UNIQUE_ID)?,
            project: store.load_string(KEY_PROJECT)?,
            region: store.load_string(KEY_REGION)?,
        })
    }
}

/// Everything the provisioning tool needs for both apply and destroy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionOptions {
    pub module_dir: PathBuf,
    pub cluster_name: String,
    pub project: String,
    pub region: String,
    /// Module-specific variables; the harness does not interpret them.
    #[serde(default)]
    pub extra_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub no_color: bool,
}

impl ProvisionOptions {
    /// Full variable set in the order it is handed to the tool.
    pub fn vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("cluster_name".to_string(), self.cluster_name.clone());
        vars.insert("project".to_string(), self.project.clone());
        vars.insert("region".to_string(), self.region.clone());
        vars.insert("location".to_string(), self.region.clone());
        for (k, v) in &self.extra_vars {
            vars.insert(k.clone(), v.clone());
        }
        vars
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionOutputs {
    pub cluster_name: String,
    #[serde(default)]
    pub raw: BTreeMap<String, Value>,
}

impl ProvisionOutputs {
    /// Parses raw tool outputs once. Accepts both bare values and the
    /// `{"value": ...}` envelope; falls back to the requested cluster name
    /// when the module does not export one.
    pub fn from_raw(
        raw: BTreeMap<String, Value>,
        options: &ProvisionOptions,
    ) -> Result<Self, HarnessError> {
        let cluster_name = match raw.get("cluster_name") {
            Some(v) => output_string(v).ok_or_else(|| {
                HarnessError::ProvisionFailed(format!(
                    "output cluster_name is not a string: {}",
                    v
                ))
            })?,
            None => options.cluster_name.clone(),
        };
        if cluster_name.trim().is_empty() {
            return Err(HarnessError::ProvisionFailed(
                "provisioning produced an empty cluster name".to_string(),
            ));
        }
        Ok(Self { cluster_name, raw })
    }
}

fn output_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("value").and_then(output_string),
        _ => None,
    }
}

/// Access credential handle: where the credential file lives and which
/// context and namespace to address. Persisted as a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessOptions {
    pub config_path: PathBuf,
    #[serde(default)]
    pub context_name: String,
    #[serde(default)]
    pub namespace: String,
}

impl AccessOptions {
    pub fn with_namespace(&self, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            ..self.clone()
        }
    }
}
