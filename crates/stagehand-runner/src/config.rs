use crate::retry::RetryPolicy;
use crate::HarnessError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const PROJECT_ENV_VARS: &[&str] = &[
    "GOOGLE_PROJECT",
    "GOOGLE_CLOUD_PROJECT",
    "GOOGLE_CLOUD_PROJECT_ID",
    "GCLOUD_PROJECT",
    "CLOUDSDK_CORE_PROJECT",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub terraform: String,
    pub gcloud: String,
    pub helm: String,
    pub kubectl: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            terraform: "terraform".to_string(),
            gcloud: "gcloud".to_string(),
            helm: "helm".to_string(),
            kubectl: "kubectl".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Tree copied to scratch before provisioning.
    pub template_dir: PathBuf,
    /// Provisioning module, relative to the copied tree.
    pub module_path: String,
    pub cluster_prefix: String,
    pub provision_vars: BTreeMap<String, String>,
    pub no_color: bool,
    pub project: Option<String>,
    pub region: Option<String>,
    pub region_candidates: Vec<String>,
    /// Credential file copied into the run; `None` means start empty.
    pub kubeconfig_source: Option<PathBuf>,
    /// Where template copies and credential files go; defaults to the OS temp dir.
    pub scratch_dir: Option<PathBuf>,
    pub expected_workers: Option<usize>,
    pub readiness: RetryPolicy,
    pub chart_path: String,
    pub release_prefix: String,
    pub resource_suffix: String,
    pub namespace: String,
    pub image: String,
    pub install_env: BTreeMap<String, String>,
    pub availability: RetryPolicy,
    pub validation: RetryPolicy,
    pub remote_port: u16,
    pub expected_body: String,
    pub http_timeout_secs: u64,
    pub tools: ToolPaths,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            template_dir: PathBuf::from("../examples"),
            module_path: "gke-basic-tiller".to_string(),
            cluster_prefix: "gke-basic-tiller".to_string(),
            provision_vars: BTreeMap::new(),
            no_color: true,
            project: None,
            region: None,
            region_candidates: vec![
                "us-central1".to_string(),
                "us-east1".to_string(),
                "us-west1".to_string(),
                "europe-west1".to_string(),
                "asia-east1".to_string(),
            ],
            kubeconfig_source: None,
            scratch_dir: None,
            expected_workers: None,
            readiness: RetryPolicy {
                max_attempts: 30,
                sleep_ms: 10_000,
            },
            chart_path: "charts/minimal-pod".to_string(),
            release_prefix: "nginx".to_string(),
            resource_suffix: "minimal-pod".to_string(),
            namespace: "default".to_string(),
            image: "nginx:1.15.8".to_string(),
            install_env: BTreeMap::from([
                ("HELM_TLS_VERIFY".to_string(), "true".to_string()),
                ("HELM_TLS_ENABLE".to_string(), "true".to_string()),
            ]),
            availability: RetryPolicy {
                max_attempts: 15,
                sleep_ms: 5_000,
            },
            validation: RetryPolicy {
                max_attempts: 15,
                sleep_ms: 5_000,
            },
            remote_port: 80,
            expected_body: "Welcome to nginx".to_string(),
            http_timeout_secs: 10,
            tools: ToolPaths::default(),
        }
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| HarnessError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_yaml(&text)
            .map_err(|e| HarnessError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_yaml(text: &str) -> Result<Self, HarnessError> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| HarnessError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, HarnessError> {
        serde_yaml::to_string(self).map_err(|e| HarnessError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        let mut missing = Vec::new();
        if self.module_path.trim().is_empty() {
            missing.push("module_path");
        }
        if self.chart_path.trim().is_empty() {
            missing.push("chart_path");
        }
        if self.release_prefix.trim().is_empty() {
            missing.push("release_prefix");
        }
        if self.expected_body.is_empty() {
            missing.push("expected_body");
        }
        if self.remote_port == 0 {
            missing.push("remote_port");
        }
        if self.region.is_none() && self.region_candidates.is_empty() {
            missing.push("region or region_candidates");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Config(format!(
                "missing or empty fields: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn scratch(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Fills `project` and `kubeconfig_source` from environment-like pairs
    /// when the file left them unset.
    pub fn apply_env<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
            .collect();
        if self.project.is_none() {
            self.project = PROJECT_ENV_VARS
                .iter()
                .filter_map(|name| vars.get(*name))
                .find(|v| !v.trim().is_empty())
                .cloned();
        }
        if self.kubeconfig_source.is_none() {
            self.kubeconfig_source = vars
                .get("KUBECONFIG")
                .and_then(|v| v.split(':').find(|p| !p.is_empty()))
                .map(PathBuf::from)
                .or_else(|| {
                    vars.get("HOME")
                        .map(|home| Path::new(home).join(".kube").join("config"))
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        let config = HarnessConfig::from_yaml("{}").expect("parse");
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.availability.max_attempts, 15);
        assert_eq!(config.expected_body, "Welcome to nginx");
    }

    #[test]
    fn partial_yaml_overrides_selected_fields() {
        let config = HarnessConfig::from_yaml(
            "region: europe-west1\nvalidation:\n  max_attempts: 3\n  sleep_ms: 10\ntools:\n  helm: /usr/local/bin/helm\n",
        )
        .expect("parse");
        assert_eq!(config.region.as_deref(), Some("europe-west1"));
        assert_eq!(config.validation.sleep_ms, 10);
        assert_eq!(config.tools.helm, "/usr/local/bin/helm");
        assert_eq!(config.tools.kubectl, "kubectl");
    }

    #[test]
    fn validate_lists_every_problem() {
        let err = HarnessConfig::from_yaml("chart_path: ''\nremote_port: 0\n").expect_err("invalid");
        let msg = err.to_string();
        assert!(msg.contains("chart_path"), "{}", msg);
        assert!(msg.contains("remote_port"), "{}", msg);
    }

    #[test]
    fn yaml_round_trip_is_stable() {
        let config = HarnessConfig::default();
        let text = config.to_yaml().expect("yaml");
        assert_eq!(HarnessConfig::from_yaml(&text).expect("parse"), config);
    }

    #[test]
    fn env_fills_project_and_kubeconfig_in_priority_order() {
        let mut config = HarnessConfig::default();
        config.apply_env(vec![
            ("GCLOUD_PROJECT", "from-gcloud"),
            ("GOOGLE_CLOUD_PROJECT", "from-google-cloud"),
            ("KUBECONFIG", ":/etc/kube/a:/etc/kube/b"),
            ("HOME", "/home/dev"),
        ]);
        assert_eq!(config.project.as_deref(), Some("from-google-cloud"));
        assert_eq!(config.kubeconfig_source, Some(PathBuf::from("/etc/kube/a")));
    }

    #[test]
    fn env_never_overrides_file_values() {
        let mut config = HarnessConfig {
            project: Some("pinned".to_string()),
            ..HarnessConfig::default()
        };
        config.apply_env(vec![("GOOGLE_PROJECT", "other"), ("HOME", "/home/dev")]);
        assert_eq!(config.project.as_deref(), Some("pinned"));
        assert_eq!(
            config.kubeconfig_source,
            Some(PathBuf::from("/home/dev/.kube/config"))
        );
    }
}
