use crate::options::AccessOptions;
use crate::tools::{InstallRequest, PackageInstaller};
use crate::HarnessError;
use std::collections::BTreeMap;

/// Names for one deployed release: the release itself and the workload
/// resource the validator will look up afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseNames {
    pub release: String,
    pub resource: String,
}

impl ReleaseNames {
    pub fn new(prefix: &str, id: &str, resource_suffix: &str) -> Self {
        let release = format!("{}-{}", prefix, id.to_lowercase());
        let resource = format!("{}-{}", release, resource_suffix);
        Self { release, resource }
    }
}

pub struct WorkloadDeployer<'a> {
    installer: &'a dyn PackageInstaller,
    env: BTreeMap<String, String>,
}

impl<'a> WorkloadDeployer<'a> {
    pub fn new(installer: &'a dyn PackageInstaller) -> Self {
        Self {
            installer,
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Installs `chart_path` as `release_name` into the handle's namespace.
    /// Install errors are never swallowed: a broken chart should fail here,
    /// not later as a network timeout.
    pub fn deploy(
        &self,
        handle: &AccessOptions,
        chart_path: &str,
        release_name: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), HarnessError> {
        let request = InstallRequest {
            chart_path: chart_path.to_string(),
            release_name: release_name.to_string(),
            set_values: parameters.clone(),
            env: self.env.clone(),
        };
        tracing::info!(
            release = release_name,
            chart = chart_path,
            namespace = %handle.namespace,
            "installing release"
        );
        self.installer
            .install(handle, &request)
            .map_err(|e| HarnessError::DeployFailed(format!("{}: {}", release_name, e)))
    }
}
