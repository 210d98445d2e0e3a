use crate::access::{release_credentials, AccessConfigurator};
use crate::config::HarnessConfig;
use crate::deploy::{ReleaseNames, WorkloadDeployer};
use crate::lifecycle::{copy_template, ResourceLifecycle};
use crate::options::{
    pick_region, unique_id, AccessOptions, ProvisionOptions, ProvisionOutputs, RunContext,
    KEY_ACCESS_OPTIONS, KEY_MODULE_PATH, KEY_PROVISION_OPTIONS, KEY_PROVISION_OUTPUTS,
    KEY_UNIQUE_ID,
};
use crate::readiness::ReadinessPoller;
use crate::stage::{StageRunner, StageStatus};
use crate::store::StageStore;
use crate::tools::{ClusterClient, CredentialIssuer, HttpProbe, PackageInstaller, Provisioner};
use crate::validate::NetworkValidator;
use crate::HarnessError;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

pub const STAGE_COPY_TEMPLATE: &str = "copy_template";
pub const STAGE_BUILD_OPTIONS: &str = "build_options";
pub const STAGE_CLEANUP: &str = "cleanup";
pub const STAGE_PROVISION: &str = "provision";
pub const STAGE_CONFIGURE_ACCESS: &str = "configure_access";
pub const STAGE_WAIT_FOR_WORKERS: &str = "wait_for_workers";
pub const STAGE_DEPLOY_WORKLOAD: &str = "deploy_workload";

/// Stage names in the order they execute (cleanup last, though it is
/// scheduled right after `build_options`).
pub const STAGES: &[&str] = &[
    STAGE_COPY_TEMPLATE,
    STAGE_BUILD_OPTIONS,
    STAGE_PROVISION,
    STAGE_CONFIGURE_ACCESS,
    STAGE_WAIT_FOR_WORKERS,
    STAGE_DEPLOY_WORKLOAD,
    STAGE_CLEANUP,
];

pub struct Tools {
    pub provisioner: Box<dyn Provisioner>,
    pub credentials: Box<dyn CredentialIssuer>,
    pub installer: Box<dyn PackageInstaller>,
    pub cluster: Box<dyn ClusterClient>,
    pub http: Box<dyn HttpProbe>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub stages: Vec<(String, StageStatus)>,
}

impl PipelineReport {
    fn record(&mut self, name: &str, status: StageStatus) {
        self.stages.push((name.to_string(), status));
    }

    pub fn status_of(&self, name: &str) -> Option<StageStatus> {
        self.stages
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, status)| *status)
    }
}

/// The first error that aborted the run, plus whatever cleanup reported
/// afterwards. Both are surfaced.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PipelineFailure {
    pub error: HarnessError,
    pub cleanup: Option<HarnessError>,
    pub report: PipelineReport,
}

pub struct Pipeline {
    config: HarnessConfig,
    store: StageStore,
    runner: StageRunner,
    tools: Tools,
    new_id: Box<dyn Fn() -> String>,
}

impl Pipeline {
    pub fn new(
        config: HarnessConfig,
        run_dir: impl Into<PathBuf>,
        runner: StageRunner,
        tools: Tools,
    ) -> Self {
        let store = StageStore::new(run_dir);
        Self {
            config,
            runner: runner.with_journal(store.clone()),
            store,
            tools,
            new_id: Box::new(unique_id),
        }
    }

    /// Replaces the identifier source used for the run id and release names.
    pub fn with_id_source(mut self, new_id: impl Fn() -> String + 'static) -> Self {
        self.new_id = Box::new(new_id);
        self
    }

    pub fn store(&self) -> &StageStore {
        &self.store
    }

    pub fn run(&self) -> Result<PipelineReport, PipelineFailure> {
        let mut report = PipelineReport::default();

        let setup: [(&str, fn(&Self) -> Result<(), HarnessError>); 2] = [
            (STAGE_COPY_TEMPLATE, Self::copy_template_stage),
            (STAGE_BUILD_OPTIONS, Self::build_options_stage),
        ];
        for (name, action) in setup {
            match self.runner.run_stage(name, || action(self)) {
                Ok(status) => report.record(name, status),
                Err(error) => {
                    report.record(name, StageStatus::Failed);
                    return Err(PipelineFailure {
                        error,
                        cleanup: None,
                        report,
                    });
                }
            }
        }

        // Cleanup is scheduled from here on: it runs on every exit path below.
        let body =
            panic::catch_unwind(AssertUnwindSafe(|| self.provision_and_validate(&mut report)));
        let cleanup = self.runner.run_stage(STAGE_CLEANUP, || self.cleanup_stage());
        match &cleanup {
            Ok(status) => report.record(STAGE_CLEANUP, *status),
            Err(_) => report.record(STAGE_CLEANUP, StageStatus::Failed),
        }

        match body {
            Err(payload) => {
                if let Err(e) = &cleanup {
                    tracing::error!(error = %e, "cleanup failed after a panic");
                }
                panic::resume_unwind(payload)
            }
            Ok(Err(error)) => {
                let cleanup = cleanup.err();
                if let Some(e) = &cleanup {
                    tracing::error!(error = %e, "cleanup failed after an aborted run");
                }
                Err(PipelineFailure {
                    error,
                    cleanup,
                    report,
                })
            }
            Ok(Ok(())) => match cleanup {
                Ok(_) => Ok(report),
                Err(error) => Err(PipelineFailure {
                    error,
                    cleanup: None,
                    report,
                }),
            },
        }
    }

    fn provision_and_validate(&self, report: &mut PipelineReport) -> Result<(), HarnessError> {
        let stages: [(&str, fn(&Self) -> Result<(), HarnessError>); 4] = [
            (STAGE_PROVISION, Self::provision_stage),
            (STAGE_CONFIGURE_ACCESS, Self::configure_access_stage),
            (STAGE_WAIT_FOR_WORKERS, Self::wait_for_workers_stage),
            (STAGE_DEPLOY_WORKLOAD, Self::deploy_workload_stage),
        ];
        for (name, action) in stages {
            match self.runner.run_stage(name, || action(self)) {
                Ok(status) => report.record(name, status),
                Err(e) => {
                    report.record(name, StageStatus::Failed);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn copy_template_stage(&self) -> Result<(), HarnessError> {
        let id = (self.new_id)();
        let copy = copy_template(&self.config.template_dir, &self.config.scratch(), &id)?;
        let module = copy.join(&self.config.module_path);
        if !module.is_dir() {
            return Err(HarnessError::TemplateCopyFailed(format!(
                "module '{}' not found in copied template {}",
                self.config.module_path,
                copy.display()
            )));
        }
        self.store.save_string(KEY_UNIQUE_ID, &id)?;
        self.store
            .save_string(KEY_MODULE_PATH, &module.to_string_lossy())
    }

    fn build_options_stage(&self) -> Result<(), HarnessError> {
        let module_dir = PathBuf::from(self.store.load_string(KEY_MODULE_PATH)?);
        // Reuse the id the template copy was named with when there is one.
        let id = match self.store.load_string(KEY_UNIQUE_ID) {
            Ok(id) => id,
            Err(HarnessError::MissingState { .. }) => (self.new_id)(),
            Err(e) => return Err(e),
        };
        let project = self
            .config
            .project
            .clone()
            .ok_or_else(|| HarnessError::Config("no cloud project configured".to_string()))?;
        let region = match &self.config.region {
            Some(region) => region.clone(),
            None => pick_region(&self.config.region_candidates, &id)
                .ok_or_else(|| HarnessError::Config("no region candidates".to_string()))?,
        };

        let access = AccessConfigurator::new(self.tools.credentials.as_ref()).prepare(
            self.config.kubeconfig_source.as_deref(),
            &self.config.scratch(),
            &id,
        )?;
        let options = ProvisionOptions {
            module_dir,
            cluster_name: format!("{}-{}", self.config.cluster_prefix, id.to_lowercase()),
            project: project.clone(),
            region: region.clone(),
            extra_vars: self.config.provision_vars.clone(),
            no_color: self.config.no_color,
        };
        let context = RunContext {
            run_dir: self.store.run_dir().to_path_buf(),
            unique_id: id,
            project,
            region,
        };
        tracing::info!(
            unique_id = %context.unique_id,
            project = %context.project,
            region = %context.region,
            "run options built"
        );

        context.save(&self.store)?;
        self.store.save_bundle(KEY_PROVISION_OPTIONS, &options)?;
        self.store.save_bundle(KEY_ACCESS_OPTIONS, &access)
    }

    fn cleanup_stage(&self) -> Result<(), HarnessError> {
        let mut failures = Vec::new();

        match self.store.load_bundle::<ProvisionOptions>(KEY_PROVISION_OPTIONS) {
            Ok(options) => {
                let lifecycle = ResourceLifecycle::new(self.tools.provisioner.as_ref());
                if let Err(e) = lifecycle.destroy(&options) {
                    failures.push(e.to_string());
                }
            }
            Err(e) => failures.push(e.to_string()),
        }
        match self.store.load_bundle::<AccessOptions>(KEY_ACCESS_OPTIONS) {
            Ok(access) => {
                if let Err(e) = release_credentials(&access) {
                    failures.push(e);
                }
            }
            Err(e) => failures.push(e.to_string()),
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::CleanupFailed(failures))
        }
    }

    fn provision_stage(&self) -> Result<(), HarnessError> {
        let options: ProvisionOptions = self.store.load_bundle(KEY_PROVISION_OPTIONS)?;
        let outputs = ResourceLifecycle::new(self.tools.provisioner.as_ref()).apply(&options)?;
        self.store.save_bundle(KEY_PROVISION_OUTPUTS, &outputs)
    }

    fn configure_access_stage(&self) -> Result<(), HarnessError> {
        let outputs: ProvisionOutputs = self.store.load_bundle(KEY_PROVISION_OUTPUTS)?;
        let access: AccessOptions = self.store.load_bundle(KEY_ACCESS_OPTIONS)?;
        let context = RunContext::load(&self.store)?;
        AccessConfigurator::new(self.tools.credentials.as_ref()).exchange_credentials(
            &access,
            &outputs.cluster_name,
            &context.region,
            &context.project,
        )
    }

    fn wait_for_workers_stage(&self) -> Result<(), HarnessError> {
        let access: AccessOptions = self.store.load_bundle(KEY_ACCESS_OPTIONS)?;
        ReadinessPoller::new(self.tools.cluster.as_ref(), self.config.readiness)
            .expect_workers(self.config.expected_workers)
            .wait_for_workers_ready(&access)
            .map(|_| ())
    }

    fn deploy_workload_stage(&self) -> Result<(), HarnessError> {
        let access = self
            .store
            .load_bundle::<AccessOptions>(KEY_ACCESS_OPTIONS)?
            .with_namespace(&self.config.namespace);
        let names = ReleaseNames::new(
            &self.config.release_prefix,
            &(self.new_id)(),
            &self.config.resource_suffix,
        );
        let parameters = BTreeMap::from([
            ("image".to_string(), self.config.image.clone()),
            ("fullnameOverride".to_string(), names.resource.clone()),
        ]);
        WorkloadDeployer::new(self.tools.installer.as_ref())
            .with_env(self.config.install_env.clone())
            .deploy(&access, &self.config.chart_path, &names.release, &parameters)?;

        NetworkValidator::new(
            self.tools.cluster.as_ref(),
            self.tools.http.as_ref(),
            self.config.availability,
            self.config.validation,
            self.config.remote_port,
        )
        .verify(&access, &names.resource, &self.config.expected_body)
    }
}
