use crate::options::AccessOptions;
use crate::store::ensure_dir;
use crate::tools::CredentialIssuer;
use crate::HarnessError;
use std::fs;
use std::path::Path;

/// Owns the run's private credential file from creation to deletion.
pub struct AccessConfigurator<'a> {
    issuer: &'a dyn CredentialIssuer,
}

impl<'a> AccessConfigurator<'a> {
    pub fn new(issuer: &'a dyn CredentialIssuer) -> Self {
        Self { issuer }
    }

    /// Copies `source` (the developer's credential file, if any) to
    /// `<scratch>/kubeconfig-<unique_id>` so the run never touches the
    /// original. A missing source yields an empty file.
    pub fn prepare(
        &self,
        source: Option<&Path>,
        scratch: &Path,
        unique_id: &str,
    ) -> Result<AccessOptions, HarnessError> {
        ensure_dir(scratch)?;
        let target = scratch.join(format!("kubeconfig-{}", unique_id));
        match source {
            Some(src) if src.is_file() => {
                fs::copy(src, &target)?;
                tracing::info!(from = %src.display(), to = %target.display(), "copied credential file");
            }
            _ => {
                fs::write(&target, b"")?;
                tracing::info!(path = %target.display(), "no credential file to copy; created empty one");
            }
        }
        Ok(AccessOptions {
            config_path: target,
            context_name: String::new(),
            namespace: String::new(),
        })
    }

    pub fn exchange_credentials(
        &self,
        handle: &AccessOptions,
        cluster_name: &str,
        region: &str,
        project: &str,
    ) -> Result<(), HarnessError> {
        tracing::info!(cluster = cluster_name, region, project, "fetching cluster credentials");
        self.issuer
            .issue(&handle.config_path, cluster_name, region, project)
            .map_err(|e| HarnessError::CredentialExchangeFailed(e.to_string()))
    }
}

/// Deletes the handle's credential file. A file that is already gone is
/// reported, not ignored.
pub fn release_credentials(handle: &AccessOptions) -> Result<(), String> {
    let path = &handle.config_path;
    fs::remove_file(path)
        .map_err(|e| format!("remove credential file {}: {}", path.display(), e))?;
    tracing::info!(path = %path.display(), "removed credential file");
    Ok(())
}
