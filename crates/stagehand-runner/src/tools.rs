//! Narrow capability interfaces over the external tools the pipeline drives.
//!
//! Each trait is the only surface a component sees of its tool, so tests swap
//! in deterministic fakes and the CLI plugs in the process-backed adapters
//! from [`crate::external`].

use crate::options::{AccessOptions, ProvisionOptions};
use crate::CommandError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

pub trait Provisioner {
    /// Init + apply the module at `options.module_dir`, returning the raw
    /// named outputs.
    fn apply(&self, options: &ProvisionOptions) -> Result<BTreeMap<String, Value>, CommandError>;
    fn destroy(&self, options: &ProvisionOptions) -> Result<(), CommandError>;
}

pub trait CredentialIssuer {
    /// Writes cluster credentials into `credential_path`.
    fn issue(
        &self,
        credential_path: &Path,
        cluster_name: &str,
        region: &str,
        project: &str,
    ) -> Result<(), CommandError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallRequest {
    pub chart_path: String,
    pub release_name: String,
    pub set_values: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
}

pub trait PackageInstaller {
    fn install(&self, access: &AccessOptions, request: &InstallRequest) -> Result<(), CommandError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub name: String,
    pub ready: bool,
}

/// A local endpoint forwarded into the cluster. `close` must be safe to call
/// more than once.
pub trait Tunnel {
    /// `host:port` on the local side.
    fn endpoint(&self) -> String;
    fn close(&mut self);
    fn is_closed(&self) -> bool;
}

pub trait ClusterClient {
    fn list_nodes(&self, access: &AccessOptions) -> Result<Vec<NodeStatus>, CommandError>;
    fn workload_available(&self, access: &AccessOptions, name: &str) -> Result<bool, CommandError>;
    fn open_tunnel(
        &self,
        access: &AccessOptions,
        resource_name: &str,
        remote_port: u16,
    ) -> Result<Box<dyn Tunnel>, CommandError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

pub trait HttpProbe {
    fn get(&self, url: &str) -> Result<HttpResponse, String>;
}
