//! Process-backed implementations of the capability traits.

use crate::options::{AccessOptions, ProvisionOptions};
use crate::tools::{
    ClusterClient, CredentialIssuer, HttpProbe, HttpResponse, InstallRequest, NodeStatus,
    PackageInstaller, Provisioner, Tunnel,
};
use crate::CommandError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const TUNNEL_READY_TIMEOUT: Duration = Duration::from_secs(15);

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().to_string()
}

fn stderr_tail(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no stderr output")
        .to_string()
}

fn status_label(status: ExitStatus) -> String {
    status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

/// Runs `cmd` to completion, returning stdout. Non-zero exit carries the last
/// non-empty stderr line.
pub fn run_command(mut cmd: Command) -> Result<String, CommandError> {
    let program = program_name(&cmd);
    tracing::debug!(command = ?cmd, "running");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let output = cmd.output().map_err(|source| CommandError::Spawn {
        program: program.clone(),
        source,
    })?;
    if !output.status.success() {
        return Err(CommandError::Exit {
            program,
            status: status_label(output.status),
            stderr_tail: stderr_tail(&String::from_utf8_lossy(&output.stderr)),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn parse_json(program: &str, text: &str) -> Result<Value, CommandError> {
    serde_json::from_str(text).map_err(|e| CommandError::Output {
        program: program.to_string(),
        message: e.to_string(),
    })
}

pub struct TerraformCli {
    binary: String,
}

impl TerraformCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn base(&self, options: &ProvisionOptions, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(&options.module_dir);
        cmd.arg(subcommand);
        cmd.arg("-input=false");
        if options.no_color {
            cmd.arg("-no-color");
        }
        cmd
    }

    fn with_vars(cmd: &mut Command, options: &ProvisionOptions) {
        for (k, v) in options.vars() {
            cmd.arg("-var").arg(format!("{}={}", k, v));
        }
    }
}

impl Provisioner for TerraformCli {
    fn apply(&self, options: &ProvisionOptions) -> Result<BTreeMap<String, Value>, CommandError> {
        run_command(self.base(options, "init"))?;

        let mut apply = self.base(options, "apply");
        apply.arg("-auto-approve");
        Self::with_vars(&mut apply, options);
        run_command(apply)?;

        let mut output = Command::new(&self.binary);
        output.current_dir(&options.module_dir);
        output.args(["output", "-json"]);
        let text = run_command(output)?;
        match parse_json(&self.binary, &text)? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(CommandError::Output {
                program: self.binary.clone(),
                message: format!("expected an object of outputs, got {}", other),
            }),
        }
    }

    fn destroy(&self, options: &ProvisionOptions) -> Result<(), CommandError> {
        let mut destroy = self.base(options, "destroy");
        destroy.arg("-auto-approve");
        Self::with_vars(&mut destroy, options);
        run_command(destroy).map(|_| ())
    }
}

pub struct GcloudCli {
    binary: String,
}

impl GcloudCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl CredentialIssuer for GcloudCli {
    fn issue(
        &self,
        credential_path: &Path,
        cluster_name: &str,
        region: &str,
        project: &str,
    ) -> Result<(), CommandError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["beta", "container", "clusters", "get-credentials", cluster_name]);
        cmd.args(["--region", region, "--project", project]);
        cmd.env("KUBECONFIG", credential_path);
        run_command(cmd).map(|_| ())
    }
}

pub struct HelmCli {
    binary: String,
}

impl HelmCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl PackageInstaller for HelmCli {
    fn install(&self, access: &AccessOptions, request: &InstallRequest) -> Result<(), CommandError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("install");
        cmd.arg(&request.release_name).arg(&request.chart_path);
        if !access.namespace.is_empty() {
            cmd.args(["--namespace", access.namespace.as_str()]);
        }
        if !access.context_name.is_empty() {
            cmd.args(["--kube-context", access.context_name.as_str()]);
        }
        for (k, v) in &request.set_values {
            cmd.arg("--set").arg(format!("{}={}", k, v));
        }
        cmd.env("KUBECONFIG", &access.config_path);
        for (k, v) in &request.env {
            cmd.env(k, v);
        }
        run_command(cmd).map(|_| ())
    }
}

pub struct KubectlCli {
    binary: String,
}

impl KubectlCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, access: &AccessOptions) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--kubeconfig").arg(&access.config_path);
        if !access.context_name.is_empty() {
            cmd.args(["--context", access.context_name.as_str()]);
        }
        if !access.namespace.is_empty() {
            cmd.args(["--namespace", access.namespace.as_str()]);
        }
        cmd
    }
}

pub fn parse_node_list(doc: &Value) -> Vec<NodeStatus> {
    doc.pointer("/items")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|item| NodeStatus {
                    name: item
                        .pointer("/metadata/name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                    ready: has_true_condition(item, "Ready"),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn has_true_condition(item: &Value, kind: &str) -> bool {
    item.pointer("/status/conditions")
        .and_then(|v| v.as_array())
        .map(|conds| {
            conds.iter().any(|c| {
                c.get("type").and_then(|v| v.as_str()) == Some(kind)
                    && c.get("status").and_then(|v| v.as_str()) == Some("True")
            })
        })
        .unwrap_or(false)
}

/// Running with every container ready.
pub fn pod_is_available(pod: &Value) -> bool {
    let running = pod.pointer("/status/phase").and_then(|v| v.as_str()) == Some("Running");
    let containers = pod
        .pointer("/status/containerStatuses")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    running
        && !containers.is_empty()
        && containers
            .iter()
            .all(|c| c.get("ready").and_then(|v| v.as_bool()) == Some(true))
}

impl ClusterClient for KubectlCli {
    fn list_nodes(&self, access: &AccessOptions) -> Result<Vec<NodeStatus>, CommandError> {
        let mut cmd = self.command(access);
        cmd.args(["get", "nodes", "-o", "json"]);
        let text = run_command(cmd)?;
        Ok(parse_node_list(&parse_json(&self.binary, &text)?))
    }

    fn workload_available(&self, access: &AccessOptions, name: &str) -> Result<bool, CommandError> {
        let mut cmd = self.command(access);
        cmd.args(["get", "pod", name, "-o", "json"]);
        let text = run_command(cmd)?;
        Ok(pod_is_available(&parse_json(&self.binary, &text)?))
    }

    fn open_tunnel(
        &self,
        access: &AccessOptions,
        resource_name: &str,
        remote_port: u16,
    ) -> Result<Box<dyn Tunnel>, CommandError> {
        let local_port = free_local_port().map_err(|source| CommandError::Spawn {
            program: self.binary.clone(),
            source,
        })?;
        let mut cmd = self.command(access);
        cmd.arg("port-forward")
            .arg(format!("pod/{}", resource_name))
            .arg(format!("{}:{}", local_port, remote_port));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|source| CommandError::Spawn {
            program: self.binary.clone(),
            source,
        })?;
        let mut tunnel = PortForward {
            child: Some(child),
            local: SocketAddr::from(([127, 0, 0, 1], local_port)),
        };
        if let Err(err) = tunnel.wait_until_listening(&self.binary, TUNNEL_READY_TIMEOUT) {
            tunnel.close();
            return Err(err);
        }
        Ok(Box::new(tunnel))
    }
}

fn free_local_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A `kubectl port-forward` child process.
pub struct PortForward {
    child: Option<Child>,
    local: SocketAddr,
}

impl PortForward {
    /// An early exit of the child is reported with its own stderr tail.
    fn wait_until_listening(
        &mut self,
        program: &str,
        timeout: Duration,
    ) -> Result<(), CommandError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    let mut stderr = String::new();
                    if let Some(mut pipe) = child.stderr.take() {
                        let _ = pipe.read_to_string(&mut stderr);
                    }
                    return Err(CommandError::Exit {
                        program: program.to_string(),
                        status: status_label(status),
                        stderr_tail: stderr_tail(&stderr),
                    });
                }
            }
            if TcpStream::connect_timeout(&self.local, Duration::from_millis(200)).is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CommandError::Output {
                    program: program.to_string(),
                    message: format!(
                        "port-forward did not listen on {} within {:?}",
                        self.local, timeout
                    ),
                });
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}

impl Tunnel for PortForward {
    fn endpoint(&self) -> String {
        self.local.to_string()
    }

    fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn is_closed(&self) -> bool {
        self.child.is_none()
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct ReqwestProbe {
    client: reqwest::blocking::Client,
}

impl ReqwestProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl HttpProbe for ReqwestProbe {
    fn get(&self, url: &str) -> Result<HttpResponse, String> {
        let response = self.client.get(url).send().map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().map_err(|e| e.to_string())?;
        Ok(HttpResponse { status, body })
    }
}
