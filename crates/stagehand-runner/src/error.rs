use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("missing_state: '{key}' was never saved under {} ({reason})", run_dir.display())]
    MissingState {
        run_dir: PathBuf,
        key: String,
        reason: String,
    },
    #[error("corrupt_state: '{key}' under {} could not be decoded: {message}", run_dir.display())]
    CorruptState {
        run_dir: PathBuf,
        key: String,
        message: String,
    },
    #[error("invalid_state_key: '{0}' is not a usable file name")]
    InvalidStateKey(String),
    #[error("template_copy_failed: {0}")]
    TemplateCopyFailed(String),
    #[error("provision_failed: {0}")]
    ProvisionFailed(String),
    #[error("credential_exchange_failed: {0}")]
    CredentialExchangeFailed(String),
    #[error("cluster_not_ready: {0}")]
    ClusterNotReady(String),
    #[error("deploy_failed: {0}")]
    DeployFailed(String),
    #[error("resource_not_available: {0}")]
    ResourceNotAvailable(String),
    #[error("tunnel_open_failed: {0}")]
    TunnelOpenFailed(String),
    #[error("validation_timeout: {0}")]
    ValidationTimeout(String),
    #[error("cleanup_failed: {}", .0.join("; "))]
    CleanupFailed(Vec<String>),
    #[error("config_error: {0}")]
    Config(String),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("io_error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Stable snake_case code, used by the CLI's JSON error payload.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingState { .. } => "missing_state",
            Self::CorruptState { .. } => "corrupt_state",
            Self::InvalidStateKey(_) => "invalid_state_key",
            Self::TemplateCopyFailed(_) => "template_copy_failed",
            Self::ProvisionFailed(_) => "provision_failed",
            Self::CredentialExchangeFailed(_) => "credential_exchange_failed",
            Self::ClusterNotReady(_) => "cluster_not_ready",
            Self::DeployFailed(_) => "deploy_failed",
            Self::ResourceNotAvailable(_) => "resource_not_available",
            Self::TunnelOpenFailed(_) => "tunnel_open_failed",
            Self::ValidationTimeout(_) => "validation_timeout",
            Self::CleanupFailed(_) => "cleanup_failed",
            Self::Config(_) => "config_error",
            Self::Command(_) => "command_failed",
            Self::Io(_) => "io_error",
        }
    }
}

/// Failure of an external tool invocation. Non-zero exit is the only failure
/// signal the tools give us, so the stderr tail is all the detail we keep.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr_tail}")]
    Exit {
        program: String,
        status: String,
        stderr_tail: String,
    },
    #[error("{program} produced unparseable output: {message}")]
    Output { program: String, message: String },
}
