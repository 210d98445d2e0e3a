//! Staged, resumable end-to-end harness: copy a provisioning template,
//! stand up a cluster, deploy a workload, validate it over a tunnel and
//! always tear everything down again.

pub mod access;
pub mod config;
pub mod deploy;
pub mod error;
pub mod external;
pub mod lifecycle;
pub mod options;
pub mod pipeline;
pub mod readiness;
pub mod retry;
pub mod stage;
pub mod store;
pub mod tools;
pub mod validate;

pub use config::HarnessConfig;
pub use error::{CommandError, HarnessError};
pub use options::{AccessOptions, ProvisionOptions, ProvisionOutputs, RunContext};
pub use pipeline::{Pipeline, PipelineFailure, PipelineReport, Tools};
pub use retry::{retry, RetryExhausted, RetryPolicy};
pub use stage::{read_journal, JournalEntry, SkipFlags, StageRunner, StageStatus};
pub use store::StageStore;

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use std::path::PathBuf;

    pub fn temp_root(label: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "stagehand_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        std::fs::create_dir_all(&root).expect("create temp root");
        root
    }
}
