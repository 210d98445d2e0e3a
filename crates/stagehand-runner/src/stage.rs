use crate::store::{atomic_write_bytes, StageStore};
use crate::HarnessError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

pub const SKIP_PREFIX: &str = "SKIP_";

/// Stage name -> skip. Built once at the entry point; the runner never reads
/// the process environment itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipFlags {
    flags: BTreeMap<String, bool>,
}

impl SkipFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: &str, skip: bool) -> Self {
        self.flags.insert(stage.to_string(), skip);
        self
    }

    /// Reads `SKIP_<stage>` toggles out of an environment-like iterator.
    ///
    /// Empty, `0`, `false`, `no` and `off` (any case) leave the stage enabled.
    /// Scripts that relied on any non-empty value skipping, such as
    /// `SKIP_provision=false`, now run that stage.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut flags = BTreeMap::new();
        for (key, value) in vars {
            if let Some(stage) = key.as_ref().strip_prefix(SKIP_PREFIX) {
                if !stage.is_empty() {
                    flags.insert(stage.to_string(), toggle_is_set(value.as_ref()));
                }
            }
        }
        Self { flags }
    }

    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn is_skipped(&self, stage: &str) -> bool {
        self.flags.get(stage).copied().unwrap_or(false)
    }
}

fn toggle_is_set(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ran,
    Skipped,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ran => "ran",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub name: String,
    pub status: StageStatus,
    pub started_at: String,
    pub finished_at: String,
    #[serde(default)]
    pub error: Option<String>,
}

pub fn journal_path(store: &StageStore) -> PathBuf {
    store.run_dir().join("journal").join("stages.json")
}

pub fn read_journal(store: &StageStore) -> Result<Vec<JournalEntry>, HarnessError> {
    let path = journal_path(store);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(&path)?;
    serde_json::from_slice(&bytes).map_err(|e| HarnessError::CorruptState {
        run_dir: store.run_dir().to_path_buf(),
        key: "journal/stages".to_string(),
        message: e.to_string(),
    })
}

fn append_journal(store: &StageStore, entry: JournalEntry) -> Result<(), HarnessError> {
    let mut entries = read_journal(store)?;
    entries.push(entry);
    let bytes = serde_json::to_vec_pretty(&entries).map_err(|e| HarnessError::CorruptState {
        run_dir: store.run_dir().to_path_buf(),
        key: "journal/stages".to_string(),
        message: e.to_string(),
    })?;
    atomic_write_bytes(&journal_path(store), &bytes)
}

/// Runs named stages synchronously, honoring skip flags.
#[derive(Debug, Clone, Default)]
pub struct StageRunner {
    skip: SkipFlags,
    journal: Option<StageStore>,
}

impl StageRunner {
    pub fn new(skip: SkipFlags) -> Self {
        Self {
            skip,
            journal: None,
        }
    }

    pub fn with_journal(mut self, store: StageStore) -> Self {
        self.journal = Some(store);
        self
    }

    pub fn skip_flags(&self) -> &SkipFlags {
        &self.skip
    }

    /// Runs `action` unless `name` is flagged for skipping. A skipped action
    /// is never called. An action's error is returned unchanged.
    pub fn run_stage<F>(&self, name: &str, action: F) -> Result<StageStatus, HarnessError>
    where
        F: FnOnce() -> Result<(), HarnessError>,
    {
        let started_at = Utc::now().to_rfc3339();
        if self.skip.is_skipped(name) {
            tracing::info!(stage = name, "skipping stage ({}{} is set)", SKIP_PREFIX, name);
            self.record(name, StageStatus::Skipped, started_at, None);
            return Ok(StageStatus::Skipped);
        }

        tracing::info!(stage = name, "running stage");
        match action() {
            Ok(()) => {
                tracing::info!(stage = name, "stage finished");
                self.record(name, StageStatus::Ran, started_at, None);
                Ok(StageStatus::Ran)
            }
            Err(err) => {
                tracing::error!(stage = name, error = %err, "stage failed");
                self.record(name, StageStatus::Failed, started_at, Some(err.to_string()));
                Err(err)
            }
        }
    }

    fn record(&self, name: &str, status: StageStatus, started_at: String, error: Option<String>) {
        let Some(store) = &self.journal else {
            return;
        };
        let entry = JournalEntry {
            name: name.to_string(),
            status,
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            error,
        };
        // The journal is bookkeeping; a write failure must not change the stage result.
        if let Err(e) = append_journal(store, entry) {
            tracing::warn!(stage = name, error = %e, "failed to append stage journal");
        }
    }
}
