//! Run history, one JSON file per run.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::agent::RunLogEntry;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("run '{0}' not found")]
    NotFound(String),

    #[error("invalid run id '{0}'")]
    InvalidId(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt run record {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    /// Human-readable description, e.g. the prompt name or the question
    pub label: String,
    pub prompt_id: Option<String>,
    pub status: RunStatus,
    /// Report on success, failure reason otherwise
    pub result: Option<String>,
    #[serde(default)]
    pub log: Vec<RunLogEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// History directory store.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record a newly started run and return its id.
    pub fn save_run(&self, label: &str, prompt_id: Option<&str>) -> Result<String, HistoryError> {
        self.ensure_dir()?;
        let now = Utc::now();
        let simple = Uuid::new_v4().simple().to_string();
        let id = format!("{}_{}", now.format("%Y%m%d-%H%M%S"), &simple[..8]);
        let record = RunRecord {
            id: id.clone(),
            label: label.to_string(),
            prompt_id: prompt_id.map(str::to_string),
            status: RunStatus::Running,
            result: None,
            log: Vec::new(),
            started_at: now,
            finished_at: None,
        };
        self.write(&record)?;
        Ok(id)
    }

    /// Record the final state of a run.
    pub fn update_run(
        &self,
        id: &str,
        status: RunStatus,
        result: Option<String>,
        log: Option<Vec<RunLogEntry>>,
    ) -> Result<RunRecord, HistoryError> {
        let mut record = self.get_run(id)?;
        record.status = status;
        if result.is_some() {
            record.result = result;
        }
        if let Some(log) = log {
            record.log = log;
        }
        if status.is_finished() {
            record.finished_at = Some(Utc::now());
        }
        self.write(&record)?;
        Ok(record)
    }

    /// All readable records, newest first.
    pub fn list_runs(&self) -> Result<Vec<RunRecord>, HistoryError> {
        let mut runs: Vec<RunRecord> = self
            .record_paths()?
            .into_iter()
            .filter_map(|path| match read_record(&path) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable history entry");
                    None
                }
            })
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        Ok(runs)
    }

    pub fn get_run(&self, id: &str) -> Result<RunRecord, HistoryError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Err(HistoryError::NotFound(id.to_string()));
        }
        read_record(&path)
    }

    /// Delete every record and return how many were removed.
    pub fn clear(&self) -> Result<usize, HistoryError> {
        let paths = self.record_paths()?;
        for path in &paths {
            std::fs::remove_file(path).map_err(|source| HistoryError::Io {
                path: path.clone(),
                source,
            })?;
        }
        Ok(paths.len())
    }

    fn ensure_dir(&self) -> Result<(), HistoryError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| HistoryError::Io {
            path: self.dir.clone(),
            source,
        })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, HistoryError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(HistoryError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    fn record_paths(&self) -> Result<Vec<PathBuf>, HistoryError> {
        self.ensure_dir()?;
        let read = std::fs::read_dir(&self.dir).map_err(|source| HistoryError::Io {
            path: self.dir.clone(),
            source,
        })?;
        Ok(read
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect())
    }

    fn write(&self, record: &RunRecord) -> Result<(), HistoryError> {
        let path = self.path_for(&record.id)?;
        let json = serde_json::to_string_pretty(record).map_err(|source| HistoryError::Json {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, json).map_err(|source| HistoryError::Io { path, source })
    }
}

fn read_record(path: &Path) -> Result<RunRecord, HistoryError> {
    let text = std::fs::read_to_string(path).map_err(|source| HistoryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| HistoryError::Json {
        path: path.to_path_buf(),
        source,
    })
}
