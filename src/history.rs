use std::error::Error;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::migration::MigrationResult;

#[derive(Debug)]
pub enum HistoryError {
    Io(std::io::Error),
    Json { line: usize, source: serde_json::Error },
    Encode(serde_json::Error),
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryError::Io(err) => write!(f, "I/O error: {}", err),
            HistoryError::Json { line, source } => {
                write!(f, "invalid history entry on line {}: {}", line, source)
            }
            HistoryError::Encode(err) => write!(f, "unable to encode history entry: {}", err),
        }
    }
}

impl Error for HistoryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HistoryError::Io(err) => Some(err),
            HistoryError::Json { source, .. } => Some(source),
            HistoryError::Encode(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for HistoryError {
    fn from(value: std::io::Error) -> Self {
        HistoryError::Io(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub from_version: u32,
    pub to_version: u32,
    pub final_version: u32,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub steps_executed: Vec<String>,
}

impl HistoryEntry {
    pub fn from_result(
        started_at: String,
        finished_at: String,
        from_version: u32,
        to_version: u32,
        result: &MigrationResult,
    ) -> Self {
        Self {
            run_id: format!("run-{}", Uuid::now_v7()),
            started_at,
            finished_at,
            from_version,
            to_version,
            final_version: result.final_version,
            success: result.success,
            message: result.message.clone(),
            steps_executed: result.steps_executed.clone(),
        }
    }
}

/// Append-only JSON-lines record of migration runs.
#[derive(Debug, Clone)]
pub struct History {
    path: PathBuf,
}

impl History {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(entry).map_err(HistoryError::Encode)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    pub fn read(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str(line).map_err(|source| HistoryError::Json {
                    line: index + 1,
                    source,
                })
            })
            .collect()
    }
}
