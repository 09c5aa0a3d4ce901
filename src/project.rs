//! Project layout on disk and schema-version bookkeeping.

use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

pub const CARDS_DIR: &str = ".cards";
pub const CONFIG_FILE: &str = ".cards/local/cardsConfig.json";
pub const SETTINGS_FILE: &str = ".cards/migrate.toml";
pub const MIGRATIONS_DIR: &str = ".cards/migrations";
pub const BACKUPS_DIR: &str = ".cards/backups";
pub const LOCKS_DIR: &str = ".cards/locks";
pub const LOCK_FILE: &str = ".cards/locks/migration.lock";
pub const HISTORY_FILE: &str = ".cards/local/migration-history.jsonl";

const SCHEMA_VERSION_KEY: &str = "schemaVersion";
const DEFAULT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub enum ProjectError {
    Io(std::io::Error),
    Json(serde_json::Error),
    MissingConfig(PathBuf),
    InvalidConfig(String),
}

impl fmt::Display for ProjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectError::Io(err) => write!(f, "I/O error: {}", err),
            ProjectError::Json(err) => write!(f, "invalid project configuration: {}", err),
            ProjectError::MissingConfig(path) => {
                write!(f, "project configuration not found at {}", path.display())
            }
            ProjectError::InvalidConfig(message) => {
                write!(f, "invalid project configuration: {}", message)
            }
        }
    }
}

impl Error for ProjectError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProjectError::Io(err) => Some(err),
            ProjectError::Json(err) => Some(err),
            ProjectError::MissingConfig(_) => None,
            ProjectError::InvalidConfig(_) => None,
        }
    }
}

impl From<std::io::Error> for ProjectError {
    fn from(value: std::io::Error) -> Self {
        ProjectError::Io(value)
    }
}

impl From<serde_json::Error> for ProjectError {
    fn from(value: serde_json::Error) -> Self {
        ProjectError::Json(value)
    }
}

/// Card project rooted at a directory, seen only through its schema version.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    root: PathBuf,
}

impl ProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn schema_version(&self) -> Result<u32, ProjectError> {
        let config = self.read_config()?;
        schema_version_of(&config)
    }

    /// Rewrites `schemaVersion`, keeping every other configuration field.
    pub fn set_schema_version(&self, version: u32) -> Result<(), ProjectError> {
        let mut config = self.read_config()?;
        config.insert(SCHEMA_VERSION_KEY.to_string(), Value::from(version));

        let path = self.config_path();
        let tmp = path.with_extension("json.tmp");
        let mut payload = serde_json::to_vec_pretty(&Value::Object(config))?;
        payload.push(b'\n');
        std::fs::write(&tmp, payload)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!(version, path = %path.display(), "schema version written");
        Ok(())
    }

    /// Post-step consistency check: the project is readable and stamped with `version`.
    pub fn validate(&self, version: u32) -> Result<(), ProjectError> {
        if !self.root.is_dir() {
            return Err(ProjectError::InvalidConfig(format!(
                "project root {} is not a directory",
                self.root.display()
            )));
        }
        let current = self.schema_version()?;
        if current != version {
            return Err(ProjectError::InvalidConfig(format!(
                "expected schema version {} but found {}",
                version, current
            )));
        }
        Ok(())
    }

    fn read_config(&self) -> Result<Map<String, Value>, ProjectError> {
        let path = self.config_path();
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProjectError::MissingConfig(path));
            }
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice::<Value>(&raw)? {
            Value::Object(map) => Ok(map),
            _ => Err(ProjectError::InvalidConfig(
                "configuration must be a JSON object".to_string(),
            )),
        }
    }
}

fn schema_version_of(config: &Map<String, Value>) -> Result<u32, ProjectError> {
    match config.get(SCHEMA_VERSION_KEY) {
        None | Some(Value::Null) => Ok(DEFAULT_SCHEMA_VERSION),
        Some(value) => value
            .as_u64()
            .and_then(|raw| u32::try_from(raw).ok())
            .ok_or_else(|| {
                ProjectError::InvalidConfig(format!(
                    "'{}' must be a non-negative integer, got {}",
                    SCHEMA_VERSION_KEY, value
                ))
            }),
    }
}
