use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use cardmig::backup::{self, BackupError, SnapshotSummary};
use cardmig::history::{History, HistoryEntry, HistoryError};
use cardmig::loader::{MigrationSource, ScriptedSource};
use cardmig::locks::{LockError, ProjectLock};
use cardmig::preflight::{PreflightError, SpaceReport};
use cardmig::project::{ProjectError, ProjectStore, HISTORY_FILE, LOCK_FILE};
use cardmig::settings::{Settings, SettingsError};
use cardmig::timestamps::now_utc_rfc3339;
use cardmig::{MigrationExecutor, MigrationResult};

pub struct MigrationApp {
    project: ProjectStore,
    settings: Settings,
    source: Arc<ScriptedSource>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusView {
    pub project_root: PathBuf,
    pub schema_version: u32,
    pub latest_available: Option<u32>,
    pub pending: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MigrationView {
    pub version: u32,
    pub description: Option<String>,
    pub path: Option<String>,
    pub loadable: bool,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckView {
    pub schema_version: u32,
    pub target_version: u32,
    pub pending: Vec<u32>,
    pub space: SpaceReport,
    pub sufficient: bool,
}

/// Command-line overrides layered over `.cards/migrate.toml`.
#[derive(Debug, Clone, Default)]
pub struct MigrateRequest {
    pub from: Option<u32>,
    pub to: Option<u32>,
    pub backup_dir: Option<PathBuf>,
    pub no_backup: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MigrateOutcome {
    pub from_version: u32,
    pub to_version: u32,
    pub result: MigrationResult,
    pub run_id: Option<String>,
}

impl MigrationApp {
    pub fn open(project_root: PathBuf) -> Result<Self, AppError> {
        let settings = Settings::load(&project_root)?;
        let source = Arc::new(ScriptedSource::new(settings.migrations_dir.clone()));
        Ok(Self {
            project: ProjectStore::new(project_root),
            settings,
            source,
        })
    }

    pub fn status(&self) -> Result<StatusView, AppError> {
        let schema_version = self.project.schema_version()?;
        Ok(StatusView {
            project_root: self.project.root().to_path_buf(),
            schema_version,
            latest_available: self.source.latest(),
            pending: self.source.discover(schema_version, u32::MAX),
        })
    }

    pub fn list_migrations(&self) -> Result<Vec<MigrationView>, AppError> {
        let schema_version = self.project.schema_version()?;
        let views = self
            .source
            .discover(0, u32::MAX)
            .into_iter()
            .map(|version| {
                let migration = self.source.load(version);
                MigrationView {
                    version,
                    description: migration
                        .as_ref()
                        .map(|migration| migration.description().to_string())
                        .filter(|description| !description.is_empty()),
                    path: self.source.locate(version),
                    loadable: migration.is_some(),
                    applied: version <= schema_version,
                }
            })
            .collect();
        Ok(views)
    }

    pub fn check(&self, to: Option<u32>) -> Result<CheckView, AppError> {
        let schema_version = self.project.schema_version()?;
        let target_version = to
            .or_else(|| self.source.latest())
            .unwrap_or(schema_version)
            .max(schema_version);
        let space = self.executor(None).preflight()?;
        Ok(CheckView {
            schema_version,
            target_version,
            pending: self.source.discover(schema_version, target_version),
            sufficient: space.is_sufficient(),
            space,
        })
    }

    /// Holds the project lock for the whole run and records it in history.
    pub fn migrate<F>(
        &self,
        request: &MigrateRequest,
        mut on_version_applied: F,
    ) -> Result<MigrateOutcome, AppError>
    where
        F: FnMut(u32),
    {
        let _lock = ProjectLock::acquire(
            &self.project.root().join(LOCK_FILE),
            self.settings.lock_timeout,
            self.settings.stale_lock_after,
        )?;

        let from = match request.from {
            Some(version) => version,
            None => self.project.schema_version()?,
        };
        let to = match request.to {
            Some(version) => version,
            None => match self.source.latest() {
                Some(latest) if latest > from => latest,
                _ => {
                    tracing::info!(version = from, "no pending migrations");
                    return Ok(MigrateOutcome {
                        from_version: from,
                        to_version: from,
                        result: MigrationResult::succeeded(
                            Some(format!("Schema version {} is up to date", from)),
                            Vec::new(),
                            from,
                        ),
                        run_id: None,
                    });
                }
            },
        };

        let backup_dir = if request.no_backup {
            None
        } else {
            request
                .backup_dir
                .as_ref()
                .map(|dir| self.project.root().join(dir))
                .or_else(|| self.settings.backup_dir.clone())
        };

        let mut executor = self
            .executor(backup_dir)
            .with_step_timeout(request.timeout.or(self.settings.step_timeout));

        let started_at = now_utc_rfc3339();
        let result = executor.migrate(from, to, |version| {
            on_version_applied(version);
            Ok(())
        });
        let finished_at = now_utc_rfc3339();

        let entry = HistoryEntry::from_result(started_at, finished_at, from, to, &result);
        self.history_log().append(&entry)?;

        Ok(MigrateOutcome {
            from_version: from,
            to_version: to,
            result,
            run_id: Some(entry.run_id),
        })
    }

    pub fn snapshots(&self) -> Result<Vec<SnapshotSummary>, AppError> {
        Ok(backup::list_snapshots(&self.backup_dir()?)?)
    }

    pub fn restore(&self, snapshot: &Path, confirmed: bool) -> Result<SnapshotSummary, AppError> {
        if !confirmed {
            return Err(AppError::InvalidArgument(
                "restore overwrites the project; pass --yes to confirm".to_string(),
            ));
        }
        let snapshot_dir = if snapshot.is_dir() {
            snapshot.to_path_buf()
        } else {
            self.backup_dir()?.join(snapshot)
        };

        let _lock = ProjectLock::acquire(
            &self.project.root().join(LOCK_FILE),
            self.settings.lock_timeout,
            self.settings.stale_lock_after,
        )?;
        Ok(backup::restore_snapshot(&snapshot_dir, self.project.root())?)
    }

    pub fn history(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>, AppError> {
        let mut entries = self.history_log().read()?;
        if let Some(limit) = limit {
            let skip = entries.len().saturating_sub(limit);
            entries.drain(..skip);
        }
        Ok(entries)
    }

    fn executor(&self, backup_dir: Option<PathBuf>) -> MigrationExecutor {
        MigrationExecutor::new(
            self.project.root(),
            Arc::clone(&self.source) as Arc<dyn MigrationSource>,
        )
        .with_backup_dir(backup_dir)
        .with_safety_factor(self.settings.safety_factor)
    }

    fn backup_dir(&self) -> Result<PathBuf, AppError> {
        self.settings.backup_dir.clone().ok_or_else(|| {
            AppError::InvalidArgument("no backup directory is configured".to_string())
        })
    }

    fn history_log(&self) -> History {
        History::new(self.project.root().join(HISTORY_FILE))
    }
}

#[derive(Debug)]
pub enum AppError {
    Io(std::io::Error),
    Settings(SettingsError),
    Project(ProjectError),
    Preflight(PreflightError),
    Lock(LockError),
    Backup(BackupError),
    History(HistoryError),
    InvalidArgument(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Io(err) => write!(f, "I/O error: {}", err),
            AppError::Settings(err) => write!(f, "{}", err),
            AppError::Project(err) => write!(f, "project error: {}", err),
            AppError::Preflight(err) => write!(f, "disk space check failed: {}", err),
            AppError::Lock(err) => write!(f, "{}", err),
            AppError::Backup(err) => write!(f, "backup error: {}", err),
            AppError::History(err) => write!(f, "history error: {}", err),
            AppError::InvalidArgument(message) => write!(f, "{}", message),
        }
    }
}

impl Error for AppError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AppError::Io(err) => Some(err),
            AppError::Settings(err) => Some(err),
            AppError::Project(err) => Some(err),
            AppError::Preflight(err) => Some(err),
            AppError::Lock(err) => Some(err),
            AppError::Backup(err) => Some(err),
            AppError::History(err) => Some(err),
            AppError::InvalidArgument(_) => None,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        AppError::Io(value)
    }
}

impl From<SettingsError> for AppError {
    fn from(value: SettingsError) -> Self {
        AppError::Settings(value)
    }
}

impl From<ProjectError> for AppError {
    fn from(value: ProjectError) -> Self {
        AppError::Project(value)
    }
}

impl From<PreflightError> for AppError {
    fn from(value: PreflightError) -> Self {
        AppError::Preflight(value)
    }
}

impl From<LockError> for AppError {
    fn from(value: LockError) -> Self {
        AppError::Lock(value)
    }
}

impl From<BackupError> for AppError {
    fn from(value: BackupError) -> Self {
        AppError::Backup(value)
    }
}

impl From<HistoryError> for AppError {
    fn from(value: HistoryError) -> Self {
        AppError::History(value)
    }
}
