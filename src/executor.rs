//! Orchestration of a `from -> to` migration run.
//!
//! The executor applies every discovered version in ascending order. For each
//! version it runs `before`, `backup`, `migrate` and `after`, stamps the new
//! schema version, validates the project, and reports progress to the caller.
//! Only `migrate` runs in the isolated [`StepRunner`]; the other hooks run on
//! the calling thread. Every expected failure is returned in the
//! [`MigrationResult`], whose `steps_executed` records how far the run got.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::loader::MigrationSource;
use crate::migration::{
    execute_step, MigrationContext, MigrationResult, StepName, StepResult, CANCELLED_ERROR,
};
use crate::preflight::{
    measure_project, FilesystemProbe, PreflightError, SpaceProbe, SpaceReport,
    DEFAULT_SAFETY_FACTOR,
};
use crate::project::ProjectStore;
use crate::runner::{self, StepRunner};

pub const STEP_PRE_VALIDATION: &str = "pre-validation";
pub const STEP_DISK_SPACE_CHECK: &str = "disk-space-check";
pub const STEP_MIGRATION_VERSIONS: &str = "migration-versions";

type TokenSlot = Arc<Mutex<CancellationToken>>;

pub struct MigrationExecutor {
    project: ProjectStore,
    source: Arc<dyn MigrationSource>,
    runner: StepRunner,
    backup_dir: Option<PathBuf>,
    safety_factor: f64,
    space_probe: Box<dyn SpaceProbe>,
    token: TokenSlot,
}

impl MigrationExecutor {
    pub fn new(project_root: impl Into<PathBuf>, source: Arc<dyn MigrationSource>) -> Self {
        Self {
            project: ProjectStore::new(project_root),
            runner: StepRunner::new(Arc::clone(&source)),
            source,
            backup_dir: None,
            safety_factor: DEFAULT_SAFETY_FACTOR,
            space_probe: Box::new(FilesystemProbe),
            token: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Enables the `backup` step. `None` skips it for every version.
    pub fn with_backup_dir(mut self, backup_dir: Option<PathBuf>) -> Self {
        self.backup_dir = backup_dir;
        self
    }

    pub fn with_safety_factor(mut self, safety_factor: f64) -> Self {
        self.safety_factor = safety_factor;
        self
    }

    pub fn with_space_probe(mut self, probe: impl SpaceProbe + 'static) -> Self {
        self.space_probe = Box::new(probe);
        self
    }

    /// Hard limit for one isolated `migrate` step.
    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.runner.set_timeout(timeout);
        self
    }

    pub fn project(&self) -> &ProjectStore {
        &self.project
    }

    pub fn project_root(&self) -> &Path {
        self.project.root()
    }

    pub fn cancel_handle(&self) -> ExecutorCancelHandle {
        ExecutorCancelHandle {
            token: Arc::clone(&self.token),
            runner: self.runner.cancel_handle(),
        }
    }

    /// Read-only disk space estimate for the project.
    pub fn preflight(&self) -> Result<SpaceReport, PreflightError> {
        measure_project(
            self.project.root(),
            self.backup_dir.as_deref(),
            self.safety_factor,
            self.space_probe.as_ref(),
        )
    }

    /// Applies every available migration in `(from, to]`.
    ///
    /// `on_version_applied` runs after each version is stamped and validated
    /// and before the next version starts. An `Err` from it fails the run.
    pub fn migrate<F>(&mut self, from: u32, to: u32, mut on_version_applied: F) -> MigrationResult
    where
        F: FnMut(u32) -> Result<(), String>,
    {
        let token = self.fresh_token();
        let mut run = Run::new(from);

        if from >= to {
            tracing::warn!(from, to, "rejecting migration range");
            return run.fail(format!(
                "Invalid version range: source version {} is not lower than target version {}",
                from, to
            ));
        }
        run.log(STEP_PRE_VALIDATION);

        match self.preflight() {
            Ok(report) if report.is_sufficient() => {
                tracing::debug!(
                    required = report.required_bytes,
                    available = report.available_bytes,
                    "disk space check passed"
                );
            }
            Ok(report) => {
                tracing::error!(
                    required = report.required_bytes,
                    available = report.available_bytes,
                    "insufficient disk space for migration"
                );
                return run.fail(report.insufficiency_message());
            }
            Err(err) => {
                tracing::error!(error = %err, "disk space check failed");
                return run.fail(format!("Disk space check failed: {}", err));
            }
        }
        run.log(STEP_DISK_SPACE_CHECK);

        let versions = self.source.discover(from, to);
        run.log(STEP_MIGRATION_VERSIONS);
        tracing::info!(from, to, ?versions, "migrations discovered");

        if versions.is_empty() {
            return run.succeed(format!(
                "No migrations found between version {} and {}; schema version stays at {}",
                from, to, from
            ));
        }

        for version in versions {
            if token.is_cancelled() {
                tracing::warn!(version, "migration cancelled before version started");
                return run.fail(CANCELLED_ERROR);
            }
            if let Err(message) = self.apply_version(&mut run, version, &token) {
                return run.fail(message);
            }
            if let Err(err) = on_version_applied(version) {
                tracing::error!(version, error = %err, "progress callback failed");
                return run.fail(format!(
                    "Progress callback failed after version {}: {}",
                    version, err
                ));
            }
        }

        let reached = run.final_version;
        if reached < to {
            run.succeed(format!(
                "Migrated from version {} to {}; no migrations available beyond version {} up to {}",
                from, reached, reached, to
            ))
        } else {
            run.succeed(format!("Migrated from version {} to {}", from, to))
        }
    }

    fn apply_version(
        &mut self,
        run: &mut Run,
        version: u32,
        token: &CancellationToken,
    ) -> Result<(), String> {
        let located = self.source.locate(version);
        let (Some(path), Some(migration)) = (located, self.source.load(version)) else {
            tracing::error!(version, "unable to load migration");
            return Err(format!("Failed to load migration for version {}", version));
        };

        let mut ctx = MigrationContext::new(self.project.root(), run.final_version, version)
            .with_backup_dir(self.backup_dir.clone());
        ctx.cancellation = token.clone();

        tracing::info!(
            version,
            description = migration.description(),
            "applying migration"
        );

        if migration.provides(StepName::Before) {
            run.log(step_label(version, StepName::Before));
            let result = execute_step(migration.as_ref(), StepName::Before, &ctx);
            check_step(version, StepName::Before, result)?;
        }

        if self.backup_dir.is_some() && migration.provides(StepName::Backup) {
            run.log(step_label(version, StepName::Backup));
            let result = execute_step(migration.as_ref(), StepName::Backup, &ctx);
            check_step(version, StepName::Backup, result)?;
        }

        run.log(step_label(version, StepName::Migrate));
        let result = self.runner.start(&path, StepName::Migrate, &ctx);
        check_step(version, StepName::Migrate, result)?;

        if migration.provides(StepName::After) {
            run.log(step_label(version, StepName::After));
            let result = execute_step(migration.as_ref(), StepName::After, &ctx);
            check_step(version, StepName::After, result)?;
        }

        run.log(format!("v{}:update-version", version));
        self.project.set_schema_version(version).map_err(|err| {
            tracing::error!(version, error = %err, "unable to record schema version");
            format!("Failed to record schema version {}: {}", version, err)
        })?;
        run.final_version = version;

        run.log(format!("v{}:validate", version));
        self.project.validate(version).map_err(|err| {
            tracing::error!(version, error = %err, "post-migration validation failed");
            format!("Validation failed after version {}: {}", version, err)
        })?;

        tracing::info!(version, "migration applied");
        Ok(())
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }
}

/// Cancels the executor's current run, including its in-flight isolated step.
#[derive(Clone)]
pub struct ExecutorCancelHandle {
    token: TokenSlot,
    runner: runner::CancelHandle,
}

impl ExecutorCancelHandle {
    pub fn cancel(&self) {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        self.runner.cancel();
    }
}

struct Run {
    steps: Vec<String>,
    final_version: u32,
}

impl Run {
    fn new(from: u32) -> Self {
        Self {
            steps: Vec::new(),
            final_version: from,
        }
    }

    fn log(&mut self, step: impl Into<String>) {
        let step = step.into();
        tracing::debug!(step = %step, "step started");
        self.steps.push(step);
    }

    fn fail(self, message: impl Into<String>) -> MigrationResult {
        MigrationResult::failed(message, self.steps, self.final_version)
    }

    fn succeed(self, message: String) -> MigrationResult {
        MigrationResult::succeeded(Some(message), self.steps, self.final_version)
    }
}

fn step_label(version: u32, step: StepName) -> String {
    format!("v{}:{}", version, step)
}

fn check_step(version: u32, step: StepName, result: StepResult) -> Result<(), String> {
    if result.success {
        if let Some(message) = result.message.as_deref() {
            tracing::debug!(version, step = %step, message, "step completed");
        }
        return Ok(());
    }
    if result.is_cancelled() {
        tracing::warn!(version, step = %step, "step cancelled");
        return Err(CANCELLED_ERROR.to_string());
    }
    let reason = result.reason();
    tracing::error!(version, step = %step, error = %reason, "step failed");
    Err(format!("Version {} {} step failed: {}", version, step, reason))
}

#[cfg(test)]
mod tests;
