//! The unit of work the engine applies, and the values that flow through it.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;

pub const CANCELLED_ERROR: &str = "Migration cancelled";

/// Lifecycle phase of a single migration version, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepName {
    Before,
    Backup,
    Migrate,
    After,
}

impl StepName {
    pub const ALL: [StepName; 4] = [
        StepName::Before,
        StepName::Backup,
        StepName::Migrate,
        StepName::After,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::Before => "before",
            StepName::Backup => "backup",
            StepName::Migrate => "migrate",
            StepName::After => "after",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStepNameError {
    value: String,
}

impl fmt::Display for ParseStepNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown step: {}", self.value)
    }
}

impl Error for ParseStepNameError {}

impl FromStr for StepName {
    type Err = ParseStepNameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        StepName::ALL
            .into_iter()
            .find(|step| step.as_str() == value.trim())
            .ok_or_else(|| ParseStepNameError {
                value: value.to_string(),
            })
    }
}

/// Outcome of one lifecycle step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
            error: None,
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self::failed(CANCELLED_ERROR)
    }

    /// Result for an optional hook the migration does not define.
    pub fn not_defined(step: StepName) -> Self {
        Self::ok_with(format!("No {} step defined", step))
    }

    pub fn is_cancelled(&self) -> bool {
        !self.success && self.error.as_deref() == Some(CANCELLED_ERROR)
    }

    /// Best human-readable reason for a failure.
    pub fn reason(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

/// Input handed to every lifecycle step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationContext {
    pub project_root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
    pub from_version: u32,
    pub to_version: u32,
    #[serde(skip)]
    pub cancellation: CancellationToken,
}

impl MigrationContext {
    pub fn new(project_root: impl Into<PathBuf>, from_version: u32, to_version: u32) -> Self {
        Self {
            project_root: project_root.into(),
            backup_dir: None,
            from_version,
            to_version,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_backup_dir(mut self, backup_dir: Option<PathBuf>) -> Self {
        self.backup_dir = backup_dir;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Aggregate outcome of a `migrate(from, to)` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub steps_executed: Vec<String>,
    pub final_version: u32,
}

impl MigrationResult {
    pub fn succeeded(
        message: Option<String>,
        steps_executed: Vec<String>,
        final_version: u32,
    ) -> Self {
        Self {
            success: true,
            message,
            steps_executed,
            final_version,
        }
    }

    pub fn failed(
        message: impl Into<String>,
        steps_executed: Vec<String>,
        final_version: u32,
    ) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            steps_executed,
            final_version,
        }
    }
}

/// A versioned transformation of a project's on-disk schema.
///
/// Only [`Migration::migrate`] is mandatory. The optional hooks report whether
/// they exist through [`Migration::provides`]; a hook that is not provided is
/// never logged by the executor and, if called anyway, answers with
/// [`StepResult::not_defined`].
pub trait Migration: Send + Sync {
    /// Schema version the project is at once this migration has been applied.
    fn version(&self) -> u32;

    fn description(&self) -> &str {
        ""
    }

    fn provides(&self, step: StepName) -> bool {
        step == StepName::Migrate
    }

    fn before(&self, _ctx: &MigrationContext) -> StepResult {
        StepResult::not_defined(StepName::Before)
    }

    fn backup(&self, _ctx: &MigrationContext) -> StepResult {
        StepResult::not_defined(StepName::Backup)
    }

    fn migrate(&self, ctx: &MigrationContext) -> StepResult;

    fn after(&self, _ctx: &MigrationContext) -> StepResult {
        StepResult::not_defined(StepName::After)
    }

    /// Cooperative cancellation hook. Errors are logged and otherwise ignored.
    fn cancel(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Dispatches `step` on `migration`, checking the token before and after and
/// converting a panicking hook into a failed result.
pub fn execute_step(
    migration: &dyn Migration,
    step: StepName,
    ctx: &MigrationContext,
) -> StepResult {
    if ctx.is_cancelled() {
        return StepResult::cancelled();
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match step {
        StepName::Before => migration.before(ctx),
        StepName::Backup => migration.backup(ctx),
        StepName::Migrate => migration.migrate(ctx),
        StepName::After => migration.after(ctx),
    }));

    let result = match outcome {
        Ok(result) => result,
        Err(payload) => StepResult::failed(panic_message(payload.as_ref())),
    };

    if ctx.is_cancelled() {
        return StepResult::cancelled();
    }
    result
}

/// Calls the migration's cancel hook, swallowing errors and panics.
pub(crate) fn invoke_cancel_hook(migration: &dyn Migration) {
    match panic::catch_unwind(AssertUnwindSafe(|| migration.cancel())) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(version = migration.version(), error = %err, "cancel hook failed");
        }
        Err(payload) => {
            tracing::warn!(
                version = migration.version(),
                error = %panic_message(payload.as_ref()),
                "cancel hook panicked"
            );
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "migration step panicked".to_string()
    }
}
