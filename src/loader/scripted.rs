use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;

use super::{in_range, MigrationSource};
use crate::backup;
use crate::migration::{Migration, MigrationContext, StepName, StepResult};

pub const MANIFEST_FILE: &str = "migration.toml";
const SNAPSHOT_BUILTIN: &str = "snapshot";
const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// A cancel hook still running after this long is killed.
pub const CANCEL_HOOK_LIMIT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum LoadError {
    Io { path: PathBuf, source: std::io::Error },
    Toml(toml::de::Error),
    InvalidManifest(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io { path, source } => {
                write!(f, "unable to read '{}': {}", path.display(), source)
            }
            LoadError::Toml(err) => write!(f, "invalid migration manifest: {}", err),
            LoadError::InvalidManifest(message) => {
                write!(f, "invalid migration manifest: {}", message)
            }
        }
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LoadError::Io { source, .. } => Some(source),
            LoadError::Toml(err) => Some(err),
            LoadError::InvalidManifest(_) => None,
        }
    }
}

impl From<toml::de::Error> for LoadError {
    fn from(value: toml::de::Error) -> Self {
        LoadError::Toml(value)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScriptedManifest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub hooks: ManifestHooks,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ManifestHooks {
    pub before: Option<HookSpec>,
    pub backup: Option<HookSpec>,
    pub migrate: Option<HookSpec>,
    pub after: Option<HookSpec>,
    pub cancel: Option<HookSpec>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HookSpec {
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub builtin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HookAction {
    Command { program: String, args: Vec<String> },
    Snapshot,
}

impl HookSpec {
    fn resolve(&self, hook: &str) -> Result<HookAction, LoadError> {
        match (self.program.as_deref(), self.builtin.as_deref()) {
            (Some(program), None) if !program.trim().is_empty() => Ok(HookAction::Command {
                program: program.to_string(),
                args: self.args.clone(),
            }),
            (None, Some(SNAPSHOT_BUILTIN)) if hook == "backup" => Ok(HookAction::Snapshot),
            (None, Some(other)) => Err(LoadError::InvalidManifest(format!(
                "builtin '{}' is not available for the {} hook",
                other, hook
            ))),
            (Some(_), Some(_)) => Err(LoadError::InvalidManifest(format!(
                "{} hook sets both program and builtin",
                hook
            ))),
            _ => Err(LoadError::InvalidManifest(format!(
                "{} hook needs a program or a builtin",
                hook
            ))),
        }
    }
}

/// Migration whose hooks are external commands declared in a manifest.
#[derive(Debug)]
pub struct ScriptedMigration {
    version: u32,
    dir: PathBuf,
    description: String,
    hooks: HashMap<StepName, HookAction>,
    cancel_hook: Option<HookAction>,
    cancel_limit: Duration,
}

impl ScriptedMigration {
    pub fn open(dir: &Path) -> Result<Self, LoadError> {
        let version = dir
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(version_from_dir_name)
            .ok_or_else(|| {
                LoadError::InvalidManifest(format!(
                    "directory '{}' is not named after a version",
                    dir.display()
                ))
            })?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&manifest_path).map_err(|source| LoadError::Io {
            path: manifest_path.clone(),
            source,
        })?;
        let manifest: ScriptedManifest = toml::from_str(&raw)?;
        Self::from_manifest(version, dir.to_path_buf(), manifest)
    }

    pub fn from_manifest(
        version: u32,
        dir: PathBuf,
        manifest: ScriptedManifest,
    ) -> Result<Self, LoadError> {
        let ManifestHooks {
            before,
            backup,
            migrate,
            after,
            cancel,
        } = manifest.hooks;

        let Some(migrate) = migrate else {
            return Err(LoadError::InvalidManifest(
                "a migrate hook is required".to_string(),
            ));
        };

        let mut hooks = HashMap::new();
        for (step, spec) in [
            (StepName::Before, before),
            (StepName::Backup, backup),
            (StepName::Migrate, Some(migrate)),
            (StepName::After, after),
        ] {
            if let Some(spec) = spec {
                hooks.insert(step, spec.resolve(step.as_str())?);
            }
        }
        let cancel_hook = cancel.map(|spec| spec.resolve("cancel")).transpose()?;

        Ok(Self {
            version,
            dir,
            description: manifest.description.trim().to_string(),
            hooks,
            cancel_hook,
            cancel_limit: CANCEL_HOOK_LIMIT,
        })
    }

    pub fn with_cancel_limit(mut self, limit: Duration) -> Self {
        self.cancel_limit = limit;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn run_hook(&self, step: StepName, ctx: &MigrationContext) -> StepResult {
        match self.hooks.get(&step) {
            None => StepResult::not_defined(step),
            Some(HookAction::Snapshot) => snapshot_backup(ctx),
            Some(HookAction::Command { program, args }) => {
                run_command(&self.dir, program, args, step.as_str(), Some(ctx), None)
            }
        }
    }
}

impl Migration for ScriptedMigration {
    fn version(&self) -> u32 {
        self.version
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn provides(&self, step: StepName) -> bool {
        self.hooks.contains_key(&step)
    }

    fn before(&self, ctx: &MigrationContext) -> StepResult {
        self.run_hook(StepName::Before, ctx)
    }

    fn backup(&self, ctx: &MigrationContext) -> StepResult {
        self.run_hook(StepName::Backup, ctx)
    }

    fn migrate(&self, ctx: &MigrationContext) -> StepResult {
        self.run_hook(StepName::Migrate, ctx)
    }

    fn after(&self, ctx: &MigrationContext) -> StepResult {
        self.run_hook(StepName::After, ctx)
    }

    fn cancel(&self) -> Result<(), String> {
        match &self.cancel_hook {
            Some(HookAction::Command { program, args }) => {
                let result = run_command(
                    &self.dir,
                    program,
                    args,
                    "cancel",
                    None,
                    Some(self.cancel_limit),
                );
                if result.success {
                    Ok(())
                } else {
                    Err(result.reason())
                }
            }
            _ => Ok(()),
        }
    }
}

fn snapshot_backup(ctx: &MigrationContext) -> StepResult {
    let Some(backup_dir) = ctx.backup_dir.as_deref() else {
        return StepResult::failed("snapshot backup requires a backup directory");
    };
    match backup::create_snapshot(&ctx.project_root, backup_dir, ctx.from_version) {
        Ok(snapshot) => StepResult::ok_with(format!(
            "snapshot of {} file(s) written to {}",
            snapshot.file_count,
            snapshot.path.display()
        )),
        Err(err) => StepResult::failed(format!("snapshot backup failed: {}", err)),
    }
}

fn run_command(
    cwd: &Path,
    program: &str,
    args: &[String],
    step: &str,
    ctx: Option<&MigrationContext>,
    limit: Option<Duration>,
) -> StepResult {
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .env("CARDS_STEP", step)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(ctx) = ctx {
        command
            .env("CARDS_PROJECT_ROOT", &ctx.project_root)
            .env("CARDS_FROM_VERSION", ctx.from_version.to_string())
            .env("CARDS_TO_VERSION", ctx.to_version.to_string());
        if let Some(backup_dir) = ctx.backup_dir.as_deref() {
            command.env("CARDS_BACKUP_DIR", backup_dir);
        }
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => return StepResult::failed(format!("unable to start '{}': {}", program, err)),
    };

    let stdout = child.stdout.take().map(|pipe| drain_lines(pipe, step, false));
    let stderr = child.stderr.take().map(|pipe| drain_lines(pipe, step, true));

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {}
            Err(err) => break Err(err),
        }
        if ctx.is_some_and(MigrationContext::is_cancelled) {
            tracing::info!(step, program, "killing hook command after cancellation");
            let _ = child.kill();
            let _ = child.wait();
            return StepResult::cancelled();
        }
        if let Some(limit) = limit.filter(|limit| started.elapsed() >= *limit) {
            tracing::warn!(step, program, "killing hook command after time limit");
            let _ = child.kill();
            let _ = child.wait();
            return StepResult::failed(format!(
                "{} hook timed out after {}s",
                step,
                limit.as_secs_f64()
            ));
        }
        thread::sleep(POLL_INTERVAL);
    };

    if let Some(handle) = stdout {
        let _ = handle.join();
    }
    let last_stderr = stderr
        .and_then(|handle| handle.join().ok())
        .flatten()
        .unwrap_or_default();

    match status {
        Ok(status) if status.success() => StepResult::ok_with(format!("{} hook completed", step)),
        Ok(status) => StepResult::failed(exit_failure(step, status, &last_stderr)),
        Err(err) => StepResult::failed(format!("waiting for {} hook failed: {}", step, err)),
    }
}

fn exit_failure(step: &str, status: ExitStatus, last_stderr: &str) -> String {
    if last_stderr.is_empty() {
        format!("{} hook exited with {}", step, status)
    } else {
        format!("{} hook exited with {}: {}", step, status, last_stderr)
    }
}

/// Forwards a pipe to the log; returns the last non-empty line.
fn drain_lines(
    pipe: impl Read + Send + 'static,
    step: &str,
    is_stderr: bool,
) -> thread::JoinHandle<Option<String>> {
    let step = step.to_string();
    thread::spawn(move || {
        let mut last = None;
        for line in BufReader::new(pipe).lines().map_while(Result::ok) {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if is_stderr {
                tracing::warn!(step = %step, "{}", trimmed);
            } else {
                tracing::debug!(step = %step, "{}", trimmed);
            }
            last = Some(trimmed.to_string());
        }
        last
    })
}

/// Only canonical names count: `2` is version 2, `02` and `+2` are not.
fn version_from_dir_name(name: &str) -> Option<u32> {
    let version = name.parse::<u32>().ok().filter(|version| *version > 0)?;
    (version.to_string() == name).then_some(version)
}

/// Directory of `<version>/migration.toml` migrations.
#[derive(Debug, Clone)]
pub struct ScriptedSource {
    root: PathBuf,
}

impl ScriptedSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn all_versions(&self) -> Vec<u32> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!(path = %self.root.display(), error = %err, "no migrations directory");
                return Vec::new();
            }
        };

        let mut versions = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| version_from_dir_name(entry.file_name().to_str()?))
            .collect::<Vec<_>>();
        versions.sort_unstable();
        versions.dedup();
        versions
    }
}

impl MigrationSource for ScriptedSource {
    fn discover(&self, from: u32, to: u32) -> Vec<u32> {
        self.all_versions()
            .into_iter()
            .filter(|version| in_range(*version, from, to))
            .collect()
    }

    fn locate(&self, version: u32) -> Option<String> {
        let dir = self.root.join(version.to_string());
        dir.is_dir().then(|| dir.to_string_lossy().into_owned())
    }

    fn load_path(&self, path: &str) -> Option<Arc<dyn Migration>> {
        match ScriptedMigration::open(Path::new(path)) {
            Ok(migration) => Some(Arc::new(migration)),
            Err(err) => {
                tracing::error!(path, error = %err, "failed to load migration");
                None
            }
        }
    }
}
