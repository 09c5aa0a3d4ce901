use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::MigrationExecutor;
use crate::loader::{MigrationRegistry, MigrationSource};
use crate::migration::{Migration, MigrationContext, MigrationResult, StepName, StepResult};
use crate::preflight::SpaceProbe;
use crate::project::{ProjectStore, CONFIG_FILE};

const PLENTY: u64 = 1 << 40;

struct FixedProbe(u64);

impl SpaceProbe for FixedProbe {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

struct BrokenProbe;

impl SpaceProbe for BrokenProbe {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Err(io::Error::other("statvfs unavailable"))
    }
}

type CallLog = Arc<Mutex<Vec<String>>>;

fn record(log: &CallLog, entry: String) {
    log.lock().expect("call log lock").push(entry);
}

fn calls(log: &CallLog) -> Vec<String> {
    log.lock().expect("call log lock").clone()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Failure {
    Never,
    PanicIn(StepName),
    FailIn(StepName),
    WaitForCancel,
}

#[derive(Clone)]
struct Fake {
    version: u32,
    hooks: &'static [StepName],
    failure: Failure,
    armed: Arc<AtomicBool>,
    log: CallLog,
    cancel_calls: Arc<AtomicUsize>,
}

impl Fake {
    fn run(&self, step: StepName, ctx: &MigrationContext) -> StepResult {
        record(&self.log, format!("v{}:{}", self.version, step));
        let armed = self.armed.load(Ordering::SeqCst);
        match self.failure {
            Failure::PanicIn(target) if armed && target == step => {
                panic!("{} hook exploded for v{}", step, self.version)
            }
            Failure::FailIn(target) if armed && target == step => {
                StepResult::failed(format!("{} refused at v{}", step, self.version))
            }
            Failure::WaitForCancel if armed && step == StepName::Migrate => {
                let deadline = Instant::now() + Duration::from_secs(5);
                while Instant::now() < deadline {
                    if ctx.is_cancelled() {
                        return StepResult::cancelled();
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                StepResult::ok()
            }
            _ => StepResult::ok_with(format!("{} done", step)),
        }
    }
}

impl Migration for Fake {
    fn version(&self) -> u32 {
        self.version
    }

    fn provides(&self, step: StepName) -> bool {
        step == StepName::Migrate || self.hooks.contains(&step)
    }

    fn before(&self, ctx: &MigrationContext) -> StepResult {
        self.run(StepName::Before, ctx)
    }

    fn backup(&self, ctx: &MigrationContext) -> StepResult {
        self.run(StepName::Backup, ctx)
    }

    fn migrate(&self, ctx: &MigrationContext) -> StepResult {
        self.run(StepName::Migrate, ctx)
    }

    fn after(&self, ctx: &MigrationContext) -> StepResult {
        self.run(StepName::After, ctx)
    }

    fn cancel(&self) -> Result<(), String> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    root: PathBuf,
    log: CallLog,
    armed: Arc<AtomicBool>,
    cancel_calls: Arc<AtomicUsize>,
    registry: MigrationRegistry,
}

impl Harness {
    fn new(prefix: &str, schema_version: u32) -> Self {
        let root = std::env::temp_dir().join(format!("cardmig-{}-{}", prefix, Uuid::now_v7()));
        let config = root.join(CONFIG_FILE);
        fs::create_dir_all(config.parent().expect("config has a parent")).expect("project dirs");
        fs::write(
            &config,
            format!(
                "{{\"schemaVersion\": {}, \"projectName\": \"demo\"}}\n",
                schema_version
            ),
        )
        .expect("config should write");
        fs::write(root.join("cards.txt"), "card one\ncard two\n").expect("card file");

        Self {
            root,
            log: Arc::new(Mutex::new(Vec::new())),
            armed: Arc::new(AtomicBool::new(true)),
            cancel_calls: Arc::new(AtomicUsize::new(0)),
            registry: MigrationRegistry::new(),
        }
    }

    fn add(&mut self, version: u32, hooks: &'static [StepName], failure: Failure) -> &mut Self {
        let fake = Fake {
            version,
            hooks,
            failure,
            armed: Arc::clone(&self.armed),
            log: Arc::clone(&self.log),
            cancel_calls: Arc::clone(&self.cancel_calls),
        };
        self.registry
            .register(version, move || Arc::new(fake.clone()) as Arc<dyn Migration>)
            .expect("register fake migration");
        self
    }

    fn executor(&self) -> MigrationExecutor {
        self.executor_with(Arc::new(self.registry.clone()))
    }

    fn executor_with(&self, source: Arc<dyn MigrationSource>) -> MigrationExecutor {
        MigrationExecutor::new(&self.root, source).with_space_probe(FixedProbe(PLENTY))
    }

    fn schema_version(&self) -> u32 {
        ProjectStore::new(&self.root)
            .schema_version()
            .expect("schema version should read")
    }

    fn backup_dir(&self) -> PathBuf {
        self.root.join(".cards/backups")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn run(executor: &mut MigrationExecutor, from: u32, to: u32) -> (MigrationResult, Vec<u32>) {
    let mut applied = Vec::new();
    let result = executor.migrate(from, to, |version| {
        applied.push(version);
        Ok(())
    });
    (result, applied)
}

fn steps(result: &MigrationResult) -> Vec<&str> {
    result.steps_executed.iter().map(String::as_str).collect()
}

#[test]
fn rejects_non_ascending_ranges_without_side_effects() {
    let mut harness = Harness::new("exec-range", 3);
    harness.add(4, &[], Failure::Never);
    let mut executor = harness.executor();

    for (from, to) in [(3, 3), (4, 2)] {
        let (result, applied) = run(&mut executor, from, to);
        assert!(!result.success);
        let message = result.message.as_deref().unwrap_or_default();
        assert!(message.contains("not lower than target version"), "{}", message);
        assert!(result.steps_executed.is_empty());
        assert_eq!(result.final_version, from);
        assert!(applied.is_empty());
    }
    assert!(calls(&harness.log).is_empty());
    assert_eq!(harness.schema_version(), 3);
}

#[test]
fn full_run_logs_every_step_in_order() {
    let mut harness = Harness::new("exec-full", 1);
    harness
        .add(2, &[StepName::Before, StepName::After], Failure::Never)
        .add(3, &[], Failure::Never)
        .add(
            4,
            &[StepName::Before, StepName::Backup, StepName::After],
            Failure::Never,
        );
    let mut executor = harness
        .executor()
        .with_backup_dir(Some(harness.backup_dir()));

    let log = Arc::clone(&harness.log);
    let result = executor.migrate(1, 4, |version| {
        record(&log, format!("applied {}", version));
        Ok(())
    });

    assert!(result.success, "{:?}", result);
    assert_eq!(
        steps(&result),
        vec![
            "pre-validation",
            "disk-space-check",
            "migration-versions",
            "v2:before",
            "v2:migrate",
            "v2:after",
            "v2:update-version",
            "v2:validate",
            "v3:migrate",
            "v3:update-version",
            "v3:validate",
            "v4:before",
            "v4:backup",
            "v4:migrate",
            "v4:after",
            "v4:update-version",
            "v4:validate",
        ]
    );
    assert_eq!(result.final_version, 4);
    assert_eq!(harness.schema_version(), 4);
    assert_eq!(
        calls(&harness.log),
        vec![
            "v2:before",
            "v2:migrate",
            "v2:after",
            "applied 2",
            "v3:migrate",
            "applied 3",
            "v4:before",
            "v4:backup",
            "v4:migrate",
            "v4:after",
            "applied 4",
        ]
    );

    let config = fs::read_to_string(harness.root.join(CONFIG_FILE)).expect("config");
    assert!(config.contains("\"projectName\": \"demo\""));
}

#[test]
fn backup_hook_is_skipped_without_backup_dir() {
    let mut harness = Harness::new("exec-nobackup", 1);
    harness.add(2, &[StepName::Backup], Failure::Never);
    let mut executor = harness.executor();

    let (result, applied) = run(&mut executor, 1, 2);
    assert!(result.success);
    assert!(!steps(&result).iter().any(|step| step.ends_with(":backup")));
    assert!(!calls(&harness.log).iter().any(|call| call.ends_with(":backup")));
    assert_eq!(applied, vec![2]);
}

#[test]
fn panicking_before_hook_stops_the_run() {
    let mut harness = Harness::new("exec-before", 1);
    harness
        .add(2, &[], Failure::Never)
        .add(3, &[StepName::Before], Failure::PanicIn(StepName::Before))
        .add(4, &[], Failure::Never);
    let mut executor = harness.executor();

    let (result, applied) = run(&mut executor, 1, 4);
    assert!(!result.success);
    assert_eq!(steps(&result).last(), Some(&"v3:before"));
    assert!(!steps(&result).iter().any(|step| step.starts_with("v4:")));
    let message = result.message.as_deref().unwrap_or_default();
    assert!(message.contains("before hook exploded for v3"), "{}", message);
    assert_eq!(result.final_version, 2);
    assert_eq!(applied, vec![2]);
    assert_eq!(harness.schema_version(), 2);
}

#[test]
fn failed_migrate_never_bumps_the_version() {
    let mut harness = Harness::new("exec-migrate", 1);
    harness
        .add(2, &[StepName::After], Failure::FailIn(StepName::Migrate))
        .add(3, &[], Failure::Never);
    let mut executor = harness.executor();

    let (result, applied) = run(&mut executor, 1, 3);
    assert!(!result.success);
    assert_eq!(
        steps(&result),
        vec![
            "pre-validation",
            "disk-space-check",
            "migration-versions",
            "v2:migrate"
        ]
    );
    assert!(result
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("migrate refused at v2"));
    assert_eq!(result.final_version, 1);
    assert!(applied.is_empty());
    assert_eq!(harness.schema_version(), 1);
}

#[test]
fn insufficient_space_stops_after_pre_validation() {
    let mut harness = Harness::new("exec-space", 1);
    harness.add(2, &[], Failure::Never);
    let mut executor = harness.executor().with_space_probe(FixedProbe(0));

    let (result, _) = run(&mut executor, 1, 2);
    assert!(!result.success);
    assert_eq!(steps(&result), vec!["pre-validation"]);
    let message = result.message.as_deref().unwrap_or_default();
    assert!(message.contains("Insufficient disk space"), "{}", message);
    assert!(message.contains("Required:"));
    assert!(message.contains("Available:"));
    assert!(calls(&harness.log).is_empty());

    let mut broken = harness.executor().with_space_probe(BrokenProbe);
    let (result, _) = run(&mut broken, 1, 2);
    assert!(!result.success);
    assert_eq!(steps(&result), vec!["pre-validation"]);
}

struct Overclaiming {
    inner: MigrationRegistry,
    claimed: Vec<u32>,
}

impl MigrationSource for Overclaiming {
    fn discover(&self, from: u32, to: u32) -> Vec<u32> {
        self.claimed
            .iter()
            .copied()
            .filter(|version| *version > from && *version <= to)
            .collect()
    }

    fn locate(&self, version: u32) -> Option<String> {
        self.inner.locate(version)
    }

    fn load_path(&self, path: &str) -> Option<Arc<dyn Migration>> {
        self.inner.load_path(path)
    }
}

#[test]
fn unloadable_version_fails_cleanly() {
    let mut harness = Harness::new("exec-load", 1);
    harness.add(2, &[], Failure::Never);
    let source = Overclaiming {
        inner: harness.registry.clone(),
        claimed: vec![2, 3],
    };
    let mut executor = harness.executor_with(Arc::new(source));

    let (result, applied) = run(&mut executor, 1, 3);
    assert!(!result.success);
    assert_eq!(steps(&result).last(), Some(&"v2:validate"));
    assert!(!steps(&result).iter().any(|step| step.starts_with("v3:")));
    assert_eq!(
        result.message.as_deref(),
        Some("Failed to load migration for version 3")
    );
    assert_eq!(applied, vec![2]);
    assert_eq!(harness.schema_version(), 2);
}

#[test]
fn empty_discovery_succeeds_without_reaching_target() {
    let harness = Harness::new("exec-empty", 1);
    let mut executor = harness.executor();

    let (result, applied) = run(&mut executor, 1, 3);
    assert!(result.success);
    assert_eq!(
        steps(&result),
        vec!["pre-validation", "disk-space-check", "migration-versions"]
    );
    assert_eq!(result.final_version, 1);
    assert!(result
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("stays at 1"));
    assert!(applied.is_empty());
    assert_eq!(harness.schema_version(), 1);
}

#[test]
fn sparse_set_reports_version_reached() {
    let mut harness = Harness::new("exec-sparse", 1);
    harness.add(2, &[], Failure::Never);
    let mut executor = harness.executor();

    let (result, applied) = run(&mut executor, 1, 4);
    assert!(result.success);
    assert_eq!(result.final_version, 2);
    assert!(result
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("beyond version 2"));
    assert_eq!(applied, vec![2]);
}

#[test]
fn callback_failure_fails_the_run_before_next_version() {
    let mut harness = Harness::new("exec-callback", 1);
    harness.add(2, &[], Failure::Never).add(3, &[], Failure::Never);
    let mut executor = harness.executor();

    let result = executor.migrate(1, 3, |version| Err(format!("ui gone at {}", version)));
    assert!(!result.success);
    assert_eq!(steps(&result).last(), Some(&"v2:validate"));
    assert!(result
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("ui gone at 2"));
    assert_eq!(result.final_version, 2);
    assert_eq!(harness.schema_version(), 2);
    assert_eq!(calls(&harness.log), vec!["v2:migrate"]);
}

#[test]
fn rerun_after_partial_failure_matches_fresh_run() {
    let mut harness = Harness::new("exec-resume", 1);
    harness
        .add(2, &[StepName::Before], Failure::Never)
        .add(3, &[StepName::After], Failure::FailIn(StepName::Migrate))
        .add(4, &[StepName::Before], Failure::Never);
    let mut executor = harness.executor();

    let (first, _) = run(&mut executor, 1, 4);
    assert!(!first.success);
    assert_eq!(first.final_version, 2);

    harness.armed.store(false, Ordering::SeqCst);
    let resume_from = harness.schema_version();
    assert_eq!(resume_from, 2);
    let (resumed, applied) = run(&mut executor, resume_from, 4);
    assert!(resumed.success, "{:?}", resumed);
    assert_eq!(applied, vec![3, 4]);

    let mut fresh = Harness::new("exec-fresh", 2);
    fresh
        .add(2, &[StepName::Before], Failure::Never)
        .add(3, &[StepName::After], Failure::Never)
        .add(4, &[StepName::Before], Failure::Never);
    let (expected, _) = run(&mut fresh.executor(), 2, 4);
    assert_eq!(resumed.steps_executed, expected.steps_executed);
    assert_eq!(harness.schema_version(), 4);
}

#[test]
fn cancelling_mid_migrate_reports_cancellation() {
    let mut harness = Harness::new("exec-cancel", 1);
    harness
        .add(2, &[], Failure::WaitForCancel)
        .add(3, &[], Failure::Never);
    let mut executor = harness.executor();
    let handle = executor.cancel_handle();

    let log = Arc::clone(&harness.log);
    let canceller = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !calls(&log).iter().any(|call| call == "v2:migrate") {
            assert!(Instant::now() < deadline, "migrate step never started");
            thread::sleep(Duration::from_millis(2));
        }
        handle.cancel();
    });

    let (result, applied) = run(&mut executor, 1, 3);
    canceller.join().expect("canceller should finish");

    assert!(!result.success);
    assert_eq!(result.message.as_deref(), Some("Migration cancelled"));
    assert_eq!(steps(&result).last(), Some(&"v2:migrate"));
    assert_eq!(harness.cancel_calls.load(Ordering::SeqCst), 1);
    assert!(applied.is_empty());
    assert_eq!(harness.schema_version(), 1);
}

#[test]
fn hung_migrate_step_times_out() {
    let mut harness = Harness::new("exec-timeout", 1);
    harness.add(2, &[], Failure::WaitForCancel);
    let mut executor = harness
        .executor()
        .with_step_timeout(Some(Duration::from_millis(50)));

    let (result, _) = run(&mut executor, 1, 2);
    assert!(!result.success);
    assert!(result
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("Step timed out"));
    assert_eq!(harness.schema_version(), 1);
}
