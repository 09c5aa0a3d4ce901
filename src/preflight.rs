//! Read-only disk space check run before any migration touches the project.

use std::error::Error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::backup::{canonical_or_self, excluded_paths};
use crate::project::BACKUPS_DIR;

/// Migrations may hold a full backup and a working copy next to the original.
pub const DEFAULT_SAFETY_FACTOR: f64 = 2.0;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub trait SpaceProbe: Send + Sync {
    /// Free bytes available to this user on the volume containing `path`.
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FilesystemProbe;

impl SpaceProbe for FilesystemProbe {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

#[derive(Debug)]
pub enum PreflightError {
    Measure { path: PathBuf, source: io::Error },
    Probe { path: PathBuf, source: io::Error },
}

impl fmt::Display for PreflightError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreflightError::Measure { path, source } => {
                write!(f, "unable to measure {}: {}", path.display(), source)
            }
            PreflightError::Probe { path, source } => write!(
                f,
                "unable to determine available disk space for {}: {}",
                path.display(),
                source
            ),
        }
    }
}

impl Error for PreflightError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PreflightError::Measure { source, .. } => Some(source),
            PreflightError::Probe { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct SpaceReport {
    pub project_bytes: u64,
    pub safety_factor: f64,
    pub required_bytes: u64,
    pub available_bytes: u64,
}

impl SpaceReport {
    pub fn new(project_bytes: u64, safety_factor: f64, available_bytes: u64) -> Self {
        let required = (project_bytes as f64 * safety_factor).ceil();
        Self {
            project_bytes,
            safety_factor,
            required_bytes: if required >= u64::MAX as f64 {
                u64::MAX
            } else {
                required as u64
            },
            available_bytes,
        }
    }

    pub fn is_sufficient(&self) -> bool {
        self.available_bytes >= self.required_bytes
    }

    pub fn insufficiency_message(&self) -> String {
        format!(
            "Insufficient disk space. Required: {}, Available: {}",
            format_megabytes(self.required_bytes),
            format_megabytes(self.available_bytes)
        )
    }
}

pub fn format_megabytes(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / BYTES_PER_MB)
}

/// Measures the project and queries the volume. Never writes.
///
/// Snapshots (the default backup dir and `backup_dir`), locks and run
/// history are not project content and are left out of the size.
pub fn measure_project(
    project_root: &Path,
    backup_dir: Option<&Path>,
    safety_factor: f64,
    probe: &dyn SpaceProbe,
) -> Result<SpaceReport, PreflightError> {
    let root = canonical_or_self(project_root);
    let mut excluded = excluded_paths(&root, &root.join(BACKUPS_DIR));
    if let Some(dir) = backup_dir {
        excluded.push(canonical_or_self(dir));
    }
    let project_bytes = directory_size(&root, &excluded).map_err(|source| PreflightError::Measure {
        path: project_root.to_path_buf(),
        source,
    })?;
    let available_bytes =
        probe
            .available_bytes(project_root)
            .map_err(|source| PreflightError::Probe {
                path: project_root.to_path_buf(),
                source,
            })?;
    Ok(SpaceReport::new(
        project_bytes,
        safety_factor,
        available_bytes,
    ))
}

/// Recursive size of regular files under `root`, skipping anything under
/// `excluded`. Symlinks are not followed.
pub fn directory_size(root: &Path, excluded: &[PathBuf]) -> io::Result<u64> {
    let mut total = 0u64;
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if excluded.iter().any(|skip| path.starts_with(skip)) {
                continue;
            }
            let metadata = std::fs::symlink_metadata(&path)?;
            if metadata.is_dir() {
                dirs.push(path);
            } else if metadata.is_file() {
                total = total.saturating_add(metadata.len());
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::path::{Path, PathBuf};

    use uuid::Uuid;

    use super::{
        directory_size, format_megabytes, measure_project, FilesystemProbe, SpaceProbe,
        SpaceReport,
    };

    struct FixedProbe(u64);

    impl SpaceProbe for FixedProbe {
        fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    struct BrokenProbe;

    impl SpaceProbe for BrokenProbe {
        fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
            Err(io::Error::other("statvfs failed"))
        }
    }

    fn unique_workspace() -> PathBuf {
        let root = std::env::temp_dir().join(format!("cardmig-preflight-{}", Uuid::now_v7()));
        std::fs::create_dir_all(root.join("cards/a")).expect("workspace should be creatable");
        std::fs::write(root.join("cards/a/index.json"), vec![b'x'; 1000])
            .expect("file should be writable");
        std::fs::write(root.join("cards/a/content.adoc"), vec![b'y'; 24])
            .expect("file should be writable");
        root
    }

    #[test]
    fn directory_size_sums_nested_files() {
        let root = unique_workspace();
        assert_eq!(directory_size(&root, &[]).expect("size should compute"), 1024);
        assert_eq!(
            directory_size(&root, &[root.join("cards/a/content.adoc")]).expect("size"),
            1000
        );
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn report_applies_safety_factor() {
        let root = unique_workspace();
        let report =
            measure_project(&root, None, 2.0, &FixedProbe(2048)).expect("measure should succeed");
        assert_eq!(report.project_bytes, 1024);
        assert_eq!(report.required_bytes, 2048);
        assert!(report.is_sufficient());

        let tight =
            measure_project(&root, None, 2.0, &FixedProbe(2047)).expect("measure should succeed");
        assert!(!tight.is_sufficient());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn snapshots_locks_and_history_do_not_count() {
        let root = unique_workspace();
        let write = |relative: &str, bytes: usize| {
            let path = root.join(relative);
            std::fs::create_dir_all(path.parent().expect("file has parent"))
                .expect("parent should be creatable");
            std::fs::write(path, vec![b'z'; bytes]).expect("file should be writable");
        };
        write(".cards/backups/snapshot-v1-a/tree/cards/a/index.json", 2000);
        write(".cards/locks/migration.lock", 50);
        write(".cards/local/migration-history.jsonl", 300);
        write("elsewhere/snapshot-v1-b/tree/index.json", 4000);

        let report =
            measure_project(&root, None, 2.0, &FixedProbe(u64::MAX)).expect("measure");
        assert_eq!(report.project_bytes, 1024 + 4000);

        let custom = root.join("elsewhere");
        let report = measure_project(&root, Some(&custom), 2.0, &FixedProbe(u64::MAX))
            .expect("measure");
        assert_eq!(report.project_bytes, 1024);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn insufficiency_message_reports_megabytes() {
        let report = SpaceReport::new(3 * 1024 * 1024, 2.0, 1024 * 1024 + 10_486);
        let message = report.insufficiency_message();
        assert_eq!(
            message,
            "Insufficient disk space. Required: 6.00 MB, Available: 1.01 MB"
        );
        assert_eq!(format_megabytes(0), "0.00 MB");
    }

    #[test]
    fn probe_failures_are_reported() {
        let root = unique_workspace();
        let err = measure_project(&root, None, 2.0, &BrokenProbe)
            .expect_err("probe failure should surface");
        assert!(err.to_string().contains("available disk space"));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn filesystem_probe_reads_real_volume() {
        let root = unique_workspace();
        let available = FilesystemProbe
            .available_bytes(&root)
            .expect("temp volume should be queryable");
        assert!(available > 0);
        let _ = std::fs::remove_dir_all(root);
    }
}
