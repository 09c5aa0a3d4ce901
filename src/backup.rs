//! Full project snapshots with a checksum manifest, and restoring from them.

use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::project::{HISTORY_FILE, LOCKS_DIR};
use crate::timestamps::{filename_timestamp, now_utc_rfc3339};

const MANIFEST_FILE: &str = "manifest.json";
const TREE_DIR: &str = "tree";
const SNAPSHOT_PREFIX: &str = "snapshot-v";

#[derive(Debug)]
pub enum BackupError {
    Io(std::io::Error),
    Json(serde_json::Error),
    NotASnapshot(PathBuf),
    ChecksumMismatch(String),
    MissingFile(String),
    UnsafePath(String),
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupError::Io(err) => write!(f, "I/O error: {}", err),
            BackupError::Json(err) => write!(f, "invalid snapshot manifest: {}", err),
            BackupError::NotASnapshot(path) => {
                write!(f, "{} is not a snapshot directory", path.display())
            }
            BackupError::ChecksumMismatch(path) => {
                write!(f, "snapshot file '{}' does not match its checksum", path)
            }
            BackupError::MissingFile(path) => write!(f, "snapshot file '{}' is missing", path),
            BackupError::UnsafePath(path) => {
                write!(f, "snapshot path '{}' escapes the project root", path)
            }
        }
    }
}

impl Error for BackupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackupError::Io(err) => Some(err),
            BackupError::Json(err) => Some(err),
            BackupError::NotASnapshot(_) => None,
            BackupError::ChecksumMismatch(_) => None,
            BackupError::MissingFile(_) => None,
            BackupError::UnsafePath(_) => None,
        }
    }
}

impl From<std::io::Error> for BackupError {
    fn from(value: std::io::Error) -> Self {
        BackupError::Io(value)
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(value: serde_json::Error) -> Self {
        BackupError::Json(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct ManifestEntry {
    path: String,
    size: u64,
    sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct SnapshotManifest {
    schema_version: u32,
    created_at: String,
    files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub path: PathBuf,
    pub schema_version: u32,
    pub created_at: String,
    pub file_count: u64,
    pub total_bytes: u64,
}

impl SnapshotSummary {
    fn from_manifest(path: PathBuf, manifest: &SnapshotManifest) -> Self {
        Self {
            path,
            schema_version: manifest.schema_version,
            created_at: manifest.created_at.clone(),
            file_count: manifest.files.len() as u64,
            total_bytes: manifest.files.iter().map(|entry| entry.size).sum(),
        }
    }
}

/// Copies the project tree into a new snapshot under `backup_dir`.
pub fn create_snapshot(
    project_root: &Path,
    backup_dir: &Path,
    schema_version: u32,
) -> Result<SnapshotSummary, BackupError> {
    fs::create_dir_all(backup_dir)?;
    let project_root = canonical_or_self(project_root);
    let excluded = excluded_paths(&project_root, backup_dir);

    let short_id = Uuid::now_v7().simple().to_string();
    let name = format!(
        "{SNAPSHOT_PREFIX}{schema_version}-{}-{}",
        filename_timestamp(),
        &short_id[short_id.len() - 8..]
    );
    let snapshot_dir = backup_dir.join(name);
    let tree = snapshot_dir.join(TREE_DIR);
    fs::create_dir_all(&tree)?;

    let mut files = Vec::new();
    for relative in collect_files(&project_root, &excluded)? {
        let source = project_root.join(&relative);
        let target = tree.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let size = fs::copy(&source, &target)?;
        files.push(ManifestEntry {
            path: portable(&relative),
            size,
            sha256: sha256_file(&target)?,
        });
    }

    let manifest = SnapshotManifest {
        schema_version,
        created_at: now_utc_rfc3339(),
        files,
    };
    fs::write(
        snapshot_dir.join(MANIFEST_FILE),
        serde_json::to_vec_pretty(&manifest)?,
    )?;
    tracing::info!(
        path = %snapshot_dir.display(),
        files = manifest.files.len(),
        "project snapshot written"
    );
    Ok(SnapshotSummary::from_manifest(snapshot_dir, &manifest))
}

/// Restores a snapshot over the project. Checksums are verified before any
/// project file is touched; files created after the snapshot are removed.
pub fn restore_snapshot(
    snapshot_dir: &Path,
    project_root: &Path,
) -> Result<SnapshotSummary, BackupError> {
    let manifest = read_manifest(snapshot_dir)?;
    let tree = snapshot_dir.join(TREE_DIR);

    for entry in &manifest.files {
        if !is_contained(&entry.path) {
            return Err(BackupError::UnsafePath(entry.path.clone()));
        }
        let path = tree.join(&entry.path);
        if !path.is_file() {
            return Err(BackupError::MissingFile(entry.path.clone()));
        }
        if sha256_file(&path)? != entry.sha256 {
            return Err(BackupError::ChecksumMismatch(entry.path.clone()));
        }
    }

    fs::create_dir_all(project_root)?;
    let project_root = canonical_or_self(project_root);
    let backup_dir = snapshot_dir.parent().unwrap_or(snapshot_dir);
    let excluded = excluded_paths(&project_root, backup_dir);
    let keep = manifest
        .files
        .iter()
        .map(|entry| entry.path.clone())
        .collect::<BTreeSet<_>>();

    for relative in collect_files(&project_root, &excluded)? {
        if !keep.contains(&portable(&relative)) {
            fs::remove_file(project_root.join(&relative))?;
        }
    }

    for entry in &manifest.files {
        let target = project_root.join(&entry.path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(tree.join(&entry.path), &target)?;
    }

    tracing::info!(
        path = %snapshot_dir.display(),
        version = manifest.schema_version,
        "project restored from snapshot"
    );
    Ok(SnapshotSummary::from_manifest(
        snapshot_dir.to_path_buf(),
        &manifest,
    ))
}

/// Snapshots under `backup_dir`, newest first.
pub fn list_snapshots(backup_dir: &Path) -> Result<Vec<SnapshotSummary>, BackupError> {
    if !backup_dir.exists() {
        return Ok(Vec::new());
    }

    let mut snapshots = Vec::new();
    for entry in fs::read_dir(backup_dir)? {
        let path = entry?.path();
        let is_snapshot = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(SNAPSHOT_PREFIX));
        if !is_snapshot || !path.join(MANIFEST_FILE).is_file() {
            continue;
        }
        match read_manifest(&path) {
            Ok(manifest) => snapshots.push(SnapshotSummary::from_manifest(path, &manifest)),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable snapshot");
            }
        }
    }
    snapshots.sort_by(|left, right| {
        right
            .created_at
            .cmp(&left.created_at)
            .then_with(|| right.path.cmp(&left.path))
    });
    Ok(snapshots)
}

fn read_manifest(snapshot_dir: &Path) -> Result<SnapshotManifest, BackupError> {
    let path = snapshot_dir.join(MANIFEST_FILE);
    if !path.is_file() {
        return Err(BackupError::NotASnapshot(snapshot_dir.to_path_buf()));
    }
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

/// Engine state that is never part of a snapshot or of the project's size.
pub(crate) fn excluded_paths(project_root: &Path, backup_dir: &Path) -> Vec<PathBuf> {
    vec![
        canonical_or_self(backup_dir),
        project_root.join(LOCKS_DIR),
        project_root.join(HISTORY_FILE),
    ]
}

/// Regular files under `root` as sorted relative paths, skipping `excluded`.
fn collect_files(root: &Path, excluded: &[PathBuf]) -> Result<Vec<PathBuf>, BackupError> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if excluded.iter().any(|skip| path.starts_with(skip)) {
                continue;
            }
            let metadata = fs::symlink_metadata(&path)?;
            if metadata.is_dir() {
                dirs.push(path);
            } else if metadata.is_file() {
                if let Ok(relative) = path.strip_prefix(root) {
                    files.push(relative.to_path_buf());
                }
            } else {
                tracing::warn!(path = %path.display(), "skipping non-regular file");
            }
        }
    }
    files.sort();
    Ok(files)
}

fn sha256_file(path: &Path) -> Result<String, BackupError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

/// True for a non-empty relative path made only of plain names.
fn is_contained(manifest_path: &str) -> bool {
    let path = Path::new(manifest_path);
    path.components().next().is_some()
        && path
            .components()
            .all(|part| matches!(part, Component::Normal(_)))
}

fn portable(relative: &Path) -> String {
    relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn canonical_or_self(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
#[path = "backup_tests_ext.rs"]
mod tests_ext;
