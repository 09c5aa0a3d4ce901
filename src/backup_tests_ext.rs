use std::error::Error;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::{create_snapshot, list_snapshots, restore_snapshot, sha256_file, BackupError};
use crate::project::{BACKUPS_DIR, CONFIG_FILE, HISTORY_FILE, LOCK_FILE};

fn unique_project() -> PathBuf {
    let root = std::env::temp_dir().join(format!("cardmig-backup-test-{}", Uuid::now_v7()));
    write(&root, CONFIG_FILE, r#"{"schemaVersion":2}"#);
    write(&root, "cardRoot/demo_1/index.json", r#"{"title":"first"}"#);
    write(&root, "cardRoot/demo_1/index.adoc", "= First card\n");
    root
}

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().expect("file has parent"))
        .expect("parent should be creatable");
    std::fs::write(path, contents).expect("file should be writable");
}

fn read(root: &Path, relative: &str) -> String {
    std::fs::read_to_string(root.join(relative)).expect("file should be readable")
}

#[test]
fn snapshot_copies_project_and_skips_engine_state() {
    let root = unique_project();
    write(&root, LOCK_FILE, "held");
    write(&root, HISTORY_FILE, "{}\n");
    let backups = root.join(BACKUPS_DIR);

    let summary = create_snapshot(&root, &backups, 2).expect("snapshot should succeed");
    assert_eq!(summary.schema_version, 2);
    assert_eq!(summary.file_count, 3);
    assert!(summary.path.starts_with(&backups));
    assert!(summary
        .path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("snapshot-v2-")));
    assert!(summary.path.join("tree/cardRoot/demo_1/index.adoc").is_file());
    assert!(!summary.path.join("tree").join(LOCK_FILE).exists());
    assert!(!summary.path.join("tree").join(HISTORY_FILE).exists());
    assert!(!summary.path.join("tree").join(BACKUPS_DIR).exists());

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn restore_reverts_edits_and_removes_new_files() {
    let root = unique_project();
    let backups = root.join(BACKUPS_DIR);
    let summary = create_snapshot(&root, &backups, 2).expect("snapshot should succeed");

    write(&root, "cardRoot/demo_1/index.json", r#"{"title":"migrated"}"#);
    write(&root, "cardRoot/demo_2/index.json", r#"{"title":"new"}"#);
    write(&root, CONFIG_FILE, r#"{"schemaVersion":3}"#);

    let restored = restore_snapshot(&summary.path, &root).expect("restore should succeed");
    assert_eq!(restored.schema_version, 2);
    assert_eq!(read(&root, "cardRoot/demo_1/index.json"), r#"{"title":"first"}"#);
    assert_eq!(read(&root, CONFIG_FILE), r#"{"schemaVersion":2}"#);
    assert!(!root.join("cardRoot/demo_2/index.json").exists());
    assert!(summary.path.join("manifest.json").is_file());

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn restore_refuses_tampered_snapshot_without_touching_project() {
    let root = unique_project();
    let backups = root.join(BACKUPS_DIR);
    let summary = create_snapshot(&root, &backups, 2).expect("snapshot should succeed");

    std::fs::write(
        summary.path.join("tree/cardRoot/demo_1/index.adoc"),
        "= Tampered\n",
    )
    .expect("tamper write should succeed");
    write(&root, "cardRoot/demo_1/index.json", r#"{"title":"migrated"}"#);

    let err = restore_snapshot(&summary.path, &root).expect_err("tampered restore must fail");
    assert!(matches!(err, BackupError::ChecksumMismatch(ref path) if path == "cardRoot/demo_1/index.adoc"));
    assert_eq!(
        read(&root, "cardRoot/demo_1/index.json"),
        r#"{"title":"migrated"}"#
    );

    let _ = std::fs::remove_dir_all(root);
}

fn add_manifest_entry(snapshot: &Path, path: &str, source: &Path) {
    let manifest_path = snapshot.join("manifest.json");
    let raw = std::fs::read(&manifest_path).expect("manifest should read");
    let mut manifest: serde_json::Value = serde_json::from_slice(&raw).expect("manifest json");
    manifest["files"]
        .as_array_mut()
        .expect("files should be an array")
        .push(serde_json::json!({
            "path": path,
            "size": std::fs::metadata(source).expect("source metadata").len(),
            "sha256": sha256_file(source).expect("source should hash"),
        }));
    std::fs::write(
        manifest_path,
        serde_json::to_vec_pretty(&manifest).expect("manifest serializes"),
    )
    .expect("manifest should write");
}

#[test]
fn restore_rejects_manifest_paths_outside_the_project() {
    let root = unique_project();
    let backups = root.join(BACKUPS_DIR);
    let summary = create_snapshot(&root, &backups, 2).expect("snapshot should succeed");
    write(&root, "cardRoot/demo_1/index.json", r#"{"title":"migrated"}"#);

    // Resolves to a file next to `tree/` that really exists with a matching checksum.
    let escape_name = format!("escape-{}.txt", Uuid::now_v7());
    let planted = summary.path.join(&escape_name);
    std::fs::write(&planted, "outside").expect("planted file should write");
    let escaping = format!("../{escape_name}");
    add_manifest_entry(&summary.path, &escaping, &planted);

    let err = restore_snapshot(&summary.path, &root).expect_err("escaping path must fail");
    assert!(matches!(err, BackupError::UnsafePath(ref path) if path == &escaping));
    assert!(err.to_string().contains("escapes the project root"));
    assert!(!root.parent().expect("root has parent").join(&escape_name).exists());
    assert_eq!(
        read(&root, "cardRoot/demo_1/index.json"),
        r#"{"title":"migrated"}"#
    );

    let absolute = summary.path.join("absolute.txt");
    std::fs::write(&absolute, "abs").expect("absolute file should write");
    let other = create_snapshot(&root, &backups, 2).expect("second snapshot");
    add_manifest_entry(&other.path, &absolute.to_string_lossy(), &absolute);
    let err = restore_snapshot(&other.path, &root).expect_err("absolute path must fail");
    assert!(matches!(err, BackupError::UnsafePath(_)));

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn list_snapshots_is_newest_first_and_ignores_strays() {
    let root = unique_project();
    let backups = root.join(BACKUPS_DIR);
    assert!(list_snapshots(&backups).expect("missing dir lists").is_empty());

    let first = create_snapshot(&root, &backups, 2).expect("first snapshot");
    write(&root, CONFIG_FILE, r#"{"schemaVersion":3}"#);
    let second = create_snapshot(&root, &backups, 3).expect("second snapshot");
    std::fs::create_dir_all(backups.join("scratch")).expect("stray dir");

    let listed = list_snapshots(&backups).expect("list should succeed");
    assert_eq!(listed.len(), 2);
    let paths = listed.iter().map(|s| s.path.clone()).collect::<Vec<_>>();
    assert!(paths.contains(&first.path));
    assert!(paths.contains(&second.path));
    assert!(listed[0].created_at >= listed[1].created_at);

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn not_a_snapshot_and_error_display() {
    let root = unique_project();
    let err = restore_snapshot(&root.join("cardRoot"), &root).expect_err("no manifest");
    assert!(err.to_string().contains("is not a snapshot directory"));
    assert!(err.source().is_none());

    let io: BackupError = std::io::Error::other("disk").into();
    assert!(io.to_string().contains("I/O error"));
    assert!(io.source().is_some());

    let _ = std::fs::remove_dir_all(root);
}
