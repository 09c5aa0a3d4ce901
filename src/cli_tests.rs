use std::path::Path;

use clap::Parser;

use super::{Cli, Commands};

fn parse(args: &[&str]) -> Cli {
    Cli::parse_from(args)
}

#[test]
fn migrate_flags_parse() {
    let cli = parse(&[
        "cardmig",
        "-C",
        "/work/cards",
        "-vv",
        "migrate",
        "--from",
        "2",
        "--to",
        "5",
        "--backup-dir",
        "/var/backups/cards",
        "--timeout",
        "30",
        "--json",
    ]);
    assert_eq!(cli.project_root, Path::new("/work/cards"));
    assert_eq!(cli.verbose, 2);
    match cli.command {
        Commands::Migrate(args) => {
            assert_eq!(args.from, Some(2));
            assert_eq!(args.to, Some(5));
            assert_eq!(
                args.backup_dir.as_deref(),
                Some(Path::new("/var/backups/cards"))
            );
            assert!(!args.no_backup);
            assert_eq!(args.timeout, Some(30));
            assert!(args.json);
        }
        other => panic!("expected Migrate, got {:?}", other),
    }
}

#[test]
fn backup_dir_conflicts_with_no_backup() {
    let parsed = Cli::try_parse_from([
        "cardmig",
        "migrate",
        "--no-backup",
        "--backup-dir",
        "/tmp/b",
    ]);
    assert!(parsed.is_err());
}

#[test]
fn zero_timeout_is_rejected() {
    assert!(Cli::try_parse_from(["cardmig", "migrate", "--timeout", "0"]).is_err());
}

#[test]
fn restore_requires_snapshot_argument() {
    assert!(Cli::try_parse_from(["cardmig", "restore"]).is_err());
    let cli = parse(&["cardmig", "restore", "snapshot-v2-x", "--yes"]);
    match cli.command {
        Commands::Restore(args) => {
            assert_eq!(args.snapshot, Path::new("snapshot-v2-x"));
            assert!(args.yes);
        }
        other => panic!("expected Restore, got {:?}", other),
    }
}

#[test]
fn global_flags_work_after_subcommand() {
    let cli = parse(&["cardmig", "status", "--json", "-C", "/p", "-v"]);
    assert_eq!(cli.project_root, Path::new("/p"));
    assert_eq!(cli.verbose, 1);
    assert!(matches!(cli.command, Commands::Status(args) if args.json));
}

#[test]
fn history_limit_parses() {
    let cli = parse(&["cardmig", "history", "-n", "3"]);
    match cli.command {
        Commands::History(args) => {
            assert_eq!(args.limit, Some(3));
            assert!(!args.json);
        }
        other => panic!("expected History, got {:?}", other),
    }
}

#[test]
fn command_definition_is_consistent() {
    super::styled_command().debug_assert();
}
