use std::io::{self, IsTerminal};

use cardmig::backup::SnapshotSummary;
use cardmig::history::HistoryEntry;
use cardmig::preflight::format_megabytes;
use cardmig::MigrationResult;

use crate::app::{CheckView, MigrateOutcome, MigrationView, StatusView};

pub fn print_status(status: &StatusView) {
    let palette = Palette::auto();
    println!("{}", palette.heading("Schema"));
    println!("project  {}", status.project_root.display());
    println!(
        "version  {}",
        palette.version(&status.schema_version.to_string())
    );
    let latest = status
        .latest_available
        .map(|version| version.to_string())
        .unwrap_or_else(|| "none".to_string());
    println!("latest   {}", latest);
    if status.pending.is_empty() {
        println!("{}", palette.dim("up to date"));
    } else {
        println!("pending  {}", version_list(&status.pending));
    }
}

pub fn print_migration_list(migrations: &[MigrationView]) {
    let palette = Palette::auto();
    println!("{}", palette.heading("Migrations"));
    if migrations.is_empty() {
        println!("{}", palette.dim("no migrations found"));
        return;
    }
    for migration in migrations {
        println!("{}", format_migration_row(migration, &palette));
    }
    println!("{}", palette.dim(&format!("{} migration(s)", migrations.len())));
}

fn format_migration_row(migration: &MigrationView, palette: &Palette) -> String {
    let marker = if !migration.loadable {
        palette.fail("[BROKEN]")
    } else if migration.applied {
        palette.ok("[APPLIED]")
    } else {
        palette.warn("[PENDING]")
    };
    let mut line = format!(
        "{} {}",
        palette.version(&format!("v{}", migration.version)),
        marker
    );
    if let Some(description) = migration.description.as_deref() {
        line.push(' ');
        line.push_str(description);
    }
    if let Some(path) = migration.path.as_deref() {
        line.push(' ');
        line.push_str(&palette.dim(path));
    }
    line
}

pub fn print_check(check: &CheckView) {
    let palette = Palette::auto();
    println!("{}", palette.heading("Preflight"));
    println!(
        "versions   {} -> {} ({})",
        check.schema_version,
        check.target_version,
        if check.pending.is_empty() {
            "nothing pending".to_string()
        } else {
            version_list(&check.pending)
        }
    );
    println!(
        "project    {}",
        format_megabytes(check.space.project_bytes)
    );
    println!(
        "required   {} (x{})",
        format_megabytes(check.space.required_bytes),
        check.space.safety_factor
    );
    println!(
        "available  {}",
        format_megabytes(check.space.available_bytes)
    );
    if check.sufficient {
        println!("{}", palette.ok("✓ enough free space"));
    } else {
        println!("{}", palette.fail("✗ insufficient disk space"));
    }
}

pub fn print_version_applied(version: u32) {
    let palette = Palette::auto();
    println!("{} applied v{}", palette.ok("✓"), version);
}

pub fn print_migrate_outcome(outcome: &MigrateOutcome) {
    let palette = Palette::auto();
    let result = &outcome.result;
    if result.success {
        println!("{} {}", palette.ok("✓"), outcome_message(result));
    } else {
        println!("{} {}", palette.fail("✗"), outcome_message(result));
        if let Some(last) = result.steps_executed.last() {
            println!("{}", palette.dim(&format!("stopped after step {last}")));
        }
    }
    println!(
        "{}",
        palette.dim(&format!("schema version {}", result.final_version))
    );
}

fn outcome_message(result: &MigrationResult) -> String {
    result.message.clone().unwrap_or_else(|| {
        if result.success {
            "migration finished".to_string()
        } else {
            "migration failed".to_string()
        }
    })
}

pub fn print_snapshots(snapshots: &[SnapshotSummary]) {
    let palette = Palette::auto();
    println!("{}", palette.heading("Snapshots"));
    if snapshots.is_empty() {
        println!("{}", palette.dim("no snapshots"));
        return;
    }
    for snapshot in snapshots {
        let name = snapshot
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| snapshot.path.display().to_string());
        println!(
            "{} {} {} {}",
            palette.version(&format!("v{}", snapshot.schema_version)),
            name,
            palette.dim(&snapshot.created_at),
            palette.dim(&format!(
                "{} file(s), {}",
                snapshot.file_count,
                format_megabytes(snapshot.total_bytes)
            ))
        );
    }
}

pub fn print_history(entries: &[HistoryEntry]) {
    let palette = Palette::auto();
    println!("{}", palette.heading("History"));
    if entries.is_empty() {
        println!("{}", palette.dim("no recorded runs"));
        return;
    }
    for entry in entries {
        let status = if entry.success {
            palette.ok("[OK]")
        } else {
            palette.fail("[FAILED]")
        };
        let mut line = format!(
            "{} {} v{} -> v{} (reached v{})",
            palette.dim(&entry.started_at),
            status,
            entry.from_version,
            entry.to_version,
            entry.final_version
        );
        if let Some(message) = entry.message.as_deref() {
            line.push(' ');
            line.push_str(message);
        }
        println!("{line}");
    }
}

fn version_list(versions: &[u32]) -> String {
    versions
        .iter()
        .map(|version| format!("v{version}"))
        .collect::<Vec<_>>()
        .join(", ")
}

struct Palette {
    enabled: bool,
}

impl Palette {
    fn auto() -> Self {
        let enabled = std::env::var_os("NO_COLOR").is_none() && io::stdout().is_terminal();
        Self { enabled }
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.enabled {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    fn heading(&self, text: &str) -> String {
        self.paint("1;36", text)
    }

    fn dim(&self, text: &str) -> String {
        self.paint("2", text)
    }

    fn version(&self, text: &str) -> String {
        self.paint("1;94", text)
    }

    fn ok(&self, text: &str) -> String {
        self.paint("32", text)
    }

    fn warn(&self, text: &str) -> String {
        self.paint("33", text)
    }

    fn fail(&self, text: &str) -> String {
        self.paint("31", text)
    }
}

#[cfg(test)]
#[path = "ui_tests_ext.rs"]
mod tests;
