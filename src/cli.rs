use std::path::PathBuf;

use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;

fn cli_styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::BrightYellow.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightGreen.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::BrightMagenta.on_default())
}

pub fn styled_command() -> clap::Command {
    Cli::command()
}

#[derive(Debug, Parser)]
#[command(name = "cardmig")]
#[command(bin_name = "cardmig")]
#[command(version)]
#[command(about = "Versioned schema migrations for card projects")]
#[command(styles = cli_styles())]
pub struct Cli {
    #[arg(
        short = 'C',
        long,
        env = "CARDS_PROJECT_ROOT",
        default_value = ".",
        global = true,
        value_hint = ValueHint::DirPath,
        help = "Project root that contains .cards/."
    )]
    pub project_root: PathBuf,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Log more detail to stderr (-v info, -vv debug)."
    )]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Show the current schema version and pending migrations.")]
    Status(JsonArgs),
    #[command(about = "List available migrations.")]
    List(JsonArgs),
    #[command(about = "Check free disk space without changing anything.")]
    Check(CheckArgs),
    #[command(about = "Apply pending migrations.")]
    Migrate(MigrateArgs),
    #[command(about = "List project snapshots in the backup directory.")]
    Snapshots(JsonArgs),
    #[command(about = "Restore the project from a snapshot.")]
    Restore(RestoreArgs),
    #[command(about = "Show recorded migration runs.")]
    History(HistoryArgs),
    #[command(about = "Print a shell completion script.")]
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long, help = "Emit JSON output.")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long, help = "Target schema version (defaults to the latest available).")]
    pub to: Option<u32>,

    #[arg(long, help = "Emit JSON output.")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    #[arg(long, help = "Target schema version (defaults to the latest available).")]
    pub to: Option<u32>,

    #[arg(
        long,
        help = "Source schema version (defaults to the project's recorded version)."
    )]
    pub from: Option<u32>,

    #[arg(
        long = "backup-dir",
        conflicts_with = "no_backup",
        value_hint = ValueHint::DirPath,
        help = "Directory for backups (overrides .cards/migrate.toml)."
    )]
    pub backup_dir: Option<PathBuf>,

    #[arg(long = "no-backup", help = "Skip the backup step of every migration.")]
    pub no_backup: bool,

    #[arg(
        long,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Abandon a migrate step after this many seconds."
    )]
    pub timeout: Option<u64>,

    #[arg(long, help = "Emit JSON output.")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct RestoreArgs {
    #[arg(
        value_hint = ValueHint::DirPath,
        help = "Snapshot directory, or its name inside the backup directory."
    )]
    pub snapshot: PathBuf,

    #[arg(short = 'y', long, help = "Confirm overwriting the project.")]
    pub yes: bool,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(short = 'n', long, help = "Show only the most recent N runs.")]
    pub limit: Option<usize>,

    #[arg(long, help = "Emit JSON output.")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    #[arg(value_enum, help = "Shell to generate the script for.")]
    pub shell: Shell,
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
