mod app;
mod cli;
mod completions;
mod ui;

use std::time::Duration;

use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CARDMIG_LOG";

/// Exit status of a `migrate` run that completed with `success: false`.
const MIGRATION_FAILED_EXIT: i32 = 2;

fn main() {
    match run() {
        Ok(code) => {
            if code != 0 {
                std::process::exit(code);
            }
        }
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    }
}

fn print_json(value: &impl serde::Serialize) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).expect("json serialization should work")
    );
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = if verbose > 0 {
        EnvFilter::new(default_level)
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run() -> Result<i32, app::AppError> {
    use clap::Parser;
    use cli::Commands;

    let cli = cli::Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Completions(args) = &cli.command {
        completions::write_completions(args.shell, &mut std::io::stdout().lock());
        return Ok(0);
    }

    let app = app::MigrationApp::open(cli.project_root)?;

    match cli.command {
        Commands::Status(args) => {
            let status = app.status()?;
            if args.json {
                print_json(&status);
            } else {
                ui::print_status(&status);
            }
        }
        Commands::List(args) => {
            let migrations = app.list_migrations()?;
            if args.json {
                print_json(&migrations);
            } else {
                ui::print_migration_list(&migrations);
            }
        }
        Commands::Check(args) => {
            let check = app.check(args.to)?;
            if args.json {
                print_json(&check);
            } else {
                ui::print_check(&check);
            }
        }
        Commands::Migrate(args) => {
            let request = app::MigrateRequest {
                from: args.from,
                to: args.to,
                backup_dir: args.backup_dir,
                no_backup: args.no_backup,
                timeout: args.timeout.map(Duration::from_secs),
            };
            let json = args.json;
            let outcome = app.migrate(&request, |version| {
                if !json {
                    ui::print_version_applied(version);
                }
            })?;
            if json {
                print_json(&outcome);
            } else {
                ui::print_migrate_outcome(&outcome);
            }
            if !outcome.result.success {
                return Ok(MIGRATION_FAILED_EXIT);
            }
        }
        Commands::Snapshots(args) => {
            let snapshots = app.snapshots()?;
            if args.json {
                print_json(&snapshots);
            } else {
                ui::print_snapshots(&snapshots);
            }
        }
        Commands::Restore(args) => {
            let restored = app.restore(&args.snapshot, args.yes)?;
            println!(
                "restored {} (schema version {})",
                restored.path.display(),
                restored.schema_version
            );
        }
        Commands::History(args) => {
            let entries = app.history(args.limit)?;
            if args.json {
                print_json(&entries);
            } else {
                ui::print_history(&entries);
            }
        }
        Commands::Completions(_) => unreachable!("completions return before the app opens"),
    }

    Ok(0)
}
