//! Schema migration engine for card projects.
//!
//! [`executor::MigrationExecutor`] applies versioned [`migration::Migration`]s
//! resolved through a [`loader::MigrationSource`], running each heavy
//! `migrate` step on an isolated worker ([`runner::StepRunner`]).

pub mod backup;
pub mod cancel;
pub mod executor;
pub mod history;
pub mod loader;
pub mod locks;
pub mod migration;
pub mod preflight;
pub mod project;
pub mod runner;
pub mod settings;
pub mod timestamps;

pub use executor::{ExecutorCancelHandle, MigrationExecutor};
pub use migration::{Migration, MigrationContext, MigrationResult, StepName, StepResult};
