//! Resolving migration implementations by version.
//!
//! The executor depends only on [`MigrationSource`]. Two backends exist: a
//! compiled [`MigrationRegistry`] and a [`ScriptedSource`] that reads
//! `<dir>/<version>/migration.toml` manifests written by migration authors.

mod registry;
mod scripted;

use std::sync::Arc;

use crate::migration::Migration;

pub use registry::{MigrationRegistry, RegistryError};
pub use scripted::{
    HookSpec, LoadError, ManifestHooks, ScriptedManifest, ScriptedMigration, ScriptedSource,
    MANIFEST_FILE,
};

pub const REGISTRY_PATH_PREFIX: &str = "registry:";

pub trait MigrationSource: Send + Sync {
    /// Available versions strictly inside `(from, to]`, ascending.
    fn discover(&self, from: u32, to: u32) -> Vec<u32>;

    /// Path identifying the migration for `version`, as carried in the worker envelope.
    fn locate(&self, version: u32) -> Option<String>;

    /// Loads a migration by path. Every failure is logged and yields `None`.
    fn load_path(&self, path: &str) -> Option<Arc<dyn Migration>>;

    fn load(&self, version: u32) -> Option<Arc<dyn Migration>> {
        let Some(path) = self.locate(version) else {
            tracing::debug!(version, "no migration registered for version");
            return None;
        };
        let migration = self.load_path(&path)?;
        if migration.version() != version {
            tracing::error!(
                version,
                reported = migration.version(),
                path = %path,
                "migration reports a different version than its location"
            );
            return None;
        }
        Some(migration)
    }

    /// Highest version this source knows about.
    fn latest(&self) -> Option<u32> {
        self.discover(0, u32::MAX).last().copied()
    }
}

pub(crate) fn in_range(version: u32, from: u32, to: u32) -> bool {
    version > from && version <= to
}
