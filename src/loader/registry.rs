use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use super::{in_range, MigrationSource, REGISTRY_PATH_PREFIX};
use crate::migration::Migration;

type MigrationFactory = Arc<dyn Fn() -> Arc<dyn Migration> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    Duplicate(u32),
    VersionMismatch { registered: u32, reported: u32 },
    ZeroVersion,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Duplicate(version) => {
                write!(f, "migration for version {} is already registered", version)
            }
            RegistryError::VersionMismatch {
                registered,
                reported,
            } => write!(
                f,
                "migration registered as version {} reports version {}",
                registered, reported
            ),
            RegistryError::ZeroVersion => write!(f, "migration versions start at 1"),
        }
    }
}

impl Error for RegistryError {}

/// Compiled map of version to migration factory.
///
/// Each `load` builds a fresh instance, so state never leaks between runs.
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    factories: BTreeMap<u32, MigrationFactory>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, version: u32, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Arc<dyn Migration> + Send + Sync + 'static,
    {
        if version == 0 {
            return Err(RegistryError::ZeroVersion);
        }
        if self.factories.contains_key(&version) {
            return Err(RegistryError::Duplicate(version));
        }
        let reported = factory().version();
        if reported != version {
            return Err(RegistryError::VersionMismatch {
                registered: version,
                reported,
            });
        }
        self.factories.insert(version, Arc::new(factory));
        Ok(())
    }

    pub fn versions(&self) -> Vec<u32> {
        self.factories.keys().copied().collect()
    }
}

impl fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationRegistry")
            .field("versions", &self.versions())
            .finish()
    }
}

impl MigrationSource for MigrationRegistry {
    fn discover(&self, from: u32, to: u32) -> Vec<u32> {
        self.factories
            .keys()
            .copied()
            .filter(|version| in_range(*version, from, to))
            .collect()
    }

    fn locate(&self, version: u32) -> Option<String> {
        self.factories
            .contains_key(&version)
            .then(|| format!("{REGISTRY_PATH_PREFIX}{version}"))
    }

    fn load_path(&self, path: &str) -> Option<Arc<dyn Migration>> {
        let Some(version) = path
            .strip_prefix(REGISTRY_PATH_PREFIX)
            .and_then(|raw| raw.parse::<u32>().ok())
        else {
            tracing::error!(path, "not a registry migration path");
            return None;
        };
        let factory = self.factories.get(&version)?;
        Some(factory())
    }
}
