use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::preflight::DEFAULT_SAFETY_FACTOR;
use crate::project::{BACKUPS_DIR, MIGRATIONS_DIR, SETTINGS_FILE};

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug)]
pub enum SettingsError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::Io(err) => write!(f, "I/O error reading settings: {}", err),
            SettingsError::Toml(err) => write!(f, "invalid settings TOML: {}", err),
            SettingsError::Invalid(message) => write!(f, "invalid settings: {}", message),
        }
    }
}

impl Error for SettingsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SettingsError::Io(err) => Some(err),
            SettingsError::Toml(err) => Some(err),
            SettingsError::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for SettingsError {
    fn from(value: std::io::Error) -> Self {
        SettingsError::Io(value)
    }
}

impl From<toml::de::Error> for SettingsError {
    fn from(value: toml::de::Error) -> Self {
        SettingsError::Toml(value)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSettings {
    migrations_dir: Option<PathBuf>,
    backup_dir: Option<PathBuf>,
    safety_factor: Option<f64>,
    step_timeout_secs: Option<u64>,
    lock_timeout_ms: Option<u64>,
    stale_lock_secs: Option<u64>,
}

/// Engine settings for one project. Relative paths are resolved against the
/// project root.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub migrations_dir: PathBuf,
    pub backup_dir: Option<PathBuf>,
    pub safety_factor: f64,
    pub step_timeout: Option<Duration>,
    pub lock_timeout: Duration,
    pub stale_lock_after: Option<Duration>,
}

impl Settings {
    pub fn defaults(project_root: &Path) -> Self {
        Self {
            migrations_dir: project_root.join(MIGRATIONS_DIR),
            backup_dir: Some(project_root.join(BACKUPS_DIR)),
            safety_factor: DEFAULT_SAFETY_FACTOR,
            step_timeout: None,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            stale_lock_after: None,
        }
    }

    /// Defaults overlaid with `.cards/migrate.toml` when that file exists.
    pub fn load(project_root: &Path) -> Result<Self, SettingsError> {
        let path = project_root.join(SETTINGS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => Self::from_toml(project_root, &raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::defaults(project_root))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn from_toml(project_root: &Path, raw: &str) -> Result<Self, SettingsError> {
        let parsed: RawSettings = toml::from_str(raw)?;
        let mut settings = Self::defaults(project_root);

        if let Some(dir) = parsed.migrations_dir {
            settings.migrations_dir = project_root.join(dir);
        }
        if let Some(dir) = parsed.backup_dir {
            settings.backup_dir = Some(project_root.join(dir));
        }
        if let Some(factor) = parsed.safety_factor {
            settings.safety_factor = factor;
        }
        if let Some(secs) = parsed.step_timeout_secs {
            if secs == 0 {
                return Err(SettingsError::Invalid(
                    "step_timeout_secs must be greater than zero".to_string(),
                ));
            }
            settings.step_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(ms) = parsed.lock_timeout_ms {
            settings.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed.stale_lock_secs {
            settings.stale_lock_after = Some(Duration::from_secs(secs));
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if !self.safety_factor.is_finite() || self.safety_factor < 1.0 {
            return Err(SettingsError::Invalid(format!(
                "safety_factor must be at least 1.0, got {}",
                self.safety_factor
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use uuid::Uuid;

    use super::{Settings, SettingsError};

    #[test]
    fn defaults_live_under_cards_dir() {
        let settings = Settings::defaults(Path::new("/work/project"));
        assert_eq!(
            settings.migrations_dir,
            Path::new("/work/project/.cards/migrations")
        );
        assert_eq!(
            settings.backup_dir.as_deref(),
            Some(Path::new("/work/project/.cards/backups"))
        );
        assert_eq!(settings.safety_factor, 2.0);
        assert_eq!(settings.step_timeout, None);
        assert_eq!(settings.lock_timeout, Duration::from_millis(2_000));
    }

    #[test]
    fn toml_overrides_resolve_relative_to_project() {
        let raw = r#"
migrations_dir = "tools/migrations"
backup_dir = "/var/backups/cards"
safety_factor = 3.5
step_timeout_secs = 90
lock_timeout_ms = 10
stale_lock_secs = 3600
"#;
        let settings =
            Settings::from_toml(Path::new("/work/project"), raw).expect("settings should parse");
        assert_eq!(
            settings.migrations_dir,
            Path::new("/work/project/tools/migrations")
        );
        assert_eq!(
            settings.backup_dir.as_deref(),
            Some(Path::new("/var/backups/cards"))
        );
        assert_eq!(settings.safety_factor, 3.5);
        assert_eq!(settings.step_timeout, Some(Duration::from_secs(90)));
        assert_eq!(settings.lock_timeout, Duration::from_millis(10));
        assert_eq!(settings.stale_lock_after, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let root = Path::new("/work/project");
        assert!(matches!(
            Settings::from_toml(root, "safety_factor = 0.5"),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            Settings::from_toml(root, "step_timeout_secs = 0"),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            Settings::from_toml(root, "backups = \"x\""),
            Err(SettingsError::Toml(_))
        ));
    }

    #[test]
    fn load_falls_back_to_defaults_without_file() {
        let root = std::env::temp_dir().join(format!("cardmig-settings-{}", Uuid::now_v7()));
        let settings = Settings::load(&root).expect("missing file should use defaults");
        assert_eq!(settings, Settings::defaults(&root));
    }
}
