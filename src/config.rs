// Configuration loading and parsing (coordinator.toml).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire coordinator.toml file.
#[derive(Debug, Clone, Deserialize)]
struct CoordinatorFile {
    registry: RegistryConfig,
    drafting: DraftingConfig,
    database: DatabaseSection,
}

#[derive(Debug, Clone, Deserialize)]
struct DatabaseSection {
    path: String,
}

/// Registry sizing and background cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Maximum live sessions before oldest-first eviction kicks in.
    pub capacity: usize,
    /// Session lifetime; deployments run between 3 and 7 hours.
    pub session_ttl_hours: i64,
    pub persist_interval_secs: u64,
    pub sweep_interval_secs: u64,
}

/// External drafting service connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DraftingConfig {
    pub service_url: String,
    /// User id and display name the connector announces itself as.
    pub bot_user: String,
    /// Other participants required before the connector's job is done.
    pub quorum: usize,
    pub import_max_attempts: u32,
    pub import_base_delay_ms: u64,
    pub presence_poll_secs: u64,
}

/// The assembled application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub registry: RegistryConfig,
    pub drafting: DraftingConfig,
    pub db_path: String,
}

impl Config {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.registry.session_ttl_hours)
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/coordinator.toml` relative
/// to the given `base_dir`.
///
/// This is the lower-level loading primitive that does not auto-copy
/// defaults. Prefer `load_config()` which handles default initialization.
pub(crate) fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join("coordinator.toml");
    let text = std::fs::read_to_string(&path).map_err(|_| ConfigError::FileNotFound {
        path: path.clone(),
    })?;

    let file: CoordinatorFile =
        toml::from_str(&text).map_err(|e| ConfigError::ParseError { path, source: e })?;

    let config = Config {
        registry: file.registry,
        drafting: file.drafting,
        db_path: file.database.path,
    };

    validate(&config)?;
    Ok(config)
}

/// Ensure the config file exists by copying it from `defaults/` when
/// missing. Returns the list of files that were copied.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_path = base_dir.join("defaults").join("coordinator.toml");
    let config_dir = base_dir.join("config");
    let target = config_dir.join("coordinator.toml");

    if target.exists() {
        return Ok(vec![]);
    }
    if !defaults_path.exists() {
        return Err(ConfigError::DefaultsCopyError {
            message: format!(
                "neither {} nor {} found; run from the project root or create the config",
                target.display(),
                defaults_path.display()
            ),
        });
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;
    std::fs::copy(&defaults_path, &target).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to copy {}: {e}", defaults_path.display()),
    })?;

    Ok(vec![target])
}

/// Convenience wrapper: loads config relative to the current working
/// directory, copying the default config file first if needed.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.registry.capacity == 0 {
        return Err(ConfigError::ValidationError {
            field: "registry.capacity".into(),
            message: "must be greater than 0".into(),
        });
    }

    let ttl = config.registry.session_ttl_hours;
    if !(3..=7).contains(&ttl) {
        return Err(ConfigError::ValidationError {
            field: "registry.session_ttl_hours".into(),
            message: format!("must be between 3 and 7 inclusive, got {ttl}"),
        });
    }

    if config.registry.persist_interval_secs == 0 {
        return Err(ConfigError::ValidationError {
            field: "registry.persist_interval_secs".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.registry.sweep_interval_secs == 0 {
        return Err(ConfigError::ValidationError {
            field: "registry.sweep_interval_secs".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.drafting.quorum == 0 {
        return Err(ConfigError::ValidationError {
            field: "drafting.quorum".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.drafting.import_max_attempts == 0 {
        return Err(ConfigError::ValidationError {
            field: "drafting.import_max_attempts".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.drafting.bot_user.is_empty() {
        return Err(ConfigError::ValidationError {
            field: "drafting.bot_user".into(),
            message: "must not be empty".into(),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
