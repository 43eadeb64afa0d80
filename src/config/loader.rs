//! Configuration Loader
//!
//! Environment-aware loading built on the `config` crate. Sources are layered
//! in this order, later sources overriding earlier ones:
//!
//! 1. `<config_dir>/batched_migrations.toml` (required)
//! 2. `<config_dir>/environments/<environment>.toml` (optional)
//! 3. `BATCHED_MIGRATIONS__<SECTION>__<KEY>` environment variables

use super::error::{ConfigResult, ConfigurationError};
use super::MigrationsConfig;
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE_NAME: &str = "batched_migrations.toml";
const ENV_PREFIX: &str = "BATCHED_MIGRATIONS";

/// Loaded, validated configuration plus the context it was loaded from
#[derive(Debug)]
pub struct ConfigManager {
    config: MigrationsConfig,
    environment: String,
    config_directory: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Useful for testing without modifying global environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);
        let base_path = config_directory.join(BASE_FILE_NAME);

        if !base_path.is_file() {
            return Err(ConfigurationError::ConfigFileNotFound { path: base_path });
        }

        let environment_path = Self::environment_file(&config_directory, environment);

        debug!(
            environment = %environment,
            base = %base_path.display(),
            overrides = %environment_path.display(),
            "Loading batched migrations configuration"
        );

        let settings = Config::builder()
            .add_source(File::from(base_path.as_path()).required(true))
            .add_source(File::from(environment_path.as_path()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config = Self::deserialize(settings)?;

        info!(
            environment = %environment,
            schema_name = %config.coordinator.schema_name,
            worker_count = config.coordinator.worker_count,
            minimum_jobs = config.circuit_breaker.minimum_jobs,
            maximum_failed_ratio = config.circuit_breaker.maximum_failed_ratio,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Some(config_directory),
        }))
    }

    /// Parse a TOML document, applying defaults for omitted sections
    pub fn from_toml_str(toml: &str, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;

        Ok(Arc::new(ConfigManager {
            config: Self::deserialize(settings)?,
            environment: environment.to_string(),
            config_directory: None,
        }))
    }

    /// Wrap an already-built configuration
    pub fn from_config(config: MigrationsConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_directory: None,
        }))
    }

    fn deserialize(settings: Config) -> ConfigResult<MigrationsConfig> {
        let config: MigrationsConfig = settings.try_deserialize().map_err(|e| {
            ConfigurationError::DeserializationError {
                error: e.to_string(),
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &MigrationsConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> Option<&Path> {
        self.config_directory.as_deref()
    }

    /// Detect the current environment from environment variables
    pub fn detect_environment() -> String {
        env::var("BATCHED_MIGRATIONS_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("BATCHED_MIGRATIONS_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn environment_file(config_directory: &Path, environment: &str) -> PathBuf {
        config_directory
            .join("environments")
            .join(format!("{environment}.toml"))
    }
}
