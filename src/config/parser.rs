//! Declaration parser for loading configuration files.
//!
//! This module handles loading the declaration from YAML files and
//! environment variables, with proper precedence and error handling.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::Path;
use tracing::{debug, info};

use super::spec::{DriverKind, HttpDriverConfig, InfraConfig};

/// Environment variable carrying the opaque credential blob.
pub const CREDENTIALS_ENV: &str = "CONVERGE_CREDENTIALS";

/// Declaration parser.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads the declaration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<InfraConfig> {
        let path = path.as_ref();
        info!("Loading declaration from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses the declaration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<InfraConfig> {
        debug!("Parsing YAML declaration");

        let config: InfraConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed declaration for project {} ({} resources)",
            config.project.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads the declaration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `CONVERGE_<KEY>` (e.g., `CONVERGE_REGION`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// has an unrecognized value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<InfraConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies environment overrides using the given variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `CONVERGE_DRIVER` names an unknown driver.
    pub fn apply_env_overrides(
        config: &mut InfraConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(name) = lookup("CONVERGE_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Some(env) = lookup("CONVERGE_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Some(driver) = lookup("CONVERGE_DRIVER") {
            debug!("Overriding provisioning.driver from environment");
            config.provisioning.driver = match driver.to_lowercase().as_str() {
                "memory" => DriverKind::Memory,
                "http" => DriverKind::Http,
                other => {
                    return Err(ConvergeError::Config(ConfigError::validation(
                        format!("Unknown driver '{other}'. Expected: memory or http"),
                        "CONVERGE_DRIVER",
                    )));
                }
            };
        }

        if let Some(region) = lookup("CONVERGE_REGION") {
            debug!("Overriding provisioning.region from environment");
            config.provisioning.region = Some(region);
        }

        if let Some(zone) = lookup("CONVERGE_ZONE") {
            debug!("Overriding provisioning.zone from environment");
            config.provisioning.zone = Some(zone);
        }

        if let Some(endpoint) = lookup("CONVERGE_ENDPOINT") {
            debug!("Overriding provisioning.http.endpoint from environment");
            match config.provisioning.http.as_mut() {
                Some(http) => http.endpoint = endpoint,
                None => {
                    config.provisioning.http = Some(HttpDriverConfig {
                        endpoint,
                        timeout_secs: 30,
                    });
                }
            }
        }

        if config.provisioning.credentials.is_none()
            && let Some(credentials) = lookup(CREDENTIALS_ENV)
        {
            debug!("Using provider credentials from environment");
            config.provisioning.credentials = Some(credentials);
        }

        // State overrides
        if let Some(bucket) = lookup("CONVERGE_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("CONVERGE_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default declaration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "converge.yaml",
    "converge.yml",
    "infra.yaml",
    "infra.yml",
];

/// Finds the declaration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no declaration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found declaration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
