//! TOML configuration for adsentry.
//!
//! A layered model: an explicit path, the `ADSENTRY_CONFIG` environment
//! variable, the working directory, the system location, and finally the
//! compiled-in defaults.

use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::engine::DetectOptions;

pub const CONFIG_ENV: &str = "ADSENTRY_CONFIG";
const LOCAL_PATH: &str = "adsentry.toml";
const SYSTEM_PATH: &str = "/etc/adsentry/adsentry.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration. An explicit path must load; the implicit
    /// locations are tried in order and skipped with a warning on failure.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "ADSENTRY_CONFIG set but file could not be loaded, trying fallback"
                ),
            }
        }

        for candidate in [LOCAL_PATH, SYSTEM_PATH] {
            let path = Path::new(candidate);
            if !path.exists() {
                continue;
            }
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "config file exists but could not be loaded"
                ),
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.detection.max_threshold_findings == 0 {
            bail!("detection.max_threshold_findings must be at least 1");
        }
        if let Some(expr) = &self.detection.schedule {
            cron::Schedule::from_str(expr)
                .with_context(|| format!("invalid detection.schedule '{expr}'"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "data/adsentry.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Cap on findings a single threshold rule may emit per run.
    pub max_threshold_findings: usize,
    /// Skip candidates whose rule and entity already have an active finding.
    pub dedupe_open_findings: bool,
    /// Six-field cron expression (`sec min hour dom mon dow`), evaluated in UTC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let options = DetectOptions::default();
        Self {
            max_threshold_findings: options.max_threshold_findings,
            dedupe_open_findings: options.dedupe_open_findings,
            schedule: None,
        }
    }
}

impl DetectionConfig {
    pub fn options(&self) -> DetectOptions {
        DetectOptions {
            max_threshold_findings: self.max_threshold_findings,
            dedupe_open_findings: self.dedupe_open_findings,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
