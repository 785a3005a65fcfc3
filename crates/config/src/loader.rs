//! Layered configuration loading.
//!
//! Precedence, lowest to highest: built-in defaults, the JSON config file,
//! `KILN_*` environment variables, explicit command-line overrides.

use crate::config::{BuildConfig, CacheBackendConfig, DependencySeverity, SignatureMode};
use kiln_core::{
    ByteCount, Error, Result, CONFIG_FILENAME, KILN_CACHE_DIR_VAR, KILN_CACHE_ENABLED_VAR,
    KILN_CACHE_SIZE_LIMIT_VAR, KILN_CONTINUE_AFTER_ERRORS_VAR, KILN_DEPENDENCY_VALIDATION_VAR,
    KILN_PARALLELISM_VAR, KILN_SIGNATURE_MODE_VAR,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a configuration layer came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    Default,
    ConfigFile(PathBuf),
    EnvironmentVariable(String),
    CommandLine,
}

/// Values given explicitly on the command line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub parallelism: Option<usize>,
    pub continue_after_errors: Option<bool>,
    pub cache_enabled: Option<bool>,
    pub cache_dir: Option<PathBuf>,
    pub cache_size_limit: Option<ByteCount>,
    pub signature_mode: Option<SignatureMode>,
    pub dependency_severity: Option<DependencySeverity>,
}

impl ConfigOverrides {
    fn is_empty(&self) -> bool {
        *self == ConfigOverrides::default()
    }
}

/// The resolved configuration plus the layers that contributed to it
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: BuildConfig,
    pub sources: Vec<ConfigSource>,
}

pub struct ConfigLoader {
    directory: PathBuf,
    file: Option<PathBuf>,
    env: Option<HashMap<String, String>>,
    overrides: ConfigOverrides,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            directory: PathBuf::from("."),
            file: None,
            env: None,
            overrides: ConfigOverrides::default(),
        }
    }

    /// Directory searched for `kiln.json` when no explicit file is given
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = dir.into();
        self
    }

    /// Explicit config file; a missing explicit file is an error
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Read variables from this map instead of the process environment
    pub fn environment(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn load(self) -> Result<LoadedConfig> {
        let mut config = BuildConfig::default();
        let mut sources = vec![ConfigSource::Default];

        if let Some(path) = self.config_file()? {
            config = load_file(&path)?;
            debug!(path = %path.display(), "loaded config file");
            sources.push(ConfigSource::ConfigFile(path));
        }

        let env = match self.env {
            Some(env) => env,
            None => std::env::vars().collect(),
        };
        let applied = apply_env(&mut config, &env)?;
        if !applied.is_empty() {
            sources.extend(applied.into_iter().map(ConfigSource::EnvironmentVariable));
        }

        if !self.overrides.is_empty() {
            apply_overrides(&mut config, self.overrides);
            sources.push(ConfigSource::CommandLine);
        }

        config.validate()?;
        Ok(LoadedConfig { config, sources })
    }

    fn config_file(&self) -> Result<Option<PathBuf>> {
        match &self.file {
            Some(path) if path.exists() => Ok(Some(path.clone())),
            Some(path) => Err(Error::configuration(format!(
                "config file not found: {}",
                path.display()
            ))),
            None => {
                let candidate = self.directory.join(CONFIG_FILENAME);
                Ok(candidate.exists().then_some(candidate))
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn load_file(path: &Path) -> Result<BuildConfig> {
    let content =
        std::fs::read_to_string(path).map_err(|e| Error::file_system(path, "read config file", e))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::json(format!("invalid config file {}", path.display()), e))
}

/// Apply `KILN_*` variables, returning the names that were used
fn apply_env(config: &mut BuildConfig, env: &HashMap<String, String>) -> Result<Vec<String>> {
    let mut applied = Vec::new();
    let mut take = |name: &str| {
        env.get(name).map(|value| {
            applied.push(name.to_string());
            value.clone()
        })
    };

    if let Some(value) = take(KILN_PARALLELISM_VAR) {
        config.parallelism = value.trim().parse().map_err(|_| {
            Error::configuration(format!("{KILN_PARALLELISM_VAR} must be a positive integer, got '{value}'"))
        })?;
    }
    if let Some(value) = take(KILN_CONTINUE_AFTER_ERRORS_VAR) {
        config.continue_after_errors = parse_bool(KILN_CONTINUE_AFTER_ERRORS_VAR, &value)?;
    }
    if let Some(value) = take(KILN_CACHE_ENABLED_VAR) {
        config.cache.enabled = parse_bool(KILN_CACHE_ENABLED_VAR, &value)?;
    }
    if let Some(value) = take(KILN_CACHE_DIR_VAR) {
        config.cache.backend = CacheBackendConfig::Local {
            path: Some(PathBuf::from(value)),
        };
    }
    if let Some(value) = take(KILN_CACHE_SIZE_LIMIT_VAR) {
        let limit = value
            .parse::<ByteCount>()
            .map_err(|e| Error::configuration(format!("{KILN_CACHE_SIZE_LIMIT_VAR}: {e}")))?;
        config.cache.size_limit = Some(limit);
    }
    if let Some(value) = take(KILN_SIGNATURE_MODE_VAR) {
        config.signature_mode = match value.trim().to_ascii_lowercase().as_str() {
            "metadata" | "stat" => SignatureMode::Metadata,
            "content" => SignatureMode::Content,
            other => {
                return Err(Error::configuration(format!(
                    "{KILN_SIGNATURE_MODE_VAR} must be 'metadata' or 'content', got '{other}'"
                )))
            }
        };
    }
    if let Some(value) = take(KILN_DEPENDENCY_VALIDATION_VAR) {
        config.dependency_validation.severity = value.parse()?;
    }
    Ok(applied)
}

fn apply_overrides(config: &mut BuildConfig, overrides: ConfigOverrides) {
    if let Some(parallelism) = overrides.parallelism {
        config.parallelism = parallelism;
    }
    if let Some(continue_after_errors) = overrides.continue_after_errors {
        config.continue_after_errors = continue_after_errors;
    }
    if let Some(enabled) = overrides.cache_enabled {
        config.cache.enabled = enabled;
    }
    if let Some(dir) = overrides.cache_dir {
        config.cache.backend = CacheBackendConfig::Local { path: Some(dir) };
    }
    if let Some(limit) = overrides.cache_size_limit {
        config.cache.size_limit = Some(limit);
    }
    if let Some(mode) = overrides.signature_mode {
        config.signature_mode = mode;
    }
    if let Some(severity) = overrides.dependency_severity {
        config.dependency_validation.severity = severity;
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{name} must be a boolean, got '{value}'"
        ))),
    }
}
