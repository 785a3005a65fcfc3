//! Build configuration model

use kiln_core::{ByteCount, Error, Result, DEFAULT_CACHE_DIR, DEFAULT_LOOKUP_TIMEOUT_MS, DEFAULT_STATE_DIR, DEFAULT_TERMINATION_GRACE_MS};
use kiln_utils::{PathRemapper, PrefixRule};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How input files contribute to a task signature
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMode {
    /// Device, inode, size and modification time
    Metadata,
    /// Size and SHA-256 of the file bytes
    #[default]
    Content,
}

/// When the cache store is validated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationTiming {
    Never,
    #[default]
    PreBuild,
    PreAndPostBuild,
}

/// How cached outputs are placed at their declared paths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializeMode {
    #[default]
    Copy,
    /// Hard link, falling back to copy across filesystems
    Hardlink,
}

/// Cache eviction policy used by `prune`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionKind {
    #[default]
    Lru,
    Lfu,
}

/// Cache backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheBackendConfig {
    /// In-process content-addressable store. `path` defaults to
    /// `<state_dir>/cache`.
    Local {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// Out-of-process store speaking the JSON-lines plugin protocol
    Plugin {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for CacheBackendConfig {
    fn default() -> Self {
        CacheBackendConfig::Local { path: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Rule types that never consult or populate the cache
    pub disabled_rules: Vec<String>,
    pub backend: CacheBackendConfig,
    pub size_limit: Option<ByteCount>,
    pub lookup_timeout_ms: u64,
    pub validation: ValidationTiming,
    pub materialize: MaterializeMode,
    pub eviction: EvictionKind,
    pub prefix_map: Vec<PrefixRule>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled_rules: Vec::new(),
            backend: CacheBackendConfig::default(),
            size_limit: None,
            lookup_timeout_ms: DEFAULT_LOOKUP_TIMEOUT_MS,
            validation: ValidationTiming::default(),
            materialize: MaterializeMode::default(),
            eviction: EvictionKind::default(),
            prefix_map: Vec::new(),
        }
    }
}

/// Reaction to a discovered dependency the graph does not order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencySeverity {
    Ignore,
    #[default]
    Warn,
    Error,
}

impl std::str::FromStr for DependencySeverity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" | "no" | "off" => Ok(DependencySeverity::Ignore),
            "warn" | "warning" | "yes" => Ok(DependencySeverity::Warn),
            "error" => Ok(DependencySeverity::Error),
            other => Err(Error::configuration(format!(
                "unknown dependency validation level '{other}' (expected ignore, warn or error)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DependencyValidationSettings {
    pub severity: DependencySeverity,
    /// Transient subtrees (module caches, scratch dirs) never reported
    pub exempt_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessSettings {
    pub termination_grace_ms: u64,
    pub timeout_ms: Option<u64>,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            termination_grace_ms: DEFAULT_TERMINATION_GRACE_MS,
            timeout_ms: None,
        }
    }
}

/// Complete build configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub parallelism: usize,
    pub continue_after_errors: bool,
    pub signature_mode: SignatureMode,
    pub state_dir: PathBuf,
    pub cache: CacheSettings,
    pub dependency_validation: DependencyValidationSettings,
    pub process: ProcessSettings,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            continue_after_errors: false,
            signature_mode: SignatureMode::default(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            cache: CacheSettings::default(),
            dependency_validation: DependencyValidationSettings::default(),
            process: ProcessSettings::default(),
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl BuildConfig {
    pub fn builder() -> BuildConfigBuilder {
        BuildConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::configuration("parallelism must be at least 1"));
        }
        if self.cache.lookup_timeout_ms == 0 {
            return Err(Error::configuration("cache.lookup_timeout_ms must be positive"));
        }
        if let CacheBackendConfig::Plugin { command, .. } = &self.cache.backend {
            if command.trim().is_empty() {
                return Err(Error::configuration("cache plugin command is empty"));
            }
        }
        for rule in &self.cache.prefix_map {
            if rule.from.as_os_str().is_empty() {
                return Err(Error::configuration("cache.prefix_map entry has an empty 'from'"));
            }
            if rule.to.is_empty() {
                return Err(Error::configuration(format!(
                    "cache.prefix_map entry for '{}' has an empty 'to'",
                    rule.from.display()
                )));
            }
        }
        Ok(())
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.cache.lookup_timeout_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.process.termination_grace_ms)
    }

    pub fn process_timeout(&self) -> Option<Duration> {
        self.process.timeout_ms.map(Duration::from_millis)
    }

    /// Root of the local cache store, resolved against `base`
    pub fn cache_root(&self, base: &Path) -> PathBuf {
        match &self.cache.backend {
            CacheBackendConfig::Local { path: Some(path) } => base.join(path),
            _ => self.state_root(base).join(DEFAULT_CACHE_DIR),
        }
    }

    /// State directory resolved against `base`
    pub fn state_root(&self, base: &Path) -> PathBuf {
        base.join(&self.state_dir)
    }

    /// Whether tasks of `rule` may use the cache at all
    pub fn cache_allowed_for(&self, rule: &str) -> bool {
        self.cache.enabled && !self.cache.disabled_rules.iter().any(|r| r == rule)
    }

    pub fn path_remapper(&self) -> PathRemapper {
        PathRemapper::new(self.cache.prefix_map.clone())
    }
}

/// Builder for programmatic configuration, mostly used by tests and embedders
#[derive(Debug, Clone, Default)]
pub struct BuildConfigBuilder {
    config: BuildConfig,
}

impl BuildConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.config.parallelism = parallelism;
        self
    }

    pub fn continue_after_errors(mut self, continue_after_errors: bool) -> Self {
        self.config.continue_after_errors = continue_after_errors;
        self
    }

    pub fn signature_mode(mut self, mode: SignatureMode) -> Self {
        self.config.signature_mode = mode;
        self
    }

    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.state_dir = dir.into();
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.config.cache.enabled = enabled;
        self
    }

    pub fn cache_backend(mut self, backend: CacheBackendConfig) -> Self {
        self.config.cache.backend = backend;
        self
    }

    pub fn cache_size_limit(mut self, limit: ByteCount) -> Self {
        self.config.cache.size_limit = Some(limit);
        self
    }

    pub fn disable_cache_for_rule(mut self, rule: impl Into<String>) -> Self {
        self.config.cache.disabled_rules.push(rule.into());
        self
    }

    pub fn lookup_timeout(mut self, timeout: Duration) -> Self {
        self.config.cache.lookup_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn validation(mut self, timing: ValidationTiming) -> Self {
        self.config.cache.validation = timing;
        self
    }

    pub fn materialize(mut self, mode: MaterializeMode) -> Self {
        self.config.cache.materialize = mode;
        self
    }

    pub fn prefix_rule(mut self, from: impl Into<PathBuf>, to: impl Into<String>) -> Self {
        self.config.cache.prefix_map.push(PrefixRule {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn dependency_severity(mut self, severity: DependencySeverity) -> Self {
        self.config.dependency_validation.severity = severity;
        self
    }

    pub fn exempt_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.dependency_validation.exempt_paths.push(path.into());
        self
    }

    pub fn termination_grace(mut self, grace: Duration) -> Self {
        self.config.process.termination_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn build(self) -> Result<BuildConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
