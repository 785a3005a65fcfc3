//! Configuration for kiln builds.
//!
//! [`BuildConfig`] is the resolved configuration; [`ConfigLoader`] layers
//! defaults, the `kiln.json` file, `KILN_*` environment variables and
//! command-line overrides.

pub mod config;
pub mod loader;


pub use config::{
    BuildConfig, BuildConfigBuilder, CacheBackendConfig, CacheSettings, DependencySeverity,
    DependencyValidationSettings, EvictionKind, MaterializeMode, ProcessSettings, SignatureMode,
    ValidationTiming,
};
pub use loader::{ConfigLoader, ConfigOverrides, ConfigSource, LoadedConfig};
