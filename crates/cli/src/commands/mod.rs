use clap::Subcommand;
use kiln_config::{BuildConfig, ConfigLoader, ConfigOverrides};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

pub mod build;
pub mod cache;
pub mod graph;

use self::build::BuildArgs;
use self::cache::CacheCommands;
use self::graph::GraphCommands;

#[derive(Subcommand)]
pub enum Commands {
    /// Build every task in a description
    #[command(visible_alias = "b")]
    Build(BuildArgs),

    /// Inspect a build description without running it
    Graph {
        #[command(subcommand)]
        command: GraphCommands,
    },

    /// Maintain the build cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

impl Commands {
    pub async fn execute(self, directory: &Path, config_file: Option<&Path>) -> eyre::Result<ExitCode> {
        match self {
            Commands::Build(args) => build::execute(args, directory, config_file).await,
            Commands::Graph { command } => command.execute(directory),
            Commands::Cache { command } => command.execute(directory, config_file).await,
        }
    }
}

/// Load `kiln.json` (or `config_file`), the environment and `overrides`
pub(crate) fn load_config(
    directory: &Path,
    config_file: Option<&Path>,
    overrides: ConfigOverrides,
) -> eyre::Result<BuildConfig> {
    let mut loader = ConfigLoader::new().directory(directory).overrides(overrides);
    if let Some(file) = config_file {
        loader = loader.file(resolve(directory, file));
    }
    let loaded = loader.load()?;
    tracing::debug!(sources = ?loaded.sources, "configuration loaded");
    Ok(loaded.config)
}

pub(crate) fn resolve(directory: &Path, path: &Path) -> PathBuf {
    kiln_utils::absolutize(directory, path)
}
