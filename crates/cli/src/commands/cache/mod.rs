use clap::Subcommand;
use kiln_cache::open_backend;
use kiln_config::ConfigOverrides;
use kiln_core::ByteCount;
use std::path::Path;
use std::process::ExitCode;

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Check the store against its index
    Validate,
    /// Rebuild the index from entry files and drop broken entries
    Recover,
    /// Evict entries until the store fits under a size limit
    Prune {
        /// Size limit (e.g. 10GB); defaults to the configured limit
        #[arg(long)]
        limit: Option<ByteCount>,
    },
    /// Show cache usage
    Stats,
}

impl CacheCommands {
    pub async fn execute(self, directory: &Path, config_file: Option<&Path>) -> eyre::Result<ExitCode> {
        let config = super::load_config(directory, config_file, ConfigOverrides::default())?;
        let cache = open_backend(&config, directory)?;

        match self {
            CacheCommands::Validate => {
                let report = cache.validate().await?;
                if report.skipped {
                    println!("✓ Cache unchanged since the last validation");
                    return Ok(ExitCode::SUCCESS);
                }
                println!(
                    "Checked {} entries and {} blobs",
                    report.checked_entries, report.checked_blobs
                );
                if report.is_healthy() {
                    println!("✓ Cache is consistent");
                    Ok(ExitCode::SUCCESS)
                } else {
                    println!("  Missing blobs: {}", report.missing_blobs.len());
                    println!("  Corrupt blobs: {}", report.corrupt_blobs.len());
                    println!("  Unreadable entries: {}", report.unreadable_entries.len());
                    println!("Run `kiln cache recover` to repair the store");
                    Ok(ExitCode::FAILURE)
                }
            }
            CacheCommands::Recover => {
                let report = cache.recover().await?;
                cache.flush().await?;
                println!(
                    "✓ Recovered {} entries, dropped {}",
                    report.recovered_entries,
                    report.dropped_entries.len()
                );
                Ok(ExitCode::SUCCESS)
            }
            CacheCommands::Prune { limit } => {
                let Some(limit) = limit.or(config.cache.size_limit) else {
                    eyre::bail!("no size limit given and none configured");
                };
                let report = cache.prune(limit).await?;
                cache.flush().await?;
                println!(
                    "✓ Evicted {} entries, reclaimed {}; cache is now {}",
                    report.evicted.len(),
                    report.reclaimed_bytes,
                    report.final_size
                );
                Ok(ExitCode::SUCCESS)
            }
            CacheCommands::Stats => {
                let usage = cache.usage().await?;
                println!("Cache Statistics ({}):", cache.name());
                println!("  Entries: {}", usage.entries);
                println!("  Blobs: {}", usage.blobs);
                println!("  Size: {}", usage.total_bytes);
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}
