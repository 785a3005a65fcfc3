use clap::{Args, ValueEnum};
use kiln_config::{ConfigOverrides, DependencySeverity, SignatureMode};
use kiln_core::{ByteCount, CancellationSource, EventBus, TracingSink};
use kiln_task::{load_description, BuildResult, Scheduler};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::warn;

/// Exit status for a build stopped by the user
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Clone, Copy, ValueEnum)]
pub enum SignatureArg {
    Metadata,
    Content,
}

impl From<SignatureArg> for SignatureMode {
    fn from(arg: SignatureArg) -> Self {
        match arg {
            SignatureArg::Metadata => SignatureMode::Metadata,
            SignatureArg::Content => SignatureMode::Content,
        }
    }
}

#[derive(Args)]
pub struct BuildArgs {
    /// Build description (JSON)
    #[arg(default_value = "build.json")]
    pub description: PathBuf,

    /// Number of tasks run at once
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Keep building independent tasks after a failure
    #[arg(short = 'k', long = "continue")]
    pub keep_going: bool,

    /// Neither consult nor populate the cache
    #[arg(long)]
    pub no_cache: bool,

    /// How input files are fingerprinted
    #[arg(long, value_enum)]
    pub signatures: Option<SignatureArg>,

    /// Reaction to undeclared dependencies (ignore, warn, error)
    #[arg(long)]
    pub undeclared: Option<DependencySeverity>,

    /// Prune the cache to this size after the build (e.g. 10GB)
    #[arg(long)]
    pub cache_size_limit: Option<ByteCount>,
}

impl BuildArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            parallelism: self.jobs,
            continue_after_errors: self.keep_going.then_some(true),
            cache_enabled: self.no_cache.then_some(false),
            cache_size_limit: self.cache_size_limit,
            signature_mode: self.signatures.map(Into::into),
            dependency_severity: self.undeclared,
            ..ConfigOverrides::default()
        }
    }
}

pub async fn execute(args: BuildArgs, directory: &Path, config_file: Option<&Path>) -> eyre::Result<ExitCode> {
    let config = super::load_config(directory, config_file, args.overrides())?;
    let graph = load_description(&super::resolve(directory, &args.description))?.freeze()?;

    let (interrupt, cancellation) = CancellationSource::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling build");
            interrupt.cancel();
        }
    });

    let scheduler = Scheduler::open(config, directory)?
        .with_events(Arc::new(EventBus::with_sink(Arc::new(TracingSink))))
        .with_cancellation(cancellation);
    let result = scheduler.run(graph).await?;

    report(&result);
    Ok(if result.success() {
        ExitCode::SUCCESS
    } else if result.cancelled_by_user {
        ExitCode::from(EXIT_INTERRUPTED)
    } else {
        ExitCode::FAILURE
    })
}

fn report(result: &BuildResult) {
    for (label, outcome) in &result.results {
        if outcome.is_failure() {
            eprintln!("FAILED {label}: {outcome}");
        }
    }
    for event in &result.errors {
        if event.task.is_none() && event.rule != kiln_core::rules::BUILD_FINISHED {
            eprintln!("error[{}]: {}", event.rule, event.message);
        }
    }
    println!(
        "{} in {:.2}s",
        result.summary,
        result.duration.as_secs_f64()
    );
}
