//! Cogex experiment host.
//!
//! ```bash
//! # windowed session with the protocol's defaults
//! cogex run --protocol video-cue --font /usr/share/fonts/truetype/dejavu/DejaVuSans.ttf
//!
//! # simulated subject, no window, as fast as the deadlines allow
//! cogex run --config oddball.json --headless --fast
//! ```

mod app;
mod headless;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cogex_core::{TrialResult, TrialSpec, TrialStatus};
use cogex_experiment::{ExperimentConfig, JsonFileTransmitter, ProtocolKind};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cogex")]
#[command(version, about = "Timed stimulus-response experiments", long_about = None)]
struct Cli {
    /// Logging filter, e.g. `info` or `cogex_experiment=debug`
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one session
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// JSON configuration; fields left out use the protocol's defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Protocol preset, overriding the one named in the configuration
    #[arg(short, long)]
    protocol: Option<ProtocolKind>,

    /// Drive the session with a simulated subject and no window
    #[arg(long)]
    headless: bool,

    /// With --headless, advance a manual clock instead of sleeping
    #[arg(long, requires = "headless")]
    fast: bool,

    /// Directory the session payload is written to
    #[arg(short, long, default_value = "results")]
    output: PathBuf,

    /// Cohort tag stored with the session
    #[arg(long)]
    cohort: Option<String>,

    /// TrueType font for letters and key labels
    #[arg(long, default_value = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf")]
    font: PathBuf,

    /// Seed for trial order and onset jitter
    #[arg(long)]
    seed: Option<u64>,
}

/// Everything a runner needs, resolved from the command line.
pub struct Prepared {
    pub config: ExperimentConfig,
    pub specs: Vec<TrialSpec>,
    pub rng: StdRng,
    pub client: JsonFileTransmitter,
    pub font: PathBuf,
}

fn load_config(path: &Path, protocol: Option<ProtocolKind>) -> Result<ExperimentConfig> {
    let Some(protocol) = protocol else {
        return Ok(ExperimentConfig::load(path)?);
    };
    let text = std::fs::read_to_string(path)?;
    let mut fields: serde_json::Value = serde_json::from_str(&text)?;
    if let Some(object) = fields.as_object_mut() {
        object.insert("protocol".to_string(), serde_json::to_value(protocol)?);
    }
    Ok(ExperimentConfig::from_json_str(&fields.to_string())?)
}

fn prepare(args: &RunArgs) -> Result<Prepared> {
    let mut config = match &args.config {
        Some(path) => load_config(path, args.protocol)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ExperimentConfig::for_protocol(args.protocol.unwrap_or_default()),
    };
    if let Some(cohort) = &args.cohort {
        config.cohort = Some(cohort.clone());
    }
    config.validate().context("validating configuration")?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    };
    let specs = config
        .protocol
        .build_specs(&config, &mut rng)
        .context("building the trial list")?;

    Ok(Prepared {
        config,
        specs,
        rng,
        client: JsonFileTransmitter::new(&args.output),
        font: args.font.clone(),
    })
}

/// Per-status counts and mean reaction time, printed when a session ends.
pub fn print_summary(results: &[TrialResult]) {
    let count = |status: TrialStatus| results.iter().filter(|r| r.status == status).count();
    let rts: Vec<f64> = results.iter().filter_map(|r| r.reaction_time_ms).collect();
    let correct = results.iter().filter(|r| r.correct == Some(true)).count();
    let scored = results.iter().filter(|r| r.correct.is_some()).count();

    println!("\n=== SESSION SUMMARY ===");
    println!("  Trials:      {}", results.len());
    println!("  Responded:   {}", count(TrialStatus::Responded));
    println!("  Timed out:   {}", count(TrialStatus::TimedOut));
    println!("  Natural end: {}", count(TrialStatus::NaturalEndNoResponseRequired));
    println!("  Skipped:     {}", count(TrialStatus::SkippedLoadFailure));
    if scored > 0 {
        println!("  Accuracy:    {:.1}%", correct as f64 * 100.0 / scored as f64);
    }
    if !rts.is_empty() {
        println!("  Mean RT:     {:.1}ms", rts.iter().sum::<f64>() / rts.len() as f64);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("=== COGEX ===");
    println!("Platform: {}", std::env::consts::OS);
    println!("Architecture: {}", std::env::consts::ARCH);

    match cli.command {
        Commands::Run(args) => {
            let prepared = prepare(&args)?;
            info!(
                protocol = %prepared.config.protocol,
                trials = prepared.specs.len(),
                cohort = prepared.config.cohort_tag(),
                output = %args.output.display(),
                "session prepared"
            );
            if args.headless {
                headless::run(prepared, args.fast)
            } else {
                app::App::new(prepared).run()
            }
        }
    }
}
