use std::env;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fedsignal::{CancelToken, Config, InferenceMode, ModelSource, run_inference, run_training};

const DEFAULT_CONFIG: &str = "fedsignal.json";

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ModeArg {
    Fixed,
    Rl,
    #[value(name = "rl_priority", alias = "rl-priority")]
    RlPriority,
}

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum ModelArg {
    #[default]
    Global,
    Junction,
}

#[derive(Debug, Parser)]
#[command(
    name = "fedsignal",
    about = "Federated PPO traffic-signal control",
    version
)]
struct Cli {
    /// Config file; defaults to FEDSIGNAL_CONFIG, then fedsignal.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run federated training rounds
    Train {
        /// Continue from the saved global model (default from config)
        #[arg(long, conflicts_with = "fresh")]
        resume: bool,
        /// Ignore any saved global model
        #[arg(long)]
        fresh: bool,
        /// Override the round budget
        #[arg(long)]
        rounds: Option<u64>,
    },
    /// Run one inference session
    Infer {
        #[arg(long, value_enum)]
        mode: ModeArg,
        /// Which saved weights the learned modes use
        #[arg(long, value_enum, default_value_t = ModelArg::Global)]
        model: ModelArg,
        /// Override the step budget
        #[arg(long)]
        max_steps: Option<u64>,
    },
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fedsignal=debug,info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = path
        .or_else(|| env::var("FEDSIGNAL_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    tracing::info!("Loading config from {}", path.display());

    let mut config = Config::load(&path)?;
    config.apply_env_overrides();
    Ok(config)
}

/// Cancel the token on Ctrl-C; the coordinator checks it between phases
fn cancel_on_interrupt() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current phase");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_logging()?;

    let cli = Cli::parse();
    let mut config = load_config(cli.config)?;

    match cli.command {
        Command::Train {
            resume,
            fresh,
            rounds,
        } => {
            if resume {
                config.federation.resume = true;
            }
            if fresh {
                config.federation.resume = false;
            }
            if let Some(rounds) = rounds {
                config.federation.rounds = rounds;
            }

            let summary = run_training(&config, cancel_on_interrupt()).await?;
            println!(
                "rounds attempted={} aggregated={} abandoned={} discarded={} | global round {}{}",
                summary.attempted,
                summary.aggregated,
                summary.abandoned,
                summary.discarded,
                summary.final_round,
                if summary.interrupted { " (interrupted)" } else { "" }
            );
        }
        Command::Infer {
            mode,
            model,
            max_steps,
        } => {
            let mode = match mode {
                ModeArg::Fixed => InferenceMode::Fixed,
                ModeArg::Rl => InferenceMode::Rl,
                ModeArg::RlPriority => InferenceMode::RlPriority,
            };
            let source = match model {
                ModelArg::Global => ModelSource::Global,
                ModelArg::Junction => ModelSource::Junction,
            };
            if let Some(max_steps) = max_steps {
                config.inference.max_steps = max_steps;
            }

            match run_inference(&config, mode, source).await {
                Ok(summary) => {
                    println!("{} | {} ticks | log {}", mode, summary.ticks, summary.log_path.display());
                    for junction in &summary.junctions {
                        println!(
                            "  {:<12} mean queue {:>7.2}  waiting {:>10.1}s  gridlocks {:>3}  priority overrides {:>3}",
                            junction.junction.as_str(),
                            junction.mean_queue,
                            junction.final_cumulative_waiting,
                            junction.gridlocks,
                            junction.priority_overrides
                        );
                    }
                }
                // existing logs are left untouched; not a process failure
                Err(e) => tracing::error!("Inference mode {} failed: {}", mode, e),
            }
        }
    }

    Ok(())
}
