//! fedgate - proof-gated federated training driver
//!
//! Wires the in-memory capabilities (digest prover, in-memory ledger,
//! simulated gradients) to a coordinator and runs training rounds locally.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fedgate_core::{
    AgentContribution, DigestProver, FederatedConfig, FederatedCoordinator, InMemoryLedger, Model,
    NoiseCalibrator, SimulatedGradient,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// fedgate - proof-gated federated training driver
#[derive(Parser, Debug)]
#[command(name = "fedgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run simulated training rounds against in-memory capabilities
    Simulate {
        /// Number of synthetic agents contributing per round
        #[arg(long, default_value_t = 3)]
        agents: usize,

        /// Number of rounds to run
        #[arg(long, default_value_t = 1)]
        rounds: u64,

        /// Path to a TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the configured participant cap
        #[arg(long)]
        max_participants: Option<usize>,

        /// Disable noise (σ = 0) so aggregation arithmetic is exact
        #[arg(long)]
        sigma_zero: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command {
        Commands::Simulate {
            agents,
            rounds,
            config,
            max_participants,
            sigma_zero,
        } => simulate(agents, rounds, config, max_participants, sigma_zero).await,
    }
}

async fn simulate(
    agents: usize,
    rounds: u64,
    config_path: Option<PathBuf>,
    max_participants: Option<usize>,
    sigma_zero: bool,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => FederatedConfig::from_file(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => FederatedConfig::default(),
    };
    if let Some(cap) = max_participants {
        config.max_participants = cap;
    }

    let contributions: Vec<AgentContribution> = (1..=agents)
        .map(|i| {
            AgentContribution::new(
                format!("agent-{i}"),
                format!("encrypted-record-{i}").into_bytes(),
                format!("QmSim{i:04}"),
                format!("history-hash-{i:04}"),
            )
        })
        .collect();

    let gradient_dim = config.gradient_dim;
    let mut coordinator = FederatedCoordinator::new(
        DigestProver,
        InMemoryLedger::new(),
        SimulatedGradient::new(gradient_dim),
        Model::diagnosis_demo(gradient_dim),
        config,
    )
    .context("building coordinator")?;
    if sigma_zero {
        coordinator = coordinator.with_noise_calibrator(
            NoiseCalibrator::with_sigma(0.0).context("calibrating zero noise scale")?,
        );
    }

    for _ in 0..rounds {
        let round = coordinator
            .train_round(&contributions)
            .await
            .context("training round failed")?;
        info!(
            round = round.round,
            participants = round.participants,
            excluded = round.agent_errors.len(),
            sigma = round.sigma,
            cumulative_rho = round.cumulative_rho,
            fingerprint = %round.model_fingerprint,
            "round complete"
        );
    }

    info!(
        verifications = coordinator.ledger().total_verifications(),
        pinned = coordinator.ledger().pin_count(),
        "simulation finished"
    );
    Ok(())
}
