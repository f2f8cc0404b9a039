use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use keel_config::{load_config, AppConfig};
use keel_core::TradingMode;
use tracing::info;

use crate::live::{LiveRuntime, ShutdownSignal};
use crate::state;
use crate::telemetry::init_tracing;

#[derive(Parser)]
#[command(author, version, about = "Keel autonomous trading core")]
pub struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long, default_value = "default")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reconcile, then run the trading core until ctrl-c
    Run(RunArgs),
    /// Persisted state utilities
    State {
        #[command(subcommand)]
        action: StateCommand,
    },
    /// Compare local state with the exchange without changing anything
    Reconcile(ReconcileArgs),
    /// Fees, deposits, ROI and recent daily P&L
    Pnl(PnlArgs),
}

#[derive(Subcommand)]
pub enum StateCommand {
    /// Print the state rebuilt from the database
    Inspect(StateInspectArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Overrides the configured trading mode (paper or live)
    #[arg(long)]
    mode: Option<TradingMode>,
    /// Overrides the configured database file
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,
    /// Overrides the JSON log file
    #[arg(long, value_name = "PATH")]
    log_path: Option<PathBuf>,
    /// Overrides the Prometheus listen address; empty disables the endpoint
    #[arg(long)]
    metrics_addr: Option<String>,
}

impl RunArgs {
    fn resolved_log_path(&self, config: &AppConfig) -> PathBuf {
        self.log_path
            .clone()
            .unwrap_or_else(|| config.live.log_path.clone())
    }

    fn apply(&self, config: &mut AppConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(path) = &self.db {
            config.database_path = path.clone();
        }
        if let Some(addr) = &self.metrics_addr {
            config.live.metrics_addr = addr.clone();
        }
    }

    async fn run(self, mut config: AppConfig) -> Result<()> {
        self.apply(&mut config);
        info!(
            mode = %config.mode,
            driver = %config.exchange.driver,
            db = %config.database_path.display(),
            "starting trading core"
        );
        let runtime = LiveRuntime::build(config, ShutdownSignal::new()).await?;
        runtime.run().await
    }
}

#[derive(Args)]
pub struct StateInspectArgs {
    /// Overrides the configured database file
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,
    /// Reads the state recorded for this mode instead of the configured one
    #[arg(long)]
    mode: Option<TradingMode>,
    /// Emit the report as JSON
    #[arg(long)]
    raw: bool,
}

#[derive(Args)]
pub struct ReconcileArgs {
    #[arg(long)]
    mode: Option<TradingMode>,
    /// Emit the audit record as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
pub struct PnlArgs {
    #[arg(long)]
    mode: Option<TradingMode>,
    /// Number of daily rows to print
    #[arg(long, default_value_t = 7)]
    days: usize,
    #[arg(long)]
    json: bool,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(Some(&cli.env)).context("failed to load configuration")?;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    });

    let log_override = match &cli.command {
        Commands::Run(args) => Some(args.resolved_log_path(&config)),
        _ => None,
    };

    init_tracing(&filter, log_override.as_deref()).context("failed to initialize logging")?;

    match cli.command {
        Commands::Run(args) => args.run(config).await?,
        Commands::State { action } => handle_state(action, config).await?,
        Commands::Reconcile(args) => {
            let config = with_mode(config, args.mode);
            state::reconcile_dry_run(&config, args.json).await?;
        }
        Commands::Pnl(args) => {
            let config = with_mode(config, args.mode);
            state::pnl_report(&config, args.days, args.json).await?;
        }
    }

    Ok(())
}

async fn handle_state(cmd: StateCommand, config: AppConfig) -> Result<()> {
    match cmd {
        StateCommand::Inspect(args) => {
            let mut config = with_mode(config, args.mode);
            if let Some(path) = args.db {
                config.database_path = path;
            }
            state::inspect_state(&config, args.raw).await?;
        }
    }
    Ok(())
}

fn with_mode(mut config: AppConfig, mode: Option<TradingMode>) -> AppConfig {
    if let Some(mode) = mode {
        config.mode = mode;
    }
    config
}
