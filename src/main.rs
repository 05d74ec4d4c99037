//! Risk-first trading bot for Bybit USDT perpetuals.
//!
//! Sizes every entry from a fixed fraction of equity at risk, manages
//! partial take-profits, stops and time exits, and keeps an append-only
//! trade and equity ledger.

mod bot;
mod config;
mod error;
mod gateway;
mod indicators;
mod ledger;
mod metrics;
mod models;
mod trading;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::bot::Bot;
use crate::config::AppConfig;
use crate::error::TradingError;
use crate::ledger::{RunState, SqliteLedger};
use crate::metrics::ReportCalculator;

/// Risk-first trading bot CLI.
#[derive(Parser)]
#[command(name = "riskfirst")]
#[command(about = "Risk-sized breakout trading with an append-only ledger", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "RISKFIRST_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL, overrides ledger.database_url
    #[arg(short, long, global = true)]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading loop
    Run {
        /// Paper-trade against live market data
        #[arg(long)]
        dry_run: bool,
    },

    /// Show run state, equity and the latest trades
    Status {
        /// Number of trades to list
        #[arg(short, long, default_value = "10")]
        trades: i64,
    },

    /// Performance report over the ledger
    Report {
        /// Look-back window in days
        #[arg(long, default_value = "30")]
        days: i64,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stop opening new positions (open ones are still managed)
    Pause,

    /// Allow new entries again
    Resume,

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(TradingError::ConfigInvalid(msg)) = e.downcast_ref::<TradingError>() {
                error!(error = %msg, "Invalid configuration, not starting");
            } else {
                error!("Fatal error: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins when set, otherwise `--log-level`.
fn init_logging(level: &str) -> Result<()> {
    if std::env::var("RUST_LOG").is_ok() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        return Ok(());
    }

    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(cli.config.as_deref(), cli.database)?;

    match cli.command {
        Commands::Run { dry_run } => {
            info!(
                dry_run,
                keys = config.connectors.iter().map(|c| c.symbols.len()).sum::<usize>(),
                strategy = config.strategy.kind.as_str(),
                "Starting riskfirst"
            );

            let bot = Bot::from_config(config, dry_run).await?;
            bot.initialize().await?;
            bot.run().await?;
        }

        Commands::Status { trades } => {
            let db = open_ledger(&config).await?;
            let state = db.run_state().await?;
            let latest = db.latest_equity().await?;
            let recent = db.recent_trades(trades).await?;

            println!("\n=== Bot Status ===");
            println!("Run State:        {}", state);
            match latest {
                Some(point) => {
                    let age = Utc::now() - point.time;
                    println!("Equity:           ${:.2}", point.equity);
                    println!("As Of:            {} ({} min ago)", point.time.format("%Y-%m-%d %H:%M:%S"), age.num_minutes());
                }
                None => println!("Equity:           no equity points yet"),
            }

            if recent.is_empty() {
                println!("\nNo trades recorded. Use 'riskfirst run' to start trading.");
                return Ok(());
            }

            println!("\n=== Latest Trades ===");
            println!(
                "{:<20} {:<18} {:<6} {:<6} {:>12} {:>12} {:>10} {:>12}",
                "TIME", "KEY", "TYPE", "SIDE", "PRICE", "QTY", "PNL", "EQUITY"
            );
            println!("{}", "-".repeat(104));
            for t in &recent {
                let pnl = t.pnl.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "-".into());
                println!(
                    "{:<20} {:<18} {:<6} {:<6} {:>12} {:>12} {:>10} {:>12.2}",
                    t.time.format("%Y-%m-%d %H:%M:%S"),
                    truncate(&format!("{}:{}", t.connector, t.symbol), 18),
                    t.kind.as_str(),
                    t.side.as_str(),
                    t.price,
                    t.qty,
                    pnl,
                    t.equity
                );
            }
        }

        Commands::Report { days, json } => {
            let db = open_ledger(&config).await?;
            let since = Utc::now() - Duration::days(days.max(0));
            let trades = db.trades_since(since).await?;
            let curve = db.equity_curve_since(since).await?;

            let report = ReportCalculator::calculate(&trades, &curve);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\n{}", report);
            }
        }

        Commands::Pause => {
            let db = open_ledger(&config).await?;
            db.set_run_state(RunState::Paused).await?;
            println!("Run state: {} (open positions are still managed)", RunState::Paused);
        }

        Commands::Resume => {
            let db = open_ledger(&config).await?;
            db.set_run_state(RunState::Running).await?;
            println!("Run state: {}", RunState::Running);
        }

        Commands::Config => {
            println!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn open_ledger(config: &AppConfig) -> Result<SqliteLedger> {
    let url = config
        .ledger
        .database_url
        .as_deref()
        .context("No database configured (ledger.database_url or --database)")?;
    SqliteLedger::connect(url).await
}

/// Truncate a string to max length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}
