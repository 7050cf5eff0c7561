//! Spot trader - main entry point
//!
//! This binary provides three subcommands:
//! - run: Run the trading loop (paper by default, --live for real orders)
//! - scan: One-shot strategy evaluation over the tradable universe
//! - convert: Quote and commit currency conversions

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "spot-trader")]
#[command(about = "Automated spot-market trading engine with signal-confirmed exits", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the trading loop
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/trader.json")]
        config: String,

        /// Live trading mode (CAUTION - REAL MONEY!); paper mode otherwise
        #[arg(long)]
        live: bool,

        /// Override the state directory from the config
        #[arg(long)]
        state_dir: Option<String>,
    },

    /// Evaluate the active strategy over the full tradable universe
    Scan {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/trader.json")]
        config: String,

        /// Number of ranked rows to print
        #[arg(short, long, default_value = "25")]
        top: usize,
    },

    /// Quote (and optionally commit) a currency conversion
    Convert {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/trader.json")]
        config: String,

        /// Source currency (e.g. USD)
        #[arg(long)]
        from: String,

        /// Target currency (e.g. USDC)
        #[arg(long)]
        to: String,

        /// Amount in the source currency
        #[arg(long)]
        amount: String,

        /// Actually execute the conversion instead of only quoting
        #[arg(long)]
        commit: bool,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    // Create logs directory
    std::fs::create_dir_all("logs")?;

    // One session timestamp unifies the trading/REST/WebSocket streams
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Set log level - filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn,tungstenite=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    // File layer - same format but without ANSI colors
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Scan { .. } => "scan",
        Commands::Convert { .. } => "convert",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run {
            config,
            live,
            state_dir,
        } => {
            let code = commands::run::run(config, live, state_dir)?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }

        Commands::Scan { config, top } => commands::scan::run(config, top),

        Commands::Convert {
            config,
            from,
            to,
            amount,
            commit,
        } => commands::convert::run(config, from, to, amount, commit),
    }
}
