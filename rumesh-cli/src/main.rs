//! Rumesh CLI
//!
//! Thin wrapper around the engine: load a YAML config, run until a signal
//! arrives, exit with a code naming what went wrong.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rumesh_engine::{Config, Engine, Error};

/// Exit codes: 1 config error, 2 device setup error, 3 network bind error
const EXIT_CONFIG: u8 = 1;
const EXIT_DEVICE: u8 = 2;
const EXIT_BIND: u8 = 3;

/// Rumesh - an overlay mesh VPN data plane
#[derive(Parser)]
#[command(name = "rumesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine
    Run {
        /// Path to the YAML configuration file
        #[arg(short, long, default_value = "rumesh.yml")]
        config: PathBuf,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "rumesh.yml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config_path: PathBuf) -> ExitCode {
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {}: {e}", config_path.display());
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    init_logging(&config.logging.level);
    info!("configuration loaded from {}", config_path.display());

    let mut engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let shutdown_tx = engine.create_shutdown_handle();

    let mut engine_handle = tokio::spawn(async move { engine.run().await });

    // None: a signal arrived; Some: the engine bailed on its own, typically a
    // setup failure.
    let early_exit = tokio::select! {
        _ = wait_for_shutdown() => None,
        result = &mut engine_handle => Some(result),
    };

    let result = match early_exit {
        Some(result) => result,
        None => {
            info!("shutting down...");
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(std::time::Duration::from_secs(5), engine_handle).await {
                Ok(result) => result,
                Err(_) => {
                    error!("engine did not stop within the grace period");
                    return ExitCode::SUCCESS;
                }
            }
        }
    };

    match result {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => exit_code_for(&e),
        Err(join_err) => {
            error!("engine task failed: {join_err}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

fn exit_code_for(error: &Error) -> ExitCode {
    error!("engine error: {error}");
    match error {
        Error::Config(_) | Error::ConfigParse(_) | Error::Wire(_) => ExitCode::from(EXIT_CONFIG),
        Error::Tun(_) => ExitCode::from(EXIT_DEVICE),
        Error::Bind(_) | Error::Io(_) => ExitCode::from(EXIT_BIND),
        _ => ExitCode::from(EXIT_CONFIG),
    }
}

fn generate_config(output: PathBuf) -> ExitCode {
    let sample = Config::sample();

    if let Err(e) = std::fs::write(&output, sample) {
        eprintln!("failed to write {}: {e}", output.display());
        return ExitCode::from(EXIT_CONFIG);
    }

    println!("sample configuration written to {}", output.display());
    println!("edit static_host_map and tun.cidr before running.");
    ExitCode::SUCCESS
}

async fn wait_for_shutdown() {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}
