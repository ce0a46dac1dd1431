//! PtyBroker
//!
//! Terminal session broker for browser-based shells.

use std::path::PathBuf;

use anyhow::Context;
use broker::config::Config;
use broker::Broker;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// PtyBroker - terminal session broker for browser-based shells.
#[derive(Parser, Debug)]
#[command(name = "ptybroker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the broker
    Serve {
        /// Address to listen on (overrides the configuration)
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Print the configuration as TOML
    Config {
        /// Print the built-in defaults instead of the effective configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    match cli.command {
        Commands::Serve { listen } => {
            if let Some(addr) = listen {
                config.broker.listen_addr = addr;
            }
            config.validate()?;

            let _guard = init_tracing(&config, cli.verbose)?;
            if let Some(path) = &cli.config {
                tracing::info!("Using config file: {:?}", path);
            }
            tracing::info!("PtyBroker starting...");

            let broker = Broker::new(config)?;
            let shutdown = broker.shutdown_token();
            tokio::spawn(async move {
                wait_for_shutdown_signal().await;
                tracing::info!("Received shutdown signal");
                shutdown.cancel();
            });

            broker.run().await?;
        }
        Commands::Config { default } => {
            let config = if default { Config::default() } else { config };
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Sets up the tracing subscriber. The returned guard flushes the log file on
/// drop and must be held for the life of the process.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.broker.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.broker.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "ptybroker.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            _ => {
                tracing::warn!("Failed to register signal handlers, falling back to Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve_with_listen() {
        let cli = Cli::try_parse_from(["ptybroker", "serve", "--listen", "0.0.0.0:9000"]).unwrap();
        match cli.command {
            Commands::Serve { listen } => assert_eq!(listen.as_deref(), Some("0.0.0.0:9000")),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_global_flags() {
        let cli =
            Cli::try_parse_from(["ptybroker", "config", "--default", "-v", "-c", "/tmp/x.toml"])
                .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/x.toml")));
        assert!(matches!(cli.command, Commands::Config { default: true }));
    }
}
