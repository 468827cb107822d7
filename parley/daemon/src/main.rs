//! Parley Daemon - WebSocket Conversation Server
//!
//! Serves `parley-core` conversations to real-time clients over WebSocket.
//! Every connection becomes one client; text frames carry the JSON protocol.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (echo generator on 127.0.0.1:12393)
//! parley-daemon
//!
//! # Custom listener and backend
//! parley-daemon --bind 0.0.0.0:12393 --generator ollama
//!
//! # With config file
//! parley-daemon --config ~/.config/parley/config.toml
//!
//! # Verbose logging
//! RUST_LOG=parley=debug parley-daemon
//! ```
//!
//! # Configuration Priority
//!
//! CLI flags > `PARLEY_*` environment variables > config file > defaults.
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use parley_core::config::GeneratorKind;
use parley_core::{default_config_path, load_config_from_path, ConfigSource, ConversationHub, ParleyConfig};

use server::DaemonServer;

/// Parley Daemon - real-time AI persona conversations over WebSocket
#[derive(Parser, Debug)]
#[command(name = "parley-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "PARLEY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides `server.bind`)
    #[arg(short = 'b', long, value_name = "ADDR")]
    bind: Option<String>,

    /// Log filter, e.g. `info` or `parley_core=debug` (overrides RUST_LOG)
    #[arg(short = 'l', long, env = "PARLEY_LOG_LEVEL", value_name = "FILTER")]
    log_level: Option<String>,

    /// Reply generation backend (echo, ollama)
    #[arg(short = 'g', long, value_name = "BACKEND")]
    generator: Option<GeneratorKind>,
}

/// Initialize logging
///
/// An explicit filter wins; otherwise `RUST_LOG`, otherwise `parley=info`.
fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => tracing_subscriber::EnvFilter::new(directives),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("parley=info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load the config file and environment, then apply CLI overrides
fn resolve_config(args: &Args) -> Result<ParleyConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path.as_deref())
        .with_context(|| format!("Failed to load configuration from {path:?}"))?;

    let mut overridden = false;
    if let Some(bind) = &args.bind {
        config.server.bind.clone_from(bind);
        overridden = true;
    }
    if let Some(generator) = args.generator {
        config.generator.backend = generator;
        overridden = true;
    }
    if overridden {
        config.set_source(ConfigSource::Cli);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, initiating shutdown"),
        () = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    info!("Parley daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&args)?;
    info!(
        bind = %config.server.bind,
        generator = ?config.generator.backend,
        character = %config.character.name,
        source = ?config.source(),
        "Configuration loaded"
    );

    let server = DaemonServer::new(ConversationHub::new(config));
    match server.run(shutdown_signal()).await {
        Ok(()) => {
            info!("Parley daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(argv: &[&str]) -> Args {
        let mut full = vec!["parley-daemon"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap()
    }

    fn config_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_file_values_are_used() {
        let file = config_file("[server]\nbind = \"0.0.0.0:9000\"\n\n[character]\nname = \"Mao\"\n");
        let path = file.path().to_str().unwrap();

        let config = resolve_config(&args(&["--config", path])).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.character.name, "Mao");
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = config_file("[server]\nbind = \"0.0.0.0:9000\"\n");
        let path = file.path().to_str().unwrap();

        let config = resolve_config(&args(&[
            "--config",
            path,
            "--bind",
            "127.0.0.1:7000",
            "--generator",
            "ollama",
        ]))
        .unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:7000");
        assert_eq!(config.generator.backend, GeneratorKind::Ollama);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let file = config_file("[server]\nchannel_capacity = 0\n");
        let path = file.path().to_str().unwrap();

        assert!(resolve_config(&args(&["--config", path])).is_err());
    }

    #[test]
    fn test_unknown_generator_rejected_by_cli() {
        let result = Args::try_parse_from(["parley-daemon", "--generator", "gpt"]);
        assert!(result.is_err());
    }
}
