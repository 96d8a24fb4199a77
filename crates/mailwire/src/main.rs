//! mailwire daemon and operator tooling.

mod admin;
mod commands;
mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{CheckOptions, CheckProtocol, CheckSecurity};
use crate::config::Config;

/// Distribution-list milter with an admin channel.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "/etc/mailwire/mailwire.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the milter and admin listeners.
    Serve,
    /// List the sessions of a running daemon.
    Status {
        /// Admin address; defaults to the configured admin bind address.
        #[arg(long)]
        admin: Option<SocketAddr>,
    },
    /// Clear the group directory cache of a running daemon.
    FlushCache {
        /// Admin address; defaults to the configured admin bind address.
        #[arg(long)]
        admin: Option<SocketAddr>,
    },
    /// Connect to a mail server and report what it offers.
    Check {
        #[arg(value_enum)]
        protocol: CheckProtocol,
        host: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, value_enum, default_value = "tls")]
        security: CheckSecurity,
        /// Authenticate as this user; the password is read from `MAILWIRE_PASSWORD`.
        #[arg(long)]
        user: Option<String>,
        /// SASL mechanism; plain login if unset.
        #[arg(long)]
        mechanism: Option<String>,
        /// Connect and read timeout in seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = if cli.config.exists() || matches!(cli.command, Command::Serve) {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(threads) = config.runtime.worker_threads {
        runtime.worker_threads(threads);
    }
    if let Some(keep_alive) = config.runtime.thread_keep_alive {
        runtime.thread_keep_alive(Duration::from_secs(keep_alive));
    }
    let runtime = runtime.build().context("failed to start the async runtime")?;

    runtime.block_on(run(cli.command, config))
}

async fn run(command: Command, config: Config) -> Result<()> {
    match command {
        Command::Serve => {
            info!(version = env!("CARGO_PKG_VERSION"), "Starting mailwire");
            commands::serve(config).await
        }
        Command::Status { admin } => commands::status(admin.unwrap_or(config.admin.bind)).await,
        Command::FlushCache { admin } => {
            commands::flush_cache(admin.unwrap_or(config.admin.bind)).await
        }
        Command::Check {
            protocol,
            host,
            port,
            security,
            user,
            mechanism,
            timeout,
        } => {
            let password = match user {
                Some(_) => Some(
                    std::env::var("MAILWIRE_PASSWORD")
                        .context("MAILWIRE_PASSWORD must be set when --user is given")?,
                ),
                None => None,
            };
            commands::check(CheckOptions {
                protocol,
                host,
                port,
                security,
                user,
                mechanism,
                password,
                timeout: Duration::from_secs(timeout),
            })
            .await
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check() {
        let cli = Cli::try_parse_from([
            "mailwire",
            "check",
            "smtp",
            "mail.example.com",
            "--port",
            "587",
            "--security",
            "tls-if-available",
        ])
        .unwrap();
        match cli.command {
            Command::Check {
                protocol,
                port,
                security,
                timeout,
                ..
            } => {
                assert_eq!(protocol, CheckProtocol::Smtp);
                assert_eq!(port, Some(587));
                assert_eq!(security, CheckSecurity::TlsIfAvailable);
                assert_eq!(timeout, 30);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_status_with_admin_override() {
        let cli = Cli::try_parse_from([
            "mailwire",
            "--config",
            "/tmp/none.toml",
            "status",
            "--admin",
            "127.0.0.1:9000",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/none.toml"));
        assert!(matches!(
            cli.command,
            Command::Status { admin: Some(addr) } if addr.port() == 9000
        ));
    }
}
