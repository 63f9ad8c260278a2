//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ghsync_service::caching;
use ghsync_service::config::Config;
use ghsync_service::metrics;

use crate::healthcheck;
use crate::logging;
use crate::server;

/// ghsync commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run the web server.
    Run,

    /// Remove old entries from the file system caches.
    Cleanup {
        /// Remove entries older than this, for example `7d`.
        ///
        /// Defaults to `cleanup_older_than` from the configuration.
        #[arg(long, value_name = "AGE", value_parser = humantime::parse_duration)]
        older_than: Option<Duration>,
    },

    /// Check whether a running server is healthy.
    Healthcheck {
        /// Address of the server. Defaults to `bind` from the configuration.
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Request timeout in seconds.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "ghsync", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    let sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded, no runtime was started yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let hostname = config.metrics.hostname_tag.clone().and_then(|tag| {
            hostname::get()
                .ok()
                .and_then(|s| s.into_string().ok())
                .map(|name| (tag, name))
        });
        let environment = config.metrics.environment_tag.clone().and_then(|tag| {
            sentry
                .options()
                .environment
                .as_ref()
                .map(|name| (tag, name.to_string()))
        });

        let mut tags = config.metrics.custom_tags.clone();
        tags.extend(hostname);
        tags.extend(environment);
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Cleanup { older_than } => {
            let report =
                caching::cleanup(config, older_than).context("failed to clean up caches")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Healthcheck { addr, timeout } => {
            healthcheck::healthcheck(&config, addr, Duration::from_secs(timeout))?
        }
    }

    Ok(())
}
