//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use symproxy_service::config::Config;
use symproxy_service::metrics;

use crate::healthcheck;
use crate::logging;
use crate::server;

/// symproxy commands.
#[derive(Subcommand)]
enum Command {
    /// Run the web server.
    Run,

    /// Remove leftovers of interrupted downloads.
    Cleanup,

    /// Check the health of a running server.
    Healthcheck {
        /// Address of the server. Defaults to the configured bind address.
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Time to wait for a response.
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(
    bin_name = "symproxy",
    version,
    long_version = option_env!("SYMPROXY_GIT_VERSION")
)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded, no runtime has been started yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();

        if let Some(hostname_tag) = config.metrics.hostname_tag.clone() {
            if tags.contains_key(&hostname_tag) {
                tracing::warn!(
                    "tag {} defined both as hostname tag and as a custom tag",
                    hostname_tag
                );
            }
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(hostname_tag, hostname);
            } else {
                tracing::error!("could not read host name");
            }
        }

        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Cleanup => {
            let reset = symproxy_service::service::cleanup(&config)
                .context("failed to clean up the symbol store")?;
            tracing::info!("Cleanup complete, {} interrupted downloads reset", reset);
        }
        Command::Healthcheck { addr, timeout } => {
            healthcheck::healthcheck(&config, addr, timeout)?;
        }
    }

    Ok(())
}
