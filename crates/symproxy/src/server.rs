use std::net::SocketAddr;

use anyhow::{Context, Result};
use symproxy_service::config::Config;
use symproxy_service::metric;
use symproxy_service::service::SymbolService;

use crate::endpoints;

/// Starts the download runtime and the HTTP server based on loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let io_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("symproxy-io")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("symproxy-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let service = SymbolService::create(&config, io_pool.handle().to_owned())
        .context("failed to create symbol service")?;

    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address `{}`", config.bind))?;
    let server = axum_server::bind(socket).serve(endpoints::create_app(service).into_make_service());
    tracing::info!("Starting HTTP server on {}", socket);
    tracing::info!("Serving symbols from {}", config.cache_dir.display());

    web_pool.block_on(server)?;
    tracing::info!("System shutdown complete");

    Ok(())
}
