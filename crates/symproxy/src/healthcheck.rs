use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use symproxy_service::config::Config;

/// Probes the `/health` endpoint of a running server.
pub fn healthcheck(config: &Config, addr: Option<SocketAddr>, timeout: Duration) -> anyhow::Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => config
            .bind
            .parse()
            .with_context(|| format!("invalid bind address `{}`", config.bind))?,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(check(addr, timeout))
}

async fn check(addr: SocketAddr, timeout: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;

    let url = format!("http://{addr}/health");
    tracing::debug!("Sending request to: {url}");

    let response = client.get(url).send().await;

    match response {
        Ok(response) if response.status().is_success() => {
            println!("OK");
            Ok(())
        }
        Ok(response) => {
            println!("ERROR");
            Err(anyhow::anyhow!(
                "symproxy ({addr}) is unhealthy. Status: {}",
                response.status()
            ))
        }
        Err(error) => {
            println!("ERROR");
            Err(anyhow::anyhow!(
                "Failed to check symproxy ({addr}) health: {error}"
            ))
        }
    }
}
