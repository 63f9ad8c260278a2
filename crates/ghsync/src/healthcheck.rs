use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ghsync_service::config::Config;

/// Queries the healthcheck endpoint of a running server, printing `OK` or `ERROR`.
pub fn healthcheck(config: &Config, addr: Option<SocketAddr>, timeout: Duration) -> Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => config.bind.parse().context("invalid bind address")?,
    };

    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()?;
    let url = format!("http://{addr}/healthcheck");
    tracing::debug!("Sending request to: {url}");

    match client.get(url).send() {
        Ok(response) if response.status().is_success() => {
            println!("OK");
            Ok(())
        }
        Ok(response) => {
            println!("ERROR");
            bail!("ghsync ({addr}) is unhealthy. Status: {}", response.status())
        }
        Err(error) => {
            println!("ERROR");
            bail!("failed to check ghsync ({addr}) health: {error}")
        }
    }
}
