use std::net::SocketAddr;

use anyhow::{Context, Result};
use ghsync_service::config::Config;
use ghsync_service::metric;

use crate::endpoints;
use crate::service::RequestService;

/// Creates the service and runs the HTTP server until it shuts down.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("ghsync-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let service = RequestService::create(&config).context("failed to create service state")?;
    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address `{}`", config.bind))?;

    let server = axum_server::bind(socket).serve(endpoints::create_app(service).into_make_service());
    tracing::info!("Starting HTTP server on {}", socket);
    runtime.block_on(server)?;
    tracing::info!("System shutdown complete");

    Ok(())
}
