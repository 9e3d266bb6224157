use tracing_subscriber::EnvFilter;

use denbox::config;
use denbox::relay::{router, RelayState};

#[tokio::main]
async fn main() -> denbox::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    config::init()?;
    let config = config::load()?;

    if config.relay.api_key.is_none() {
        tracing::warn!("No API key configured, relay sockets are unauthenticated");
    }

    let app = router(RelayState::new(&config.relay));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.relay.port)).await?;

    tracing::info!("Denbox relay running on port {}", config.relay.port);

    axum::serve(listener, app).await?;
    Ok(())
}
