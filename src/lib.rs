pub mod api;
pub mod client;
pub mod config;
pub mod db;
pub mod llm;
pub mod relay;
pub mod session;
pub mod sse;
pub mod store;

use config::RelayConfig;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Bind the configured address and serve the relay until the process exits.
pub async fn run(config: RelayConfig) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.bind).await?;
    serve(listener, config).await
}

/// Serve the relay on an already bound listener.
pub async fn serve(listener: TcpListener, config: RelayConfig) -> std::io::Result<()> {
    match llm::Provider::select(&config) {
        Ok(provider) => info!(
            profile = provider.kind(),
            model = %provider.profile().model,
            api_key = %config::mask_secret(&provider.profile().api_key),
            "Upstream profile available"
        ),
        Err(err) => warn!(error = %err, "No upstream profile configured, chat requests will fail"),
    }
    info!(addr = %listener.local_addr()?, "Relay listening");

    let app = api::router(api::AppState::new(config));
    axum::serve(listener, app).await
}
