pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod errors;

use std::sync::Arc;
use tracing::{info, warn};

// Re-exports
pub use crate::api::routes::{create_router, AppState};
pub use crate::config::Settings;
pub use crate::core::{ClusterApi, ProxmoxClient, Provisioner};
pub use crate::errors::{ProvisionError, ProvisionResult, RemoteError};

/// Builds the client and provisioner from `settings` and serves the API
/// until the process is stopped.
pub async fn run_server(settings: Settings, port: u16) -> anyhow::Result<()> {
    settings.server.check_api_token()?;
    if settings.server.uses_default_token() {
        warn!("server.api_token is still the shipped default; anyone who has read the docs can call this API");
    }

    let client = ProxmoxClient::new(&settings.proxmox)?;
    let provisioner = Arc::new(Provisioner::new(Arc::new(client), &settings));
    let state = Arc::new(AppState {
        provisioner,
        api_token: settings.server.api_token.clone(),
    });

    let app = create_router(state, &settings.server);
    let addr = format!("{}:{}", settings.server.host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
