//! HTTP server bootstrap

use crate::handlers::build_router;
use crate::supervisor::Supervisor;
use nexus_common::{ErrorCode, NexusError, Result};
use std::sync::Arc;
use tracing::info;

/// Bind and serve the application until shutdown.
pub async fn serve(supervisor: Arc<Supervisor>, bind_addr: &str) -> Result<()> {
    let app = build_router(supervisor.clone());

    info!("Starting server on {bind_addr}");
    let listener = tokio::net::TcpListener::bind(bind_addr).await.map_err(|e| {
        NexusError::new(
            ErrorCode::ConfigurationError,
            format!("failed to bind {bind_addr}: {e}"),
            "server",
        )
    })?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .map_err(|e| NexusError::new(ErrorCode::UnknownError, format!("server error: {e}"), "server"))
}
