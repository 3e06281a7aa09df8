//! ThreatGate HTTP server.
//!
//! | Method | Path            | Operation                          |
//! |--------|-----------------|------------------------------------|
//! | GET    | `/health`       | liveness, version, detector ids    |
//! | POST   | `/detect`       | classify one item                  |
//! | POST   | `/detect/batch` | sync or async batch                |
//! | GET    | `/batch/:id`    | async job status                   |
//! | DELETE | `/batch/:id`    | cancel an async job                |
//! | GET    | `/stats`        | cache, pool, buffer, batch stats   |
//!
//! # Example
//!
//! ```rust,ignore
//! use threatgate::{BatchOrchestrator, Config};
//!
//! let config = Config::from_env();
//! threatgate::server::serve(BatchOrchestrator::new(config)?).await?;
//! ```

mod handlers;
mod state;

pub use handlers::{create_router, health_check, status_for, ApiError};
pub use state::AppState;

use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::batch::BatchOrchestrator;
use crate::error::{GateError, Result};

/// Bind `server.host:server.port` and serve until Ctrl-C, then shut the
/// gateway down.
pub async fn serve(gateway: BatchOrchestrator) -> Result<()> {
    let addr = gateway.config().server.listen_addr();
    let state = Arc::new(AppState::new(gateway));
    let router = create_router(Arc::clone(&state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| GateError::Io(format!("Failed to bind {addr}: {e}")))?;
    tracing::info!("ThreatGate listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown signal received");
        })
        .await
        .map_err(|e| GateError::Io(format!("Server error: {e}")))?;

    state.gateway.shutdown().await;
    Ok(())
}
