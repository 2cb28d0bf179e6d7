//! Router and server loop

use std::net::SocketAddr;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tracing::info;
use trickle_core::StreamingService;

use crate::handlers::{list_torrents, remove_torrent, stream_file, torrent_details};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Streaming core all requests go through
    pub service: StreamingService,
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/file/{uri}", get(stream_file))
        .route("/api/torrents", get(list_torrents))
        .route(
            "/api/torrents/{info_hash}",
            get(torrent_details).delete(remove_torrent),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves `service` on `bind` until Ctrl-C, then releases every torrent.
///
/// # Errors
///
/// Returns an I/O error if the address cannot be bound or the server fails.
pub async fn run_server(bind: SocketAddr, service: StreamingService) -> std::io::Result<()> {
    let app = router(AppState {
        service: service.clone(),
    });

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Trickle streaming server running on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await?;

    service.shutdown().await;
    Ok(())
}
