//! Scrape endpoint.
//!
//! Provides:
//! - `/metrics` - Prometheus text exposition of the metrics store

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::metrics::MetricsStore;

pub fn create_router(store: Arc<MetricsStore>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(store)
}

async fn metrics_handler(State(store): State<Arc<MetricsStore>>) -> impl IntoResponse {
    match store.render() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
                .into_response()
        }
    }
}

/// Binds `0.0.0.0:<port>` and serves until `shutdown` resolves.
pub async fn serve<F>(port: u16, store: Arc<MetricsStore>, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Serving metrics");
    axum::serve(listener, create_router(store))
        .with_graceful_shutdown(shutdown)
        .await
}
