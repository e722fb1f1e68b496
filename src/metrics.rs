//! Process-wide counters and the optional profiling/status HTTP surface,
//! gated on `sinker.pprof_http_port != 0`. Grounded in the source's global
//! atomic counters exposed through a small `/status` endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use tracing::info;

#[derive(Default)]
pub struct Metrics {
    pub consumed: AtomicU64,
    pub enriched: AtomicU64,
    pub dropped_unattributable: AtomicU64,
    pub dropped_validation: AtomicU64,
    pub ddl_statements: AtomicU64,
}

#[derive(Serialize)]
struct Snapshot {
    consumed: u64,
    enriched: u64,
    dropped_unattributable: u64,
    dropped_validation: u64,
    ddl_statements: u64,
}

impl Metrics {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            consumed: self.consumed.load(Ordering::Relaxed),
            enriched: self.enriched.load(Ordering::Relaxed),
            dropped_unattributable: self.dropped_unattributable.load(Ordering::Relaxed),
            dropped_validation: self.dropped_validation.load(Ordering::Relaxed),
            ddl_statements: self.ddl_statements.load(Ordering::Relaxed),
        }
    }
}

async fn status_handler(metrics: axum::extract::State<Arc<Metrics>>) -> Json<Snapshot> {
    Json(metrics.snapshot())
}

/// Starts the status endpoint on `port` if non-zero; returns the join
/// handle so the supervisor can abort it on shutdown.
pub fn maybe_spawn_status_server(metrics: Arc<Metrics>, port: u16) -> Option<tokio::task::JoinHandle<()>> {
    if port == 0 {
        return None;
    }
    let app = Router::new()
        .route("/status", get(status_handler))
        .with_state(metrics);

    Some(tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        info!("status http server listening on {addr}");
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!("status http server error: {e}");
                }
            }
            Err(e) => tracing::error!("failed to bind status http server on {addr}: {e}"),
        }
    }))
}
