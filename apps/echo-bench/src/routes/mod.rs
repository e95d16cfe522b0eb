mod assets;
mod offer;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::event_loop::LoopHandle;
use crate::metrics;
use crate::negotiation::NegotiationOrchestrator;
use crate::ws::WsSettings;

#[derive(Clone)]
pub struct AppState {
    pub handle: LoopHandle,
    pub negotiator: NegotiationOrchestrator,
    pub ws: WsSettings,
    pub static_dir: Arc<PathBuf>,
}

pub fn build_router(state: AppState, offer_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(assets::index))
        .route("/client.js", get(assets::client_js))
        .route("/ws", get(ws::upgrade))
        .route(
            "/offer",
            post(offer::answer_offer).layer(TimeoutLayer::new(offer_timeout)),
        )
        .route("/healthz", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn prometheus_metrics() -> String {
    metrics::export_prometheus()
}
