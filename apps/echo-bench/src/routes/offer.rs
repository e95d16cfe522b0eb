use axum::{body::Bytes, extract::State, Json};
use echo_proto::SessionDescription;

use super::AppState;

/// Answers a WebRTC offer. Malformed offers, failed setups and expired
/// sessions never produce a response; the route timeout closes them.
pub async fn answer_offer(State(state): State<AppState>, body: Bytes) -> Json<SessionDescription> {
    match state.negotiator.negotiate(&body).await {
        Some(answer) => Json(answer),
        None => std::future::pending().await,
    }
}
