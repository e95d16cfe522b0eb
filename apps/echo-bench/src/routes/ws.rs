use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

use super::AppState;
use crate::ws::serve_socket;

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let settings = state.ws;
    let handle = state.handle.clone();
    ws.max_message_size(settings.max_message_size)
        .max_frame_size(settings.max_message_size)
        .on_upgrade(move |socket| serve_socket(socket, handle, settings))
}
