use std::path::Path;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::debug;

use super::AppState;

pub async fn index(State(state): State<AppState>) -> Response {
    serve_file(&state.static_dir, "index.html", "text/html; charset=utf-8").await
}

pub async fn client_js(State(state): State<AppState>) -> Response {
    serve_file(&state.static_dir, "client.js", "application/javascript").await
}

async fn serve_file(dir: &Path, name: &str, content_type: &'static str) -> Response {
    let path = dir.join(name);
    match tokio::fs::read(&path).await {
        Ok(contents) => ([(header::CONTENT_TYPE, content_type)], contents).into_response(),
        Err(err) => {
            debug!(target = "assets", path = %path.display(), error = %err, "static file unavailable");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
