use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;

use crate::protocol::GitProtocol;

use super::handlers;

pub struct AppState {
    /// Root directory holding one bare repository per problem alias.
    pub root: PathBuf,
    pub protocol: GitProtocol,
}

async fn health() -> &'static str {
    "OK"
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        status.as_u16(),
        latency.as_millis()
    );

    response
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/{alias}/info/refs", get(handlers::info_refs))
        .route("/{alias}/git-upload-pack", post(handlers::git_upload_pack))
        .route("/{alias}/git-receive-pack", post(handlers::git_receive_pack))
        .route("/{alias}/git-upload-zip", post(handlers::git_upload_zip))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
