mod health;

use axum::{routing::get, Router};

use crate::server::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/stats", get(health::stats))
}
