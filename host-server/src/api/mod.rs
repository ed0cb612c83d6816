use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub mod channel;
pub mod health;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/tunnel", get(channel::upgrade))
        .with_state(state)
}
