//! buildd - HTTP front for the build orchestration engine

pub mod api;
pub mod config;
pub mod state;

use axum::Router;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Full application router with request tracing.
pub fn app(state: AppState) -> Router {
    api::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
