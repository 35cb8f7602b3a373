//! HTTP surface.

pub mod error;
pub mod handlers;
pub mod sessions;
pub mod subscription;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

pub use error::ApiError;

use crate::links::LinkBuilder;
use crate::sessions::SessionMonitor;
use crate::slots::SlotSwitchController;
use crate::storage::Database;
use crate::traffic::TrafficPoller;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub switch: Arc<SlotSwitchController>,
    pub links: Arc<LinkBuilder>,
    pub sessions: Arc<SessionMonitor>,
    pub traffic: Arc<TrafficPoller>,
    /// `/sessions` window when the caller gives none.
    pub default_window: u64,
}

/// Build the router. Subscriptions are served both at `/sub/{id}` and
/// under the configured front prefix.
pub fn build_router(state: AppState) -> Router {
    let prefix = state.links.config().sub_prefix.trim_matches('/').to_string();

    let mut router = Router::new()
        .route("/create", post(handlers::create))
        .route("/refresh", post(handlers::rotate))
        .route("/rotate", post(handlers::rotate))
        .route("/revoke", post(handlers::revoke))
        .route("/pause", post(handlers::pause))
        .route("/resume", post(handlers::resume))
        .route("/setname", post(handlers::set_name))
        .route("/list", get(handlers::list))
        .route("/sessions", get(sessions::sessions))
        .route("/health", get(handlers::health))
        .route("/sub/{id}", get(subscription::subscription));

    if !prefix.is_empty() {
        router = router.route(
            &format!("/{prefix}/sub/{{id}}"),
            get(subscription::subscription),
        );
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
