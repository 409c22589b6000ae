use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::AppState;
use super::handlers;

/// Largest package accepted by upload routes.
const MAX_PACKAGE_BYTES: usize = 64 * 1024 * 1024;

async fn health_check() -> &'static str {
    "ok"
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/api/plugins",
            get(handlers::list_plugins).post(handlers::install_plugin),
        )
        .route(
            "/api/plugins/{id}",
            get(handlers::get_plugin)
                .put(handlers::update_plugin)
                .delete(handlers::uninstall_plugin),
        )
        .route("/api/plugins/{id}/enable", post(handlers::enable_plugin))
        .route("/api/plugins/{id}/disable", post(handlers::disable_plugin))
        .route("/api/capabilities", get(handlers::list_capabilities))
        .route("/api/capabilities/{name}", get(handlers::get_capability))
        .route(
            "/api/capabilities/{name}/invoke",
            post(handlers::invoke_capability),
        )
        .layer(DefaultBodyLimit::max(MAX_PACKAGE_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
