pub mod auth;
pub mod routes;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use routes::AppState;

/// Build the admin router. Mounted outside the firewall middleware and
/// guarded by the API-key check.
pub fn admin_router(state: AppState, api_key: String) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::get_health))
        .route("/bans", post(routes::create_ban))
        .route(
            "/bans/{fingerprint}",
            get(routes::get_ban_status).delete(routes::delete_ban),
        )
        .route("/whitelist", post(routes::create_whitelist))
        .route("/whitelist/{fingerprint}", delete(routes::delete_whitelist))
        .route("/scores/{fingerprint}", get(routes::get_score))
        .route("/scores/{fingerprint}/reset", post(routes::reset_score))
        .route(
            "/config/limiter",
            get(routes::get_limiter_config).put(routes::update_limiter_config),
        )
        .route("/logs", get(routes::get_logs))
        .layer(middleware::from_fn_with_state(api_key, auth::auth_middleware))
        .layer(cors)
        .with_state(state)
}
