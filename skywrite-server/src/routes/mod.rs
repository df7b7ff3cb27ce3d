//! Route composition. Both inbound surfaces are rate-gated ahead of any
//! session lookup: the auth endpoints and the post endpoints each pass an
//! admission layer before the `CurrentSession` extractor runs.

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{auth, health, posts};
use crate::infra::app_state::AppState;
use crate::infra::config::Config;
use crate::middleware::rate_limit::{inbound_api_rate_limit, inbound_auth_rate_limit};

/// Create the full API router.
pub fn create_api_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/auth/login", get(auth::login))
        .route("/auth/callback", post(auth::callback))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/profile", get(auth::profile))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inbound_auth_rate_limit,
        ));

    let post_routes = Router::new()
        .route("/posts", post(posts::create_post).get(posts::list_posts))
        .route(
            "/posts/{id}",
            get(posts::get_post)
                .put(posts::update_post)
                .delete(posts::delete_post),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inbound_api_rate_limit,
        ));

    Router::new()
        .route("/health", get(health::health))
        .merge(auth_routes)
        .merge(post_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config))
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<axum::http::HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::AllowMethods::mirror_request())
        .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
        .allow_credentials(true)
}
