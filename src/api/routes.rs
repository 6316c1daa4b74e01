//! Route table and middleware stack.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post, put};
use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::app::AppContext;

use super::handlers;
use super::middleware::{auth_middleware, request_id_middleware, AuthState};

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any)
}

/// Build the full router for the service.
pub fn router(context: Arc<AppContext>) -> Router {
    let auth_state = Arc::new(AuthState::new(&context.config.auth));
    let request_timeout = Duration::from_secs(context.config.http.request_timeout_secs);

    Router::new()
        .route("/v1/citizen/:cpf", get(handlers::get_citizen))
        .route("/v1/citizen/:cpf/address", put(handlers::put_address))
        .route("/v1/citizen/:cpf/email", put(handlers::put_email))
        .route("/v1/citizen/:cpf/ethnicity", put(handlers::put_ethnicity))
        .route(
            "/v1/citizen/:cpf/phone",
            put(handlers::put_phone).delete(handlers::cancel_phone),
        )
        .route(
            "/v1/citizen/:cpf/phone/validate",
            post(handlers::validate_phone),
        )
        .route(
            "/v1/citizen/:cpf/firstlogin",
            get(handlers::get_first_login).put(handlers::put_first_login),
        )
        .route(
            "/v1/citizen/:cpf/optin",
            get(handlers::get_opt_in).put(handlers::put_opt_in),
        )
        .route(
            "/v1/citizen/:cpf/avatar",
            get(handlers::get_avatar).put(handlers::put_avatar),
        )
        .route("/v1/phone/:telefone/cpf", get(handlers::resolve_phone))
        .route(
            "/v1/admin/phone/:telefone/release",
            post(handlers::release_phone_mapping),
        )
        .route("/v1/admin/queue/dead/:kind", get(handlers::dead_letters))
        .route("/v1/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(context)
}
