//! API route definitions.

use axum::http::{Method, header};
use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::middleware::require_api_key;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let api_keys = state.api_keys.clone();

    // Protected routes (bearer-key authenticated)
    let protected_routes = Router::new()
        .route("/api/tasks", get(handlers::list_tasks))
        .route("/api/tasks", post(handlers::create_task))
        .route("/api/tasks/{task_id}", get(handlers::get_task))
        .route(
            "/api/github/verify-access",
            post(handlers::verify_github_access),
        )
        .route(
            "/api/sessions/{session_id}/start",
            post(handlers::start_session),
        )
        .route(
            "/api/sessions/{session_id}/stop",
            post(handlers::stop_session),
        )
        .route(
            "/api/sessions/{session_id}",
            delete(handlers::delete_session),
        )
        .route(
            "/api/projects/{project_id}",
            delete(handlers::delete_project),
        )
        .layer(middleware::from_fn_with_state(api_keys, require_api_key))
        .with_state(state.clone());

    // Public routes (no authentication)
    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(cors)
        .layer(trace_layer)
}
