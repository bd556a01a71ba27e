//! Request middleware.

use axum::{
    extract::State,
    http::{Request, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};

use crate::auth::ApiKeys;

use super::error::ApiError;

/// Require a configured bearer key on the request.
pub async fn require_api_key(
    State(keys): State<ApiKeys>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    if !keys.authorize(header) {
        return Err(ApiError::unauthorized("invalid or missing API key"));
    }

    Ok(next.run(req).await)
}
