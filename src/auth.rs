use axum::{
    extract::State,
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::Response,
};

use crate::{db::sha256_hex, error::AppError, state::AppState, token::verify_run_token};

/// Verifies the run-bound bearer token and exposes the session to handlers.
pub async fn run_token_auth_middleware(
    State(state): State<AppState>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers())?;
    let session = verify_run_token(&state, &token).await?;
    request.extensions_mut().insert(session);
    Ok(next.run(request).await)
}

/// Guards the internal routes used by the operator side of the control plane.
pub async fn internal_auth_middleware(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let expected = state
        .config
        .internal_api_token
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Unauthorized("internal api token is not configured".to_string()))?;

    let provided = bearer_token(request.headers())?;
    if sha256_hex(&provided) != sha256_hex(expected) {
        return Err(AppError::Unauthorized("invalid internal api token".to_string()));
    }

    Ok(next.run(request).await)
}

pub fn bearer_token(headers: &HeaderMap) -> Result<String, AppError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing Authorization header".to_string()))?;

    let token = value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Unauthorized("authorization must be Bearer token".to_string()))?;

    Ok(token.to_string())
}
