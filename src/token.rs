use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::Serialize;
use tracing::info;

use crate::{
    audit::{ACTOR_ID_CONTROL_PLANE_MCP, ActorType, EventType, marshal_event_payload},
    config::Config,
    error::AppError,
    models::{IssuedRunToken, RunTokenClaims, RuntimeMode, SessionContext},
    runs::get_run,
    state::AppState,
};

#[derive(Debug, Clone)]
pub struct IssueRunTokenParams {
    pub run_id: String,
    pub namespace: String,
    pub runtime_mode: RuntimeMode,
    pub ttl_seconds: Option<i64>,
}

#[derive(Serialize)]
struct RunTokenIssuedPayload<'a> {
    run_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    project_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    namespace: &'a str,
    runtime_mode: &'a str,
    expires_at: DateTime<Utc>,
}

/// Non-positive or missing TTL falls back to the default; the result always lies in `[min, max]`.
pub fn clamp_ttl_seconds(config: &Config, requested: Option<i64>) -> i64 {
    let ttl = requested
        .filter(|ttl| *ttl > 0)
        .unwrap_or(config.token_ttl_seconds);
    let min = config.token_min_ttl_seconds.max(1);
    let max = config.token_max_ttl_seconds.max(min);
    ttl.clamp(min, max)
}

pub async fn issue_run_token(
    state: &AppState,
    params: IssueRunTokenParams,
) -> Result<IssuedRunToken, AppError> {
    let run_id = params.run_id.trim();
    if run_id.is_empty() {
        return Err(AppError::BadRequest("run_id is required".to_string()));
    }
    let namespace = params.namespace.trim();
    if params.runtime_mode == RuntimeMode::FullEnv && namespace.is_empty() {
        return Err(AppError::BadRequest(
            "namespace is required for full-env runtime mode".to_string(),
        ));
    }

    let run = get_run(&state.db, run_id)
        .await?
        .ok_or_else(|| AppError::NotFound("run not found".to_string()))?;
    if !run.is_active() {
        return Err(AppError::Conflict(format!(
            "run is not active: {}",
            run.status.trim()
        )));
    }

    let ttl = clamp_ttl_seconds(&state.config, params.ttl_seconds);
    let now = Utc::now();
    let expires_at = now + Duration::seconds(ttl);

    let claims = RunTokenClaims {
        iss: state.config.token_issuer.clone(),
        sub: format!("run:{run_id}"),
        iat: now.timestamp() as usize,
        nbf: now.timestamp() as usize,
        exp: expires_at.timestamp() as usize,
        run_id: run_id.to_string(),
        correlation_id: run.correlation_id.trim().to_string(),
        project_id: run.project_id.trim().to_string(),
        namespace: namespace.to_string(),
        runtime_mode: params.runtime_mode.as_str().to_string(),
    };
    let token = sign_run_token(&claims, &state.config.token_signing_key)?;

    let payload = RunTokenIssuedPayload {
        run_id,
        project_id: &claims.project_id,
        namespace,
        runtime_mode: params.runtime_mode.as_str(),
        expires_at,
    };
    state
        .audit
        .record(
            &claims.correlation_id,
            ActorType::System,
            ACTOR_ID_CONTROL_PLANE_MCP,
            EventType::RunMcpTokenIssued,
            marshal_event_payload(&payload),
        )
        .await;

    info!(
        run_id = %run_id,
        runtime_mode = params.runtime_mode.as_str(),
        ttl_seconds = ttl,
        "run token issued"
    );

    Ok(IssuedRunToken { token, expires_at })
}

pub fn sign_run_token(claims: &RunTokenClaims, signing_key: &str) -> Result<String, AppError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(signing_key.as_bytes()),
    )
    .map_err(|e| AppError::internal(format!("failed to sign run token: {e}")))
}

/// Signature, algorithm, issuer and expiry checks only; no run lookup.
pub fn decode_run_token(
    raw: &str,
    signing_key: &str,
    issuer: &str,
) -> Result<SessionContext, AppError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AppError::Unauthorized("token is required".to_string()));
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[issuer]);
    validation.set_required_spec_claims(&["exp", "iss", "sub"]);
    validation.validate_nbf = true;
    validation.leeway = 0;

    let decoded = decode::<RunTokenClaims>(
        raw,
        &DecodingKey::from_secret(signing_key.as_bytes()),
        &validation,
    )
    .map_err(|e| AppError::Unauthorized(format!("invalid token: {e}")))?;
    let claims = decoded.claims;

    let run_id = claims.run_id.trim();
    if run_id.is_empty() {
        return Err(AppError::Unauthorized("token missing run_id".to_string()));
    }
    let correlation_id = claims.correlation_id.trim();
    if correlation_id.is_empty() {
        return Err(AppError::Unauthorized("token missing correlation_id".to_string()));
    }
    let expires_at = Utc
        .timestamp_opt(claims.exp as i64, 0)
        .single()
        .ok_or_else(|| AppError::Unauthorized("token missing expiration".to_string()))?;

    Ok(SessionContext {
        run_id: run_id.to_string(),
        correlation_id: correlation_id.to_string(),
        project_id: claims.project_id.trim().to_string(),
        namespace: claims.namespace.trim().to_string(),
        runtime_mode: RuntimeMode::normalize(&claims.runtime_mode),
        expires_at,
    })
}

/// Full verification: token checks plus a live lookup of the bound run.
pub async fn verify_run_token(state: &AppState, raw: &str) -> Result<SessionContext, AppError> {
    let session = decode_run_token(
        raw,
        &state.config.token_signing_key,
        &state.config.token_issuer,
    )?;

    let run = get_run(&state.db, &session.run_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized("run not found".to_string()))?;
    if !run.is_active() {
        return Err(AppError::Unauthorized("run is not active".to_string()));
    }
    if run.correlation_id.trim() != session.correlation_id {
        return Err(AppError::Unauthorized("token correlation mismatch".to_string()));
    }
    let run_project = run.project_id.trim();
    if !run_project.is_empty()
        && !session.project_id.is_empty()
        && run_project != session.project_id
    {
        return Err(AppError::Unauthorized("token project mismatch".to_string()));
    }

    Ok(session)
}
