use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::info;

use crate::{
    approvals::{list_pending_approvals, resolve_approval},
    auth::{internal_auth_middleware, run_token_auth_middleware},
    error::AppError,
    models::{
        IssueRunTokenRequest, IssuedRunToken, ListApprovalsQuery, ListApprovalsResponse,
        ResolveApprovalRequest, ResolveApprovalResult, RuntimeMode, SessionContext,
        ToolListResponse, ToolName,
    },
    policy,
    state::AppState,
    token::{IssueRunTokenParams, issue_run_token},
    tools::call_tool,
};

pub fn router(state: AppState) -> Router {
    let mcp = Router::new()
        .route("/v1/mcp/tools", get(list_tools))
        .route("/v1/mcp/tools/:tool_name", post(invoke_tool))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            run_token_auth_middleware,
        ));

    let internal = Router::new()
        .route("/internal/v1/runs/:run_id/mcp-token", post(issue_token))
        .route("/internal/v1/approvals", get(list_approvals))
        .route(
            "/internal/v1/approvals/:request_id/resolve",
            post(resolve_approval_request),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            internal_auth_middleware,
        ));

    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/readyz", get(readyz))
        .merge(mcp)
        .merge(internal)
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({"ok": true}))
}

async fn readyz(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    sqlx::query("SELECT 1").execute(&state.db).await?;
    Ok(Json(json!({"ready": true})))
}

/// Request bodies are decoded by hand so malformed input maps onto the problem body.
fn decode_body<T: DeserializeOwned>(body: Option<Json<Value>>) -> Result<T, AppError> {
    let value = match body {
        Some(Json(value)) if !value.is_null() => value,
        _ => json!({}),
    };
    serde_json::from_value(value)
        .map_err(|e| AppError::BadRequest(format!("invalid request body: {e}")))
}

async fn list_tools(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Result<Json<ToolListResponse>, AppError> {
    let (run_ctx, tools) = policy::allowed_tools(&state, &session).await?;
    Ok(Json(ToolListResponse {
        server: state.config.server_name.clone(),
        run_id: run_ctx.session.run_id,
        tools,
    }))
}

async fn invoke_tool(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(tool_name): Path<String>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, AppError> {
    let name = ToolName::parse(&tool_name)
        .ok_or_else(|| AppError::NotFound(format!("tool {tool_name} is not registered")))?;
    let args = body.map(|Json(value)| value).unwrap_or(Value::Null);
    let result = call_tool(&state, &session, name, args).await?;
    Ok(Json(result))
}

async fn issue_token(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    body: Option<Json<Value>>,
) -> Result<Json<IssuedRunToken>, AppError> {
    let request: IssueRunTokenRequest = decode_body(body)?;
    let issued = issue_run_token(
        &state,
        IssueRunTokenParams {
            run_id,
            namespace: request.namespace,
            runtime_mode: RuntimeMode::normalize(&request.runtime_mode),
            ttl_seconds: request.ttl_seconds,
        },
    )
    .await?;
    Ok(Json(issued))
}

async fn list_approvals(
    State(state): State<AppState>,
    Query(query): Query<ListApprovalsQuery>,
) -> Result<Json<ListApprovalsResponse>, AppError> {
    let items = list_pending_approvals(&state, query.limit).await?;
    Ok(Json(ListApprovalsResponse { items }))
}

async fn resolve_approval_request(
    State(state): State<AppState>,
    Path(request_id): Path<i64>,
    body: Option<Json<Value>>,
) -> Result<Json<ResolveApprovalResult>, AppError> {
    let request: ResolveApprovalRequest = decode_body(body)?;
    let result = resolve_approval(
        &state,
        request_id,
        request.decision,
        &request.actor_id,
        &request.reason,
    )
    .await?;
    info!(
        request_id,
        approval_state = result.approval_state.as_str(),
        "approval resolved"
    );
    Ok(Json(result))
}
