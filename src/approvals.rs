use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::{
    actions::{
        NewActionRequest, count_pending_for_run, expire_stale_pending, find_pending_by_signature,
        get_action_request, insert_action_request, list_pending, update_action_state,
    },
    audit::{ACTOR_ID_CONTROL_PLANE_MCP, ActorType, EventType},
    control_tools::{apply_database_lifecycle, apply_secret_sync},
    error::AppError,
    models::{
        ActionRequest, ApprovalDecision, ApprovalListItem, ApprovalMode, ApprovalState,
        DatabaseLifecyclePayload, ResolveApprovalResult, ResolvedRunContext, RuntimeMode,
        SecretSyncPayload, SessionContext, ToolCapability, ToolName,
    },
    run_context::resolve_run_context,
    runs::{WAIT_STATE_MCP, reconcile_wait_state, set_wait_state},
    state::AppState,
};

const DEFAULT_APPROVAL_LIST_LIMIT: i64 = 100;
const MAX_APPROVAL_LIST_LIMIT: i64 = 500;
const EXPIRY_REASON: &str = "approval ttl elapsed";
/// An `approved` row untouched for longer than this lost its applier.
const APPLY_LEASE_SECONDS: i64 = 600;
const APPLY_INTERRUPTED: &str = "apply interrupted before completion";

/// Result of a pending-request lookup-or-create.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub request: ActionRequest,
    pub created: bool,
}

/// Stable requester identity recorded on every action request of a run.
pub fn request_actor_id(run_ctx: &ResolvedRunContext) -> String {
    let key = run_ctx.payload.agent_key();
    if key.is_empty() {
        "agent:unknown".to_string()
    } else {
        format!("agent:{key}")
    }
}

fn approval_cutoff(state: &AppState) -> DateTime<Utc> {
    Utc::now() - Duration::seconds(state.config.approval_ttl_seconds.max(1))
}

fn expiry_patch() -> Value {
    json!({
        "decision": ApprovalState::Expired.as_str(),
        "actor_id": ACTOR_ID_CONTROL_PLANE_MCP,
        "reason": EXPIRY_REASON,
        "decided_at": Utc::now(),
    })
}

fn new_action_request(
    run_ctx: &ResolvedRunContext,
    tool: ToolName,
    action: &str,
    target_ref: &Value,
    mode: ApprovalMode,
    state: ApprovalState,
    applied_by: &str,
    payload: Value,
) -> NewActionRequest {
    NewActionRequest {
        correlation_id: run_ctx.session.correlation_id.clone(),
        run_id: run_ctx.session.run_id.clone(),
        project_id: run_ctx.session.project_id.clone(),
        tool_name: tool,
        action: action.to_string(),
        target_ref: target_ref.clone(),
        approval_mode: mode,
        approval_state: state,
        requested_by: request_actor_id(run_ctx),
        applied_by: applied_by.to_string(),
        payload,
    }
}

/// Returns the pending request for this signature, creating it (and pausing the run) when absent.
pub async fn ensure_pending_approval_request(
    state: &AppState,
    run_ctx: &ResolvedRunContext,
    tool: &ToolCapability,
    action: &str,
    target_ref: &Value,
    mode: ApprovalMode,
    payload: Value,
) -> Result<PendingApproval, AppError> {
    let run_id = run_ctx.session.run_id.as_str();
    let item = new_action_request(
        run_ctx,
        tool.name,
        action,
        target_ref,
        mode,
        ApprovalState::Requested,
        "",
        payload,
    );

    let mut tx = state.db.begin().await?;

    let expired = expire_stale_pending(
        &mut *tx,
        approval_cutoff(state),
        Some((run_id, tool.name, action, target_ref)),
        &expiry_patch(),
    )
    .await?;

    let (request, created) = match insert_action_request(&mut *tx, &item).await? {
        Some(request) => (request, true),
        None => {
            let existing =
                find_pending_by_signature(&mut *tx, run_id, tool.name, action, target_ref)
                    .await?
                    .ok_or_else(|| {
                        AppError::Conflict(
                            "pending approval request changed concurrently".to_string(),
                        )
                    })?;
            (existing, false)
        }
    };

    if created {
        set_wait_state(&mut *tx, run_id, WAIT_STATE_MCP, true).await?;
    }

    tx.commit().await?;

    for row in &expired {
        state
            .audit
            .approval_event(
                row,
                ActorType::System,
                EventType::ApprovalExpired,
                ACTOR_ID_CONTROL_PLANE_MCP,
                EXPIRY_REASON,
            )
            .await;
    }

    if created {
        state
            .audit
            .approval_event(
                &request,
                ActorType::Agent,
                EventType::ApprovalRequested,
                &request.requested_by,
                "",
            )
            .await;
        state
            .audit
            .run_wait_event(&request.correlation_id, run_id, WAIT_STATE_MCP, true)
            .await;
        info!(
            request_id = request.id,
            run_id = %run_id,
            tool = tool.name.as_str(),
            action = %action,
            approval_mode = mode.as_str(),
            "approval requested"
        );
    }

    Ok(PendingApproval { request, created })
}

/// Persists a request that ran without approval. `failure` carries the apply error, if any.
pub async fn create_applied_action_request(
    state: &AppState,
    run_ctx: &ResolvedRunContext,
    tool: &ToolCapability,
    action: &str,
    target_ref: &Value,
    mut payload: Value,
    failure: Option<&AppError>,
) -> Result<ActionRequest, AppError> {
    let now = Utc::now();
    let (approval_state, patch) = match failure {
        None => (
            ApprovalState::Applied,
            json!({"applied_at": now, "applied_by": ACTOR_ID_CONTROL_PLANE_MCP}),
        ),
        Some(err) => (
            ApprovalState::Failed,
            json!({
                "decision": ApprovalState::Failed.as_str(),
                "actor_id": ACTOR_ID_CONTROL_PLANE_MCP,
                "error": err.to_string(),
                "decided_at": now,
            }),
        ),
    };
    if let (Value::Object(target), Value::Object(extra)) = (&mut payload, patch) {
        target.extend(extra);
    }

    let item = new_action_request(
        run_ctx,
        tool.name,
        action,
        target_ref,
        ApprovalMode::None,
        approval_state,
        ACTOR_ID_CONTROL_PLANE_MCP,
        payload,
    );

    let mut conn = state.db.acquire().await?;
    let request = insert_action_request(&mut conn, &item)
        .await?
        .ok_or_else(|| AppError::internal("direct action request was not persisted"))?;

    let event_type = if failure.is_some() {
        EventType::ApprovalFailed
    } else {
        EventType::ApprovalApplied
    };
    state
        .audit
        .approval_event(
            &request,
            ActorType::System,
            event_type,
            ACTOR_ID_CONTROL_PLANE_MCP,
            "",
        )
        .await;

    Ok(request)
}

fn resolution(request: &ActionRequest) -> ResolveApprovalResult {
    ResolveApprovalResult {
        id: request.id,
        correlation_id: request.correlation_id.clone(),
        run_id: request.run_id.clone(),
        tool_name: request.tool_name,
        action: request.action.clone(),
        approval_state: request.approval_state,
    }
}

fn decision_event(decision: ApprovalDecision) -> EventType {
    match decision {
        ApprovalDecision::Approved => EventType::ApprovalApproved,
        ApprovalDecision::Denied => EventType::ApprovalDenied,
        ApprovalDecision::Expired => EventType::ApprovalExpired,
        ApprovalDecision::Failed => EventType::ApprovalFailed,
    }
}

async fn load_request(state: &AppState, request_id: i64) -> Result<ActionRequest, AppError> {
    let mut conn = state.db.acquire().await?;
    get_action_request(&mut conn, request_id)
        .await?
        .ok_or_else(|| AppError::NotFound("approval request not found".to_string()))
}

/// Applies an owner/system decision to a pending request. Decisions on
/// non-pending requests are no-ops that report the current state.
pub async fn resolve_approval(
    state: &AppState,
    request_id: i64,
    decision: ApprovalDecision,
    actor_id: &str,
    reason: &str,
) -> Result<ResolveApprovalResult, AppError> {
    if request_id <= 0 {
        return Err(AppError::BadRequest("request_id must be positive".to_string()));
    }
    let actor_id = actor_id.trim();
    if actor_id.is_empty() {
        return Err(AppError::BadRequest("actor_id is required".to_string()));
    }
    let reason = reason.trim();

    let current = load_request(state, request_id).await?;
    match current.approval_state {
        ApprovalState::Requested => {}
        ApprovalState::Approved => {
            let settled = fail_interrupted_apply(state, current).await?;
            return Ok(resolution(&settled));
        }
        _ => {
            reconcile_run_wait_state(state, &current.run_id, &current.correlation_id).await?;
            return Ok(resolution(&current));
        }
    }

    let (decision, actor_type, actor_id, reason) = if current.created_at < approval_cutoff(state) {
        (
            ApprovalDecision::Expired,
            ActorType::System,
            ACTOR_ID_CONTROL_PLANE_MCP,
            EXPIRY_REASON,
        )
    } else {
        (decision, ActorType::Human, actor_id, reason)
    };

    let mut patch = json!({
        "decision": decision.as_state().as_str(),
        "actor_id": actor_id,
        "decided_at": Utc::now(),
    });
    if !reason.is_empty() {
        patch["reason"] = json!(reason);
    }

    if decision == ApprovalDecision::Approved {
        let mut conn = state.db.acquire().await?;
        let approved = update_action_state(
            &mut conn,
            request_id,
            ApprovalState::Requested,
            ApprovalState::Approved,
            None,
            &patch,
        )
        .await?;
        drop(conn);

        let Some(approved) = approved else {
            let latest = load_request(state, request_id).await?;
            return Ok(resolution(&latest));
        };

        state
            .audit
            .approval_event(&approved, actor_type, EventType::ApprovalApproved, actor_id, reason)
            .await;
        let finished = finish_approved(state, approved, actor_id).await?;
        return Ok(resolution(&finished));
    }

    let mut tx = state.db.begin().await?;
    let updated = update_action_state(
        &mut *tx,
        request_id,
        ApprovalState::Requested,
        decision.as_state(),
        None,
        &patch,
    )
    .await?;
    let Some(updated) = updated else {
        tx.rollback().await?;
        let latest = load_request(state, request_id).await?;
        return Ok(resolution(&latest));
    };
    let wait_changed = reconcile_in_tx(&mut tx, &updated.run_id).await?;
    tx.commit().await?;

    state
        .audit
        .approval_event(&updated, actor_type, decision_event(decision), actor_id, reason)
        .await;
    if let Some(paused) = wait_changed {
        emit_wait_event(state, &updated.correlation_id, &updated.run_id, paused).await;
    }

    info!(
        request_id = updated.id,
        run_id = %updated.run_id,
        approval_state = updated.approval_state.as_str(),
        "approval resolved"
    );

    Ok(resolution(&updated))
}

/// An `approved` row is owned by the call that approved it. Once its lease
/// lapses the apply is treated as lost and the row fails without re-running it.
async fn fail_interrupted_apply(
    state: &AppState,
    current: ActionRequest,
) -> Result<ActionRequest, AppError> {
    if current.updated_at >= Utc::now() - Duration::seconds(APPLY_LEASE_SECONDS) {
        return Ok(current);
    }

    let patch = json!({
        "decision": ApprovalState::Failed.as_str(),
        "actor_id": ACTOR_ID_CONTROL_PLANE_MCP,
        "error": APPLY_INTERRUPTED,
        "decided_at": Utc::now(),
    });
    let mut tx = state.db.begin().await?;
    let updated = update_action_state(
        &mut *tx,
        current.id,
        ApprovalState::Approved,
        ApprovalState::Failed,
        Some(ACTOR_ID_CONTROL_PLANE_MCP),
        &patch,
    )
    .await?;
    let Some(updated) = updated else {
        tx.rollback().await?;
        return load_request(state, current.id).await;
    };
    let wait_changed = reconcile_in_tx(&mut tx, &updated.run_id).await?;
    tx.commit().await?;

    warn!(
        request_id = updated.id,
        run_id = %updated.run_id,
        tool = updated.tool_name.as_str(),
        "approved action lost its applier"
    );
    state
        .audit
        .approval_event(
            &updated,
            ActorType::System,
            EventType::ApprovalFailed,
            ACTOR_ID_CONTROL_PLANE_MCP,
            APPLY_INTERRUPTED,
        )
        .await;
    if let Some(paused) = wait_changed {
        emit_wait_event(state, &updated.correlation_id, &updated.run_id, paused).await;
    }

    Ok(updated)
}

/// Runs the approved action and records `applied` or `failed`.
async fn finish_approved(
    state: &AppState,
    approved: ActionRequest,
    actor_id: &str,
) -> Result<ActionRequest, AppError> {
    let outcome = apply_approved_control_action(state, &approved).await;
    let now = Utc::now();

    let (next, applied_by, patch, event_type) = match &outcome {
        Ok(()) => (
            ApprovalState::Applied,
            actor_id,
            json!({"applied_at": now, "applied_by": actor_id}),
            EventType::ApprovalApplied,
        ),
        Err(err) => {
            warn!(
                request_id = approved.id,
                run_id = %approved.run_id,
                tool = approved.tool_name.as_str(),
                error = %err,
                "approved action failed to apply"
            );
            (
                ApprovalState::Failed,
                ACTOR_ID_CONTROL_PLANE_MCP,
                json!({
                    "decision": ApprovalState::Failed.as_str(),
                    "actor_id": ACTOR_ID_CONTROL_PLANE_MCP,
                    "error": err.to_string(),
                    "decided_at": now,
                }),
                EventType::ApprovalFailed,
            )
        }
    };

    let mut tx = state.db.begin().await?;
    let updated = update_action_state(
        &mut *tx,
        approved.id,
        ApprovalState::Approved,
        next,
        Some(applied_by),
        &patch,
    )
    .await?;
    let Some(updated) = updated else {
        tx.rollback().await?;
        return load_request(state, approved.id).await;
    };
    let wait_changed = reconcile_in_tx(&mut tx, &updated.run_id).await?;
    tx.commit().await?;

    let (actor_type, event_actor) = if outcome.is_ok() {
        (ActorType::Human, actor_id)
    } else {
        (ActorType::System, ACTOR_ID_CONTROL_PLANE_MCP)
    };
    state
        .audit
        .approval_event(&updated, actor_type, event_type, event_actor, "")
        .await;
    if let Some(paused) = wait_changed {
        emit_wait_event(state, &updated.correlation_id, &updated.run_id, paused).await;
    }

    Ok(updated)
}

/// Executes the side effect of an approved request.
pub async fn apply_approved_control_action(
    state: &AppState,
    request: &ActionRequest,
) -> Result<(), AppError> {
    let session = SessionContext {
        run_id: request.run_id.clone(),
        correlation_id: request.correlation_id.clone(),
        project_id: request.project_id.clone(),
        namespace: String::new(),
        runtime_mode: RuntimeMode::CodeOnly,
        expires_at: Utc::now(),
    };

    match request.tool_name {
        ToolName::SecretSyncGitHubK8s => {
            let payload: SecretSyncPayload = serde_json::from_value(request.payload.clone())
                .map_err(|e| AppError::corrupt("secret sync payload", e))?;
            let run_ctx = resolve_run_context(state, &session, true).await?;
            apply_secret_sync(state, &run_ctx, &payload).await
        }
        ToolName::DatabaseLifecycle => {
            let payload: DatabaseLifecyclePayload =
                serde_json::from_value(request.payload.clone())
                    .map_err(|e| AppError::corrupt("database lifecycle payload", e))?;
            resolve_run_context(state, &session, false).await?;
            apply_database_lifecycle(state, &payload).await.map(|_| ())
        }
        // The owner's answer is the decision itself.
        ToolName::OwnerFeedbackRequest => Ok(()),
        other => Err(AppError::internal(format!(
            "tool {other} has no approval apply step"
        ))),
    }
}

/// Returns `Some(paused)` when the run's wait-state changed.
async fn reconcile_in_tx(
    conn: &mut sqlx::SqliteConnection,
    run_id: &str,
) -> Result<Option<bool>, AppError> {
    let paused = count_pending_for_run(&mut *conn, run_id).await? > 0;
    let changed = reconcile_wait_state(conn, run_id, paused).await?;
    Ok(changed.then_some(paused))
}

async fn emit_wait_event(state: &AppState, correlation_id: &str, run_id: &str, paused: bool) {
    let wait_state = if paused { WAIT_STATE_MCP } else { "" };
    state
        .audit
        .run_wait_event(correlation_id, run_id, wait_state, paused)
        .await;
}

/// Re-derives the run's wait-state from its pending requests.
pub async fn reconcile_run_wait_state(
    state: &AppState,
    run_id: &str,
    correlation_id: &str,
) -> Result<(), AppError> {
    let mut tx = state.db.begin().await?;
    let changed = reconcile_in_tx(&mut tx, run_id).await?;
    tx.commit().await?;

    if let Some(paused) = changed {
        emit_wait_event(state, correlation_id, run_id, paused).await;
    }
    Ok(())
}

/// Oldest-first queue of pending requests. Stale rows are expired on the way.
pub async fn list_pending_approvals(
    state: &AppState,
    limit: Option<i64>,
) -> Result<Vec<ApprovalListItem>, AppError> {
    let limit = match limit {
        Some(limit) if limit > 0 => limit.clamp(1, MAX_APPROVAL_LIST_LIMIT),
        _ => DEFAULT_APPROVAL_LIST_LIMIT,
    };

    let mut tx = state.db.begin().await?;
    let expired =
        expire_stale_pending(&mut *tx, approval_cutoff(state), None, &expiry_patch()).await?;
    let mut resumed = Vec::new();
    let runs: BTreeSet<(&str, &str)> = expired
        .iter()
        .map(|row| (row.run_id.as_str(), row.correlation_id.as_str()))
        .collect();
    for (run_id, correlation_id) in runs {
        if let Some(paused) = reconcile_in_tx(&mut tx, run_id).await? {
            resumed.push((run_id, correlation_id, paused));
        }
    }
    tx.commit().await?;

    for row in &expired {
        state
            .audit
            .approval_event(
                row,
                ActorType::System,
                EventType::ApprovalExpired,
                ACTOR_ID_CONTROL_PLANE_MCP,
                EXPIRY_REASON,
            )
            .await;
    }
    for (run_id, correlation_id, paused) in resumed {
        emit_wait_event(state, correlation_id, run_id, paused).await;
    }
    if !expired.is_empty() {
        info!(count = expired.len(), "expired stale approval requests");
    }

    let rows = list_pending(&state.db, limit).await?;
    Ok(rows
        .into_iter()
        .map(|row| ApprovalListItem {
            id: row.id,
            correlation_id: row.correlation_id,
            run_id: row.run_id,
            project_id: row.project_id,
            tool_name: row.tool_name,
            action: row.action,
            target_ref: row.target_ref,
            approval_mode: row.approval_mode,
            requested_by: row.requested_by,
            created_at: row.created_at,
        })
        .collect())
}
