use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use tracing::info;

use crate::{
    actions::find_latest_by_signature,
    approvals::{create_applied_action_request, ensure_pending_approval_request},
    db::random_token,
    error::AppError,
    models::{
        ApprovalMode, ApprovalState, DatabaseLifecycleAction, DatabaseLifecycleInput,
        DatabaseLifecyclePayload, DatabaseLifecycleResult, OwnerFeedbackPayload,
        OwnerFeedbackRequestInput, OwnerFeedbackRequestResult, ResolvedRunContext,
        SecretSyncEnvInput, SecretSyncEnvResult, SecretSyncPayload, SecretSyncPolicy,
        ToolCapability, ToolExecutionStatus,
    },
    policy::approval_mode_for_run,
    run_context::split_repo_full_name,
    secret_sync::{
        SecretCoordinates, derive_deterministic_secret_value, derive_idempotency_key,
        normalize_idempotency_key, normalize_secret_data_key, resolve_policy,
    },
    state::AppState,
};

pub const ACTION_SECRET_SYNC_ENV: &str = "secret_sync_env";
pub const ACTION_DATABASE_CREATE: &str = "database_create";
pub const ACTION_DATABASE_DELETE: &str = "database_delete";
pub const ACTION_DATABASE_DESCRIBE: &str = "database_describe";
pub const ACTION_OWNER_FEEDBACK: &str = "owner_feedback_request";

const MESSAGE_APPLIED: &str = "applied";
const MESSAGE_DRY_RUN: &str = "dry_run";
const MESSAGE_APPROVAL_REQUIRED: &str = "approval_required";
const MESSAGE_IDEMPOTENT_REPLAY: &str = "idempotent_replay";
const MESSAGE_DESCRIBED: &str = "described";
const MESSAGE_DELETE_CONFIRMATION_REQUIRED: &str = "delete_confirmation_required";

const OWNER_FEEDBACK_MIN_OPTIONS: usize = 2;
const OWNER_FEEDBACK_MAX_OPTIONS: usize = 5;
const GENERATED_SECRET_BYTES: usize = 32;

static DATABASE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_-]{0,62}$").expect("database name pattern is valid")
});

fn normalize_env_name(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn required(value: &str, field: &str) -> Result<String, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::BadRequest(format!("{field} is required")));
    }
    Ok(value.to_string())
}

fn to_payload<T: serde::Serialize>(payload: &T) -> Result<Value, AppError> {
    serde_json::to_value(payload).map_err(AppError::internal)
}

pub fn normalize_database_name(value: &str) -> Result<String, AppError> {
    let name = required(value, "database_name")?;
    if !DATABASE_NAME_RE.is_match(&name) {
        return Err(AppError::BadRequest(format!(
            "database_name {name:?} is invalid"
        )));
    }
    Ok(name)
}

/// Trims, drops empties and deduplicates case-insensitively, keeping first spelling and order.
pub fn normalize_options(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .filter(|value| seen.insert(value.to_lowercase()))
        .map(str::to_string)
        .collect()
}

pub async fn secret_sync_env(
    state: &AppState,
    run_ctx: &ResolvedRunContext,
    tool: &ToolCapability,
    input: SecretSyncEnvInput,
) -> Result<SecretSyncEnvResult, AppError> {
    let environment = normalize_env_name(&input.environment);
    if environment.is_empty() {
        return Err(AppError::BadRequest("environment is required".to_string()));
    }
    let github_secret_name = required(&input.github_secret_name, "github_secret_name")?;
    let kubernetes_namespace = match input.kubernetes_namespace.trim() {
        "" => run_ctx.session.namespace.trim().to_string(),
        explicit => explicit.to_string(),
    };
    if kubernetes_namespace.is_empty() {
        return Err(AppError::BadRequest("kubernetes_namespace is required".to_string()));
    }
    let kubernetes_secret_name = required(&input.kubernetes_secret_name, "kubernetes_secret_name")?;
    let kubernetes_secret_key = normalize_secret_data_key(&input.kubernetes_secret_key);

    let project_id = run_ctx.session.project_id.clone();
    let requested_project = input.project_id.trim();
    if !requested_project.is_empty() && requested_project != project_id {
        return Err(AppError::Forbidden("project_id does not match the run".to_string()));
    }
    let repository = run_ctx.repository_full_name();
    let requested_repository = input.repository.trim();
    if !requested_repository.is_empty() {
        if split_repo_full_name(requested_repository).is_none() {
            return Err(AppError::BadRequest(
                "repository must be in owner/name format".to_string(),
            ));
        }
        if !requested_repository.eq_ignore_ascii_case(&repository) {
            return Err(AppError::Forbidden("repository does not match the run".to_string()));
        }
    }

    let coords = SecretCoordinates {
        project_id,
        repository,
        environment,
        github_secret_name,
        kubernetes_namespace,
        kubernetes_secret_name,
        kubernetes_secret_key,
    };

    let provided_value = input.secret_value.trim();
    let policy = resolve_policy(input.policy, !provided_value.is_empty())?;
    let explicit_key = normalize_idempotency_key(&input.idempotency_key)?;
    // Random values without a caller key are never replayed: each call means "rotate".
    let replayable = explicit_key.is_some() || policy != SecretSyncPolicy::Random;
    let idempotency_key = match explicit_key {
        Some(key) => key,
        None => derive_idempotency_key(
            &state.config.secret_derivation_seed,
            &coords,
            policy,
            provided_value,
        )?,
    };

    let target_ref = json!({
        "environment": coords.environment,
        "github_secret_name": coords.github_secret_name,
        "kubernetes_namespace": coords.kubernetes_namespace,
        "kubernetes_secret_name": coords.kubernetes_secret_name,
        "kubernetes_secret_key": coords.kubernetes_secret_key,
        "idempotency_key": idempotency_key,
    });

    let result = |status, request_id, approval_state, reused, dry_run, message: &str| {
        SecretSyncEnvResult {
            status,
            request_id,
            approval_state,
            environment: coords.environment.clone(),
            github_secret: coords.github_secret_name.clone(),
            kubernetes_ref: coords.kubernetes_ref(),
            policy,
            idempotency_key: idempotency_key.clone(),
            reused,
            dry_run,
            message: message.to_string(),
        }
    };

    if input.dry_run {
        return Ok(result(
            ToolExecutionStatus::Ok,
            None,
            ApprovalState::None,
            false,
            true,
            MESSAGE_DRY_RUN,
        ));
    }

    let mode = approval_mode_for_run(state, tool.name, run_ctx);
    if mode == ApprovalMode::None && replayable {
        let previous = find_latest_by_signature(
            &state.db,
            &run_ctx.session.run_id,
            tool.name,
            ACTION_SECRET_SYNC_ENV,
            &target_ref,
        )
        .await?;
        if let Some(previous) = previous.filter(|r| r.approval_state == ApprovalState::Applied) {
            return Ok(result(
                ToolExecutionStatus::Ok,
                Some(previous.id),
                previous.approval_state,
                true,
                false,
                MESSAGE_IDEMPOTENT_REPLAY,
            ));
        }
    }

    let secret_value = match policy {
        SecretSyncPolicy::Provided => provided_value.to_string(),
        SecretSyncPolicy::Random => random_token(GENERATED_SECRET_BYTES),
        SecretSyncPolicy::Deterministic => {
            derive_deterministic_secret_value(&state.config.secret_derivation_seed, &coords)?
        }
    };
    let payload = SecretSyncPayload {
        project_id: coords.project_id.clone(),
        repository: coords.repository.clone(),
        environment: coords.environment.clone(),
        github_secret_name: coords.github_secret_name.clone(),
        kubernetes_namespace: coords.kubernetes_namespace.clone(),
        kubernetes_secret_name: coords.kubernetes_secret_name.clone(),
        kubernetes_secret_key: coords.kubernetes_secret_key.clone(),
        policy,
        idempotency_key: idempotency_key.clone(),
        secret_value_encrypted: state.crypt.encrypt_string(&secret_value)?,
    };
    let payload_json = to_payload(&payload)?;

    if mode == ApprovalMode::None {
        let applied = apply_secret_sync(state, run_ctx, &payload).await;
        let request = create_applied_action_request(
            state,
            run_ctx,
            tool,
            ACTION_SECRET_SYNC_ENV,
            &target_ref,
            payload_json,
            applied.as_ref().err(),
        )
        .await?;
        applied?;
        return Ok(result(
            ToolExecutionStatus::Ok,
            Some(request.id),
            request.approval_state,
            false,
            false,
            MESSAGE_APPLIED,
        ));
    }

    let pending = ensure_pending_approval_request(
        state,
        run_ctx,
        tool,
        ACTION_SECRET_SYNC_ENV,
        &target_ref,
        mode,
        payload_json,
    )
    .await?;
    Ok(result(
        ToolExecutionStatus::ApprovalRequired,
        Some(pending.request.id),
        pending.request.approval_state,
        !pending.created,
        false,
        MESSAGE_APPROVAL_REQUIRED,
    ))
}

/// Pushes the decrypted value to both sinks concurrently; either failure fails the apply.
pub async fn apply_secret_sync(
    state: &AppState,
    run_ctx: &ResolvedRunContext,
    payload: &SecretSyncPayload,
) -> Result<(), AppError> {
    let secret_value = state.crypt.decrypt_string(&payload.secret_value_encrypted)?;
    let token = run_ctx
        .credential
        .as_deref()
        .ok_or_else(|| AppError::Conflict("repository credential is not resolved".to_string()))?;

    let data = BTreeMap::from([(payload.kubernetes_secret_key.clone(), secret_value.clone())]);
    let (github, cluster) = tokio::join!(
        state.clients.source_control.upsert_environment_secret(
            token,
            &run_ctx.repository.owner,
            &run_ctx.repository.name,
            &payload.environment,
            &payload.github_secret_name,
            &secret_value,
        ),
        state.clients.cluster.upsert_secret(
            &payload.kubernetes_namespace,
            &payload.kubernetes_secret_name,
            &data,
        ),
    );
    github.map_err(|e| AppError::upstream("sync github secret", e))?;
    cluster.map_err(|e| AppError::upstream("sync kubernetes secret", e))?;

    info!(
        run_id = %run_ctx.session.run_id,
        environment = %payload.environment,
        github_secret = %payload.github_secret_name,
        kubernetes_namespace = %payload.kubernetes_namespace,
        kubernetes_secret = %payload.kubernetes_secret_name,
        "secret synced"
    );
    Ok(())
}

fn database_action_name(action: DatabaseLifecycleAction) -> &'static str {
    match action {
        DatabaseLifecycleAction::Create => ACTION_DATABASE_CREATE,
        DatabaseLifecycleAction::Delete => ACTION_DATABASE_DELETE,
        DatabaseLifecycleAction::Describe => ACTION_DATABASE_DESCRIBE,
    }
}

pub async fn database_lifecycle(
    state: &AppState,
    run_ctx: &ResolvedRunContext,
    tool: &ToolCapability,
    input: DatabaseLifecycleInput,
) -> Result<DatabaseLifecycleResult, AppError> {
    let environment = normalize_env_name(&input.environment);
    if environment.is_empty() {
        return Err(AppError::BadRequest("environment is required".to_string()));
    }
    let allowed = &state.config.database_lifecycle_allowed_envs;
    if !allowed.iter().any(|env| *env == environment) {
        return Err(AppError::BadRequest(format!(
            "environment {environment:?} is not allowed for database lifecycle (allowed: {})",
            allowed.join(", ")
        )));
    }
    let database_name = normalize_database_name(&input.database_name)?;
    let action = input.action;

    let result = |status, request_id, approval_state, applied, exists, dry_run, message: &str| {
        DatabaseLifecycleResult {
            status,
            request_id,
            approval_state,
            environment: environment.clone(),
            action,
            database_name: database_name.clone(),
            applied,
            exists,
            dry_run,
            message: message.to_string(),
        }
    };

    if action == DatabaseLifecycleAction::Describe {
        let exists = state
            .clients
            .databases
            .database_exists(&environment, &database_name)
            .await
            .map_err(|e| AppError::upstream("describe database", e))?;
        return Ok(result(
            ToolExecutionStatus::Ok,
            None,
            ApprovalState::None,
            false,
            exists,
            input.dry_run,
            MESSAGE_DESCRIBED,
        ));
    }

    let target_ref = json!({
        "environment": environment,
        "database_name": database_name,
    });
    let payload = DatabaseLifecyclePayload {
        environment: environment.clone(),
        action,
        database_name: database_name.clone(),
        confirm_delete: input.confirm_delete,
    };

    if input.dry_run {
        return Ok(result(
            ToolExecutionStatus::Ok,
            None,
            ApprovalState::None,
            false,
            false,
            true,
            MESSAGE_DRY_RUN,
        ));
    }

    let mut mode = approval_mode_for_run(state, tool.name, run_ctx);
    let mut message = MESSAGE_APPROVAL_REQUIRED;
    if action == DatabaseLifecycleAction::Delete
        && !input.confirm_delete
        && mode == ApprovalMode::None
    {
        mode = ApprovalMode::Owner;
        message = MESSAGE_DELETE_CONFIRMATION_REQUIRED;
    }
    let action_name = database_action_name(action);
    let payload_json = to_payload(&payload)?;

    if mode == ApprovalMode::None {
        let applied = apply_database_lifecycle(state, &payload).await;
        let request = create_applied_action_request(
            state,
            run_ctx,
            tool,
            action_name,
            &target_ref,
            payload_json,
            applied.as_ref().err(),
        )
        .await?;
        let changed = applied?;
        return Ok(result(
            ToolExecutionStatus::Ok,
            Some(request.id),
            request.approval_state,
            changed,
            action == DatabaseLifecycleAction::Create,
            false,
            MESSAGE_APPLIED,
        ));
    }

    let pending = ensure_pending_approval_request(
        state,
        run_ctx,
        tool,
        action_name,
        &target_ref,
        mode,
        payload_json,
    )
    .await?;
    Ok(result(
        ToolExecutionStatus::ApprovalRequired,
        Some(pending.request.id),
        pending.request.approval_state,
        false,
        false,
        false,
        message,
    ))
}

/// Returns whether the database actually changed.
pub async fn apply_database_lifecycle(
    state: &AppState,
    payload: &DatabaseLifecyclePayload,
) -> Result<bool, AppError> {
    let databases = &state.clients.databases;
    let changed = match payload.action {
        DatabaseLifecycleAction::Create => databases
            .ensure_database(&payload.environment, &payload.database_name)
            .await
            .map_err(|e| AppError::upstream("create database", e))?,
        DatabaseLifecycleAction::Delete => databases
            .drop_database(&payload.environment, &payload.database_name)
            .await
            .map_err(|e| AppError::upstream("delete database", e))?,
        DatabaseLifecycleAction::Describe => {
            return Err(AppError::BadRequest(
                "describe is read-only and has no apply step".to_string(),
            ));
        }
    };

    info!(
        environment = %payload.environment,
        database = %payload.database_name,
        action = payload.action.as_str(),
        changed,
        "database lifecycle applied"
    );
    Ok(changed)
}

pub async fn owner_feedback_request(
    state: &AppState,
    run_ctx: &ResolvedRunContext,
    tool: &ToolCapability,
    input: OwnerFeedbackRequestInput,
) -> Result<OwnerFeedbackRequestResult, AppError> {
    let question = required(&input.question, "question")?;
    let options = normalize_options(&input.options);
    if !(OWNER_FEEDBACK_MIN_OPTIONS..=OWNER_FEEDBACK_MAX_OPTIONS).contains(&options.len()) {
        return Err(AppError::BadRequest(format!(
            "options count must be between {OWNER_FEEDBACK_MIN_OPTIONS} and {OWNER_FEEDBACK_MAX_OPTIONS}"
        )));
    }

    if input.dry_run {
        return Ok(OwnerFeedbackRequestResult {
            status: ToolExecutionStatus::Ok,
            request_id: None,
            approval_state: ApprovalState::None,
            question,
            options,
            dry_run: true,
            message: MESSAGE_DRY_RUN.to_string(),
        });
    }

    let target_ref = json!({"question": question, "options": options});
    let payload = to_payload(&OwnerFeedbackPayload {
        question: question.clone(),
        options: options.clone(),
        allow_custom: input.allow_custom,
    })?;

    // The answer is the product, so the owner is always asked.
    let pending = ensure_pending_approval_request(
        state,
        run_ctx,
        tool,
        ACTION_OWNER_FEEDBACK,
        &target_ref,
        ApprovalMode::Owner,
        payload,
    )
    .await?;

    Ok(OwnerFeedbackRequestResult {
        status: ToolExecutionStatus::ApprovalRequired,
        request_id: Some(pending.request.id),
        approval_state: pending.request.approval_state,
        question,
        options,
        dry_run: false,
        message: MESSAGE_APPROVAL_REQUIRED.to_string(),
    })
}
