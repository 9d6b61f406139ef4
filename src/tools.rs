use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    approvals::request_actor_id,
    audit::{ActorType, EventType, marshal_event_payload},
    control_tools::{self, normalize_options},
    error::AppError,
    models::{
        LabelsInput, LabelsResult, LabelsTransitionInput, ResolvedRunContext, Run,
        RunStatusReportInput, RunStatusReportResult, SelfImproveRunLookupInput,
        SelfImproveRunLookupResult, SelfImproveRunRef, SelfImproveRunsListInput,
        SelfImproveRunsListResult, SelfImproveSessionGetInput, SelfImproveSessionGetResult,
        SessionContext, ToolCapability, ToolExecutionStatus, ToolName, ToolOutcome,
    },
    policy,
    run_context::{attach_credential, parse_run_payload},
    runs::{get_agent_session, get_run, list_recent_by_project, search_by_issue_or_pull_request},
    state::AppState,
};

const MAX_STATUS_REPORT_CHARS: usize = 100;
const DEFAULT_SELF_IMPROVE_LIMIT: i64 = 20;
const MAX_SELF_IMPROVE_LIMIT: i64 = 50;

/// Runs one tool call for an authenticated session: visibility check, argument
/// decoding, execution and the audit trail around it.
pub async fn call_tool(
    state: &AppState,
    session: &SessionContext,
    name: ToolName,
    args: Value,
) -> Result<Value, AppError> {
    let tool = state.catalog.capability(name)?;
    let (mut run_ctx, allowed) = match policy::is_tool_allowed(state, session, name).await {
        Ok(resolved) => resolved,
        Err(err) => {
            state.audit.tool_failed(session, &tool, &err).await;
            return Err(err);
        }
    };
    if !allowed {
        let err = AppError::Forbidden(format!("tool {name} is not available for this run"));
        state.audit.tool_failed(&run_ctx.session, &tool, &err).await;
        return Err(err);
    }

    let session = run_ctx.session.clone();
    state.audit.tool_called(&session, &tool).await;

    match name {
        ToolName::GitHubLabelsList => {
            let result = async {
                let input: LabelsInput = decode_args(args)?;
                labels_list(state, &mut run_ctx, input).await
            }
            .await;
            finish(state, &session, &tool, result).await
        }
        ToolName::GitHubLabelsAdd => {
            let result = async {
                let input: LabelsInput = decode_args(args)?;
                labels_add(state, &mut run_ctx, input).await
            }
            .await;
            finish(state, &session, &tool, result).await
        }
        ToolName::GitHubLabelsRemove => {
            let result = async {
                let input: LabelsInput = decode_args(args)?;
                labels_remove(state, &mut run_ctx, input).await
            }
            .await;
            finish(state, &session, &tool, result).await
        }
        ToolName::GitHubLabelsTransition => {
            let result = async {
                let input: LabelsTransitionInput = decode_args(args)?;
                labels_transition(state, &mut run_ctx, input).await
            }
            .await;
            finish(state, &session, &tool, result).await
        }
        ToolName::RunStatusReport => {
            let result = async {
                let input: RunStatusReportInput = decode_args(args)?;
                run_status_report(state, &run_ctx, input).await
            }
            .await;
            finish(state, &session, &tool, result).await
        }
        ToolName::SelfImproveRunsList => {
            let result = async {
                let input: SelfImproveRunsListInput = decode_args(args)?;
                self_improve_runs_list(state, &run_ctx, input).await
            }
            .await;
            finish(state, &session, &tool, result).await
        }
        ToolName::SelfImproveRunLookup => {
            let result = async {
                let input: SelfImproveRunLookupInput = decode_args(args)?;
                self_improve_run_lookup(state, &run_ctx, input).await
            }
            .await;
            finish(state, &session, &tool, result).await
        }
        ToolName::SelfImproveSessionGet => {
            let result = async {
                let input: SelfImproveSessionGetInput = decode_args(args)?;
                self_improve_session_get(state, &run_ctx, input).await
            }
            .await;
            finish(state, &session, &tool, result).await
        }
        ToolName::SecretSyncGitHubK8s => {
            let result = async {
                let input = decode_args(args)?;
                attach_credential(state, &mut run_ctx)?;
                control_tools::secret_sync_env(state, &run_ctx, &tool, input).await
            }
            .await;
            finish(state, &session, &tool, result).await
        }
        ToolName::DatabaseLifecycle => {
            let result = async {
                let input = decode_args(args)?;
                control_tools::database_lifecycle(state, &run_ctx, &tool, input).await
            }
            .await;
            finish(state, &session, &tool, result).await
        }
        ToolName::OwnerFeedbackRequest => {
            let result = async {
                let input = decode_args(args)?;
                control_tools::owner_feedback_request(state, &run_ctx, &tool, input).await
            }
            .await;
            finish(state, &session, &tool, result).await
        }
    }
}

fn decode_args<T: DeserializeOwned>(args: Value) -> Result<T, AppError> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args)
        .map_err(|e| AppError::BadRequest(format!("invalid arguments: {e}")))
}

async fn finish<T: Serialize + ToolOutcome>(
    state: &AppState,
    session: &SessionContext,
    tool: &ToolCapability,
    result: Result<T, AppError>,
) -> Result<Value, AppError> {
    state.audit.tool_result(session, tool, &result).await;
    serde_json::to_value(result?).map_err(AppError::internal)
}

fn resolve_issue_number(
    explicit: Option<i64>,
    run_ctx: &ResolvedRunContext,
) -> Result<i64, AppError> {
    if let Some(number) = explicit.filter(|n| *n > 0) {
        return Ok(number);
    }
    let from_payload = run_ctx
        .payload
        .issue
        .as_ref()
        .map(|issue| issue.number)
        .or_else(|| run_ctx.payload.pull_request.as_ref().map(|pr| pr.number))
        .filter(|n| *n > 0);
    from_payload.ok_or_else(|| AppError::BadRequest("issue_number is required".to_string()))
}

fn credential(run_ctx: &ResolvedRunContext) -> Result<&str, AppError> {
    run_ctx
        .credential
        .as_deref()
        .ok_or_else(|| AppError::Conflict("repository credential is not resolved".to_string()))
}

fn labels_result(issue_number: i64, labels: Vec<String>) -> LabelsResult {
    LabelsResult {
        status: ToolExecutionStatus::Ok,
        issue_number,
        labels,
    }
}

async fn labels_list(
    state: &AppState,
    run_ctx: &mut ResolvedRunContext,
    input: LabelsInput,
) -> Result<LabelsResult, AppError> {
    let issue_number = resolve_issue_number(input.issue_number, run_ctx)?;
    attach_credential(state, run_ctx)?;
    let labels = state
        .clients
        .source_control
        .list_issue_labels(
            credential(run_ctx)?,
            &run_ctx.repository.owner,
            &run_ctx.repository.name,
            issue_number,
        )
        .await
        .map_err(|e| AppError::upstream("github labels list", e))?;
    Ok(labels_result(issue_number, labels))
}

async fn labels_add(
    state: &AppState,
    run_ctx: &mut ResolvedRunContext,
    input: LabelsInput,
) -> Result<LabelsResult, AppError> {
    let issue_number = resolve_issue_number(input.issue_number, run_ctx)?;
    let labels = normalize_options(&input.labels);
    if labels.is_empty() {
        return Err(AppError::BadRequest("labels are required".to_string()));
    }
    attach_credential(state, run_ctx)?;
    let current = state
        .clients
        .source_control
        .add_issue_labels(
            credential(run_ctx)?,
            &run_ctx.repository.owner,
            &run_ctx.repository.name,
            issue_number,
            &labels,
        )
        .await
        .map_err(|e| AppError::upstream("github labels add", e))?;
    Ok(labels_result(issue_number, current))
}

async fn labels_remove(
    state: &AppState,
    run_ctx: &mut ResolvedRunContext,
    input: LabelsInput,
) -> Result<LabelsResult, AppError> {
    let issue_number = resolve_issue_number(input.issue_number, run_ctx)?;
    let labels = normalize_options(&input.labels);
    if labels.is_empty() {
        return Err(AppError::BadRequest("labels are required".to_string()));
    }
    attach_credential(state, run_ctx)?;
    let token = credential(run_ctx)?;
    let source_control = &state.clients.source_control;
    for label in &labels {
        source_control
            .remove_issue_label(
                token,
                &run_ctx.repository.owner,
                &run_ctx.repository.name,
                issue_number,
                label,
            )
            .await
            .map_err(|e| AppError::upstream("github labels remove", e))?;
    }
    let current = source_control
        .list_issue_labels(token, &run_ctx.repository.owner, &run_ctx.repository.name, issue_number)
        .await
        .map_err(|e| AppError::upstream("github labels list", e))?;
    Ok(labels_result(issue_number, current))
}

async fn labels_transition(
    state: &AppState,
    run_ctx: &mut ResolvedRunContext,
    input: LabelsTransitionInput,
) -> Result<LabelsResult, AppError> {
    let issue_number = resolve_issue_number(input.issue_number, run_ctx)?;
    let remove = normalize_options(&input.remove_labels);
    let add = normalize_options(&input.add_labels);
    if remove.is_empty() && add.is_empty() {
        return Err(AppError::BadRequest(
            "remove_labels or add_labels is required".to_string(),
        ));
    }
    attach_credential(state, run_ctx)?;
    let token = credential(run_ctx)?;
    let owner = run_ctx.repository.owner.as_str();
    let repo = run_ctx.repository.name.as_str();
    let source_control = &state.clients.source_control;

    for label in &remove {
        source_control
            .remove_issue_label(token, owner, repo, issue_number, label)
            .await
            .map_err(|e| AppError::upstream("github labels transition", e))?;
    }
    let current = if add.is_empty() {
        source_control
            .list_issue_labels(token, owner, repo, issue_number)
            .await
    } else {
        source_control
            .add_issue_labels(token, owner, repo, issue_number, &add)
            .await
    }
    .map_err(|e| AppError::upstream("github labels transition", e))?;

    Ok(labels_result(issue_number, current))
}

#[derive(Serialize)]
struct StatusReportedPayload<'a> {
    run_id: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    agent_key: &'a str,
}

pub fn normalize_status_report(value: &str) -> Result<String, AppError> {
    let status = value.trim();
    if status.is_empty() {
        return Err(AppError::BadRequest("status is required".to_string()));
    }
    if status.chars().count() > MAX_STATUS_REPORT_CHARS {
        return Err(AppError::BadRequest(format!(
            "status must be at most {MAX_STATUS_REPORT_CHARS} characters"
        )));
    }
    Ok(status.to_string())
}

async fn run_status_report(
    state: &AppState,
    run_ctx: &ResolvedRunContext,
    input: RunStatusReportInput,
) -> Result<RunStatusReportResult, AppError> {
    let report = normalize_status_report(&input.status)?;
    let payload = StatusReportedPayload {
        run_id: &run_ctx.session.run_id,
        status: &report,
        agent_key: run_ctx.payload.agent_key(),
    };
    state
        .audit
        .record(
            &run_ctx.session.correlation_id,
            ActorType::Agent,
            &request_actor_id(run_ctx),
            EventType::RunAgentStatusReported,
            marshal_event_payload(&payload),
        )
        .await;

    Ok(RunStatusReportResult {
        status: ToolExecutionStatus::Ok,
        run_id: run_ctx.session.run_id.clone(),
        report,
    })
}

fn self_improve_project_id(run_ctx: &ResolvedRunContext) -> Result<String, AppError> {
    [
        run_ctx.session.project_id.trim(),
        run_ctx.run.project_id.trim(),
        run_ctx.repository.project_id.trim(),
        run_ctx.payload.project.id.trim(),
    ]
    .into_iter()
    .find(|v| !v.is_empty())
    .map(str::to_string)
    .ok_or_else(|| AppError::Conflict("project_id is required".to_string()))
}

fn self_improve_repository(explicit: &str, run_ctx: &ResolvedRunContext) -> String {
    let explicit = explicit.trim();
    if explicit.is_empty() {
        run_ctx.repository_full_name()
    } else {
        explicit.to_string()
    }
}

fn clamp_self_improve_limit(value: i64) -> i64 {
    if value <= 0 {
        DEFAULT_SELF_IMPROVE_LIMIT
    } else {
        value.min(MAX_SELF_IMPROVE_LIMIT)
    }
}

fn run_ref(run: &Run) -> Result<SelfImproveRunRef, AppError> {
    let payload = parse_run_payload(&run.run_payload)?;
    Ok(SelfImproveRunRef {
        run_id: run.id.clone(),
        correlation_id: run.correlation_id.clone(),
        project_id: run.project_id.clone(),
        repository_full_name: payload.repository.full_name.trim().to_string(),
        agent_key: payload.agent_key().to_string(),
        issue_number: payload.issue.as_ref().map(|i| i.number).filter(|n| *n > 0),
        pull_request_number: payload.pull_request.as_ref().map(|p| p.number).filter(|n| *n > 0),
        trigger_kind: payload.trigger_kind().trim().to_string(),
        trigger_label: payload.trigger_label().to_string(),
        status: run.status.clone(),
        created_at: run.created_at,
        started_at: run.started_at,
        finished_at: run.finished_at,
    })
}

async fn self_improve_runs_list(
    state: &AppState,
    run_ctx: &ResolvedRunContext,
    input: SelfImproveRunsListInput,
) -> Result<SelfImproveRunsListResult, AppError> {
    let project_id = self_improve_project_id(run_ctx)?;
    let limit = clamp_self_improve_limit(input.limit);
    let page = input.page.max(1);
    let repository = self_improve_repository(&input.repository_full_name, run_ctx);

    let offset = (page - 1).saturating_mul(limit);
    let mut runs =
        list_recent_by_project(&state.db, &project_id, &repository, limit + 1, offset).await?;
    let has_next = (runs.len() as i64) > limit;
    runs.truncate(limit as usize);

    Ok(SelfImproveRunsListResult {
        status: ToolExecutionStatus::Ok,
        page,
        limit,
        has_next,
        items: runs.iter().map(run_ref).collect::<Result<_, _>>()?,
    })
}

async fn self_improve_run_lookup(
    state: &AppState,
    run_ctx: &ResolvedRunContext,
    input: SelfImproveRunLookupInput,
) -> Result<SelfImproveRunLookupResult, AppError> {
    let project_id = self_improve_project_id(run_ctx)?;
    if input.issue_number <= 0 && input.pull_request_number <= 0 {
        return Err(AppError::BadRequest(
            "issue_number or pull_request_number is required".to_string(),
        ));
    }
    let limit = clamp_self_improve_limit(input.limit);
    let repository = self_improve_repository(&input.repository_full_name, run_ctx);

    let runs = search_by_issue_or_pull_request(
        &state.db,
        &project_id,
        &repository,
        input.issue_number,
        input.pull_request_number,
        limit,
    )
    .await?;

    Ok(SelfImproveRunLookupResult {
        status: ToolExecutionStatus::Ok,
        items: runs.iter().map(run_ref).collect::<Result<_, _>>()?,
    })
}

async fn self_improve_session_get(
    state: &AppState,
    run_ctx: &ResolvedRunContext,
    input: SelfImproveSessionGetInput,
) -> Result<SelfImproveSessionGetResult, AppError> {
    let project_id = self_improve_project_id(run_ctx)?;
    let run_id = input.run_id.trim();
    if run_id.is_empty() {
        return Err(AppError::BadRequest("run_id is required".to_string()));
    }

    let target = get_run(&state.db, run_id)
        .await?
        .ok_or_else(|| AppError::NotFound("run not found".to_string()))?;
    let target_project = target.project_id.trim();
    if !target_project.is_empty() && !target_project.eq_ignore_ascii_case(&project_id) {
        return Err(AppError::Forbidden("run belongs to another project".to_string()));
    }

    let agent_session = get_agent_session(&state.db, run_id)
        .await?
        .ok_or_else(|| AppError::NotFound("run session not found".to_string()))?;
    let session = match agent_session.session_json.as_deref().map(str::trim) {
        None | Some("") => Value::Null,
        Some(raw) => {
            serde_json::from_str(raw).map_err(|e| AppError::corrupt("session snapshot", e))?
        }
    };

    Ok(SelfImproveSessionGetResult {
        status: ToolExecutionStatus::Ok,
        run: run_ref(&target)?,
        wait_state: agent_session.wait_state,
        timeout_guard_disabled: agent_session.timeout_guard_disabled,
        session,
    })
}
