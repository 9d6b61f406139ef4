use std::collections::HashSet;

use crate::{
    error::AppError,
    models::{
        ApprovalMode, ResolvedRunContext, RunPayload, RuntimeMode, SessionContext, ToolCapability,
        ToolCategory, ToolName,
    },
    run_context::resolve_run_context,
    state::AppState,
};

const TRIGGER_KIND_DEV: &str = "dev";
const TRIGGER_KIND_SELF_IMPROVE: &str = "self_improve";
const TRIGGER_KIND_OPS: &str = "ops";
const TRIGGER_KIND_AI_REPAIR: &str = "ai_repair";

const TRIGGER_LABEL_RUN_DEV_REVISE: &str = "run:dev:revise";
const TRIGGER_LABEL_RUN_OPS: &str = "run:ops";
const TRIGGER_LABEL_RUN_SELF_IMPROVE: &str = "run:self-improve";

const AGENT_KEY_DEV: &str = "dev";
const AGENT_KEY_SRE: &str = "sre";

const BASE_TOOLS: &[ToolName] = &[
    ToolName::GitHubLabelsList,
    ToolName::GitHubLabelsAdd,
    ToolName::GitHubLabelsRemove,
    ToolName::GitHubLabelsTransition,
    ToolName::RunStatusReport,
];

const SELF_IMPROVE_DIAGNOSTIC_TOOLS: &[ToolName] = &[
    ToolName::SelfImproveRunsList,
    ToolName::SelfImproveRunLookup,
    ToolName::SelfImproveSessionGet,
];

const CONTROL_TOOLS: &[ToolName] = &[
    ToolName::SecretSyncGitHubK8s,
    ToolName::DatabaseLifecycle,
    ToolName::OwnerFeedbackRequest,
];

/// Immutable tool catalog, sorted by name. Built once at startup.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: Vec<ToolCapability>,
}

impl ToolCatalog {
    pub fn default_catalog() -> Self {
        let mut tools = vec![
            capability(
                ToolName::GitHubLabelsList,
                "List labels on GitHub issue",
                ToolCategory::Read,
                ApprovalMode::None,
            ),
            capability(
                ToolName::GitHubLabelsAdd,
                "Add labels to GitHub issue or pull request",
                ToolCategory::Write,
                ApprovalMode::None,
            ),
            capability(
                ToolName::GitHubLabelsRemove,
                "Remove labels from GitHub issue or pull request",
                ToolCategory::Write,
                ApprovalMode::None,
            ),
            capability(
                ToolName::GitHubLabelsTransition,
                "Replace labels atomically on GitHub issue or pull request",
                ToolCategory::Write,
                ApprovalMode::None,
            ),
            capability(
                ToolName::RunStatusReport,
                "Report short progress status of the current run",
                ToolCategory::Write,
                ApprovalMode::None,
            ),
            capability(
                ToolName::SelfImproveRunsList,
                "List recent runs of the project for self-improvement diagnostics",
                ToolCategory::Read,
                ApprovalMode::None,
            ),
            capability(
                ToolName::SelfImproveRunLookup,
                "Find runs by issue or pull request number",
                ToolCategory::Read,
                ApprovalMode::None,
            ),
            capability(
                ToolName::SelfImproveSessionGet,
                "Read agent session snapshot of a project run",
                ToolCategory::Read,
                ApprovalMode::None,
            ),
            capability(
                ToolName::SecretSyncGitHubK8s,
                "Sync one secret value into GitHub environment and Kubernetes secret",
                ToolCategory::Write,
                ApprovalMode::Owner,
            ),
            capability(
                ToolName::DatabaseLifecycle,
                "Create, delete or describe an environment database",
                ToolCategory::Write,
                ApprovalMode::Owner,
            ),
            capability(
                ToolName::OwnerFeedbackRequest,
                "Ask the owner a question with fixed answer options",
                ToolCategory::Write,
                ApprovalMode::Owner,
            ),
        ];
        tools.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        Self { tools }
    }

    #[cfg(test)]
    pub fn tools(&self) -> &[ToolCapability] {
        &self.tools
    }

    pub fn capability(&self, name: ToolName) -> Result<ToolCapability, AppError> {
        self.tools
            .iter()
            .find(|tool| tool.name == name)
            .copied()
            .ok_or_else(|| AppError::NotFound(format!("tool {name} is not registered")))
    }

    /// Tools visible to a run with the given payload, in catalog order.
    pub fn allowed_tools(&self, payload: &RunPayload) -> Vec<ToolCapability> {
        let mut allowed: HashSet<ToolName> = BASE_TOOLS.iter().copied().collect();

        let trigger_kind = normalize_trigger_kind(payload.trigger_kind());
        let agent_key = payload.agent_key().to_ascii_lowercase();

        match trigger_kind.as_str() {
            TRIGGER_KIND_SELF_IMPROVE => {
                allowed.extend(SELF_IMPROVE_DIAGNOSTIC_TOOLS.iter().copied())
            }
            TRIGGER_KIND_OPS | TRIGGER_KIND_AI_REPAIR => {
                if agent_key == AGENT_KEY_SRE || agent_key == AGENT_KEY_DEV {
                    allowed.extend(CONTROL_TOOLS.iter().copied());
                }
            }
            _ => {}
        }

        self.tools
            .iter()
            .filter(|tool| allowed.contains(&tool.name))
            .copied()
            .collect()
    }
}

fn capability(
    name: ToolName,
    description: &'static str,
    category: ToolCategory,
    approval: ApprovalMode,
) -> ToolCapability {
    ToolCapability {
        name,
        description,
        category,
        approval,
    }
}

pub fn normalize_trigger_kind(value: &str) -> String {
    let normalized = value.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return TRIGGER_KIND_DEV.to_string();
    }
    normalized
}

/// Resolves the visible catalog for an authenticated session.
pub async fn allowed_tools(
    state: &AppState,
    session: &SessionContext,
) -> Result<(ResolvedRunContext, Vec<ToolCapability>), AppError> {
    let run_ctx = resolve_run_context(state, session, false).await?;
    let tools = state.catalog.allowed_tools(&run_ctx.payload);
    Ok((run_ctx, tools))
}

/// Membership test over [`allowed_tools`]; the only visibility check for tool calls.
pub async fn is_tool_allowed(
    state: &AppState,
    session: &SessionContext,
    name: ToolName,
) -> Result<(ResolvedRunContext, bool), AppError> {
    let (run_ctx, tools) = allowed_tools(state, session).await?;
    let allowed = tools.iter().any(|tool| tool.name == name);
    Ok((run_ctx, allowed))
}

/// Approval required before a privileged tool runs for this run.
pub fn resolve_control_approval_mode(
    tool: ToolName,
    runtime_mode: RuntimeMode,
    trigger_label: &str,
    agent_key: &str,
) -> ApprovalMode {
    if runtime_mode != RuntimeMode::FullEnv {
        return ApprovalMode::Owner;
    }

    let trigger_label = trigger_label.trim().to_ascii_lowercase();
    let agent_key = agent_key.trim().to_ascii_lowercase();

    match tool {
        ToolName::SecretSyncGitHubK8s => {
            if trigger_label == TRIGGER_LABEL_RUN_DEV_REVISE
                || trigger_label == TRIGGER_LABEL_RUN_SELF_IMPROVE
            {
                return ApprovalMode::Delegated;
            }
            if trigger_label == TRIGGER_LABEL_RUN_OPS && agent_key == AGENT_KEY_SRE {
                return ApprovalMode::Delegated;
            }
            ApprovalMode::Owner
        }
        ToolName::DatabaseLifecycle => {
            if trigger_label == TRIGGER_LABEL_RUN_OPS
                && (agent_key == AGENT_KEY_SRE || agent_key == AGENT_KEY_DEV)
            {
                return ApprovalMode::Delegated;
            }
            ApprovalMode::Owner
        }
        _ => ApprovalMode::Owner,
    }
}

/// Applies operator configuration on top of the run-derived mode.
/// Only `delegated` may be relaxed to `none`; `owner` never is.
pub fn effective_approval_mode(mode: ApprovalMode, delegated_auto_apply: bool) -> ApprovalMode {
    match mode {
        ApprovalMode::Delegated if delegated_auto_apply => ApprovalMode::None,
        other => other,
    }
}

pub fn approval_mode_for_run(
    state: &AppState,
    tool: ToolName,
    run_ctx: &ResolvedRunContext,
) -> ApprovalMode {
    let mode = resolve_control_approval_mode(
        tool,
        run_ctx.session.runtime_mode,
        run_ctx.payload.trigger_label(),
        run_ctx.payload.agent_key(),
    );
    effective_approval_mode(mode, state.config.delegated_auto_apply)
}
