use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTokenClaims {
    pub iss: String,
    pub sub: String,
    pub iat: usize,
    pub nbf: usize,
    pub exp: usize,
    pub run_id: String,
    pub correlation_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub runtime_mode: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuntimeMode {
    #[serde(rename = "full-env")]
    FullEnv,
    #[serde(rename = "code-only")]
    CodeOnly,
}

impl RuntimeMode {
    /// Only an explicit `full-env` keeps full-environment privileges.
    pub fn normalize(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("full-env") {
            RuntimeMode::FullEnv
        } else {
            RuntimeMode::CodeOnly
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeMode::FullEnv => "full-env",
            RuntimeMode::CodeOnly => "code-only",
        }
    }
}

/// Verified identity of one run-bound caller.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub run_id: String,
    pub correlation_id: String,
    pub project_id: String,
    pub namespace: String,
    pub runtime_mode: RuntimeMode,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Run {
    pub id: String,
    pub correlation_id: String,
    pub project_id: String,
    pub status: String,
    pub run_payload: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn is_active(&self) -> bool {
        let status = self.status.trim().to_ascii_lowercase();
        status == "pending" || status == "running"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPayload {
    #[serde(default)]
    pub project: RunPayloadProject,
    #[serde(default)]
    pub repository: RunPayloadRepository,
    #[serde(default)]
    pub issue: Option<RunPayloadIssue>,
    #[serde(default)]
    pub pull_request: Option<RunPayloadPullRequest>,
    #[serde(default)]
    pub trigger: Option<RunPayloadTrigger>,
    #[serde(default)]
    pub agent: Option<RunPayloadAgent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPayloadProject {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub repository_id: String,
    #[serde(default)]
    pub services_yaml: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPayloadRepository {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPayloadIssue {
    #[serde(default)]
    pub number: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPayloadPullRequest {
    #[serde(default)]
    pub number: i64,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPayloadTrigger {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPayloadAgent {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub name: String,
}

impl RunPayload {
    pub fn trigger_label(&self) -> &str {
        self.trigger.as_ref().map(|t| t.label.trim()).unwrap_or("")
    }

    pub fn trigger_kind(&self) -> &str {
        self.trigger.as_ref().map(|t| t.kind.as_str()).unwrap_or("")
    }

    pub fn agent_key(&self) -> &str {
        self.agent.as_ref().map(|a| a.key.trim()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default)]
pub struct RepositoryBinding {
    pub id: String,
    pub project_id: String,
    pub owner: String,
    pub name: String,
    pub services_yaml_path: String,
    pub token_encrypted: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedRunContext {
    pub session: SessionContext,
    pub run: Run,
    pub repository: RepositoryBinding,
    pub payload: RunPayload,
    /// Decrypted repository credential, present only when requested.
    pub credential: Option<String>,
}

impl ResolvedRunContext {
    pub fn repository_full_name(&self) -> String {
        let full_name = self.payload.repository.full_name.trim();
        if !full_name.is_empty() {
            return full_name.to_string();
        }
        format!("{}/{}", self.repository.owner, self.repository.name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ToolName {
    #[serde(rename = "database.lifecycle")]
    DatabaseLifecycle,
    #[serde(rename = "github_labels_add")]
    GitHubLabelsAdd,
    #[serde(rename = "github_labels_list")]
    GitHubLabelsList,
    #[serde(rename = "github_labels_remove")]
    GitHubLabelsRemove,
    #[serde(rename = "github_labels_transition")]
    GitHubLabelsTransition,
    #[serde(rename = "owner.feedback.request")]
    OwnerFeedbackRequest,
    #[serde(rename = "run_status_report")]
    RunStatusReport,
    #[serde(rename = "secret.sync.github_k8s")]
    SecretSyncGitHubK8s,
    #[serde(rename = "self_improve_run_lookup")]
    SelfImproveRunLookup,
    #[serde(rename = "self_improve_runs_list")]
    SelfImproveRunsList,
    #[serde(rename = "self_improve_session_get")]
    SelfImproveSessionGet,
}

impl ToolName {
    pub const ALL: [ToolName; 11] = [
        ToolName::DatabaseLifecycle,
        ToolName::GitHubLabelsAdd,
        ToolName::GitHubLabelsList,
        ToolName::GitHubLabelsRemove,
        ToolName::GitHubLabelsTransition,
        ToolName::OwnerFeedbackRequest,
        ToolName::RunStatusReport,
        ToolName::SecretSyncGitHubK8s,
        ToolName::SelfImproveRunLookup,
        ToolName::SelfImproveRunsList,
        ToolName::SelfImproveSessionGet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::DatabaseLifecycle => "database.lifecycle",
            ToolName::GitHubLabelsAdd => "github_labels_add",
            ToolName::GitHubLabelsList => "github_labels_list",
            ToolName::GitHubLabelsRemove => "github_labels_remove",
            ToolName::GitHubLabelsTransition => "github_labels_transition",
            ToolName::OwnerFeedbackRequest => "owner.feedback.request",
            ToolName::RunStatusReport => "run_status_report",
            ToolName::SecretSyncGitHubK8s => "secret.sync.github_k8s",
            ToolName::SelfImproveRunLookup => "self_improve_run_lookup",
            ToolName::SelfImproveRunsList => "self_improve_runs_list",
            ToolName::SelfImproveSessionGet => "self_improve_session_get",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL.into_iter().find(|tool| tool.as_str() == value)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Read,
    Write,
}

impl ToolCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolCategory::Read => "read",
            ToolCategory::Write => "write",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    None,
    Owner,
    Delegated,
}

impl ApprovalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalMode::None => "none",
            ApprovalMode::Owner => "owner",
            ApprovalMode::Delegated => "delegated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(ApprovalMode::None),
            "owner" => Some(ApprovalMode::Owner),
            "delegated" => Some(ApprovalMode::Delegated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    None,
    Requested,
    Approved,
    Applied,
    Denied,
    Expired,
    Failed,
}

impl ApprovalState {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalState::None => "none",
            ApprovalState::Requested => "requested",
            ApprovalState::Approved => "approved",
            ApprovalState::Applied => "applied",
            ApprovalState::Denied => "denied",
            ApprovalState::Expired => "expired",
            ApprovalState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(ApprovalState::None),
            "requested" => Some(ApprovalState::Requested),
            "approved" => Some(ApprovalState::Approved),
            "applied" => Some(ApprovalState::Applied),
            "denied" => Some(ApprovalState::Denied),
            "expired" => Some(ApprovalState::Expired),
            "failed" => Some(ApprovalState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ApprovalState::Applied
                | ApprovalState::Denied
                | ApprovalState::Expired
                | ApprovalState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approved,
    Denied,
    Expired,
    Failed,
}

impl ApprovalDecision {
    pub fn as_state(self) -> ApprovalState {
        match self {
            ApprovalDecision::Approved => ApprovalState::Approved,
            ApprovalDecision::Denied => ApprovalState::Denied,
            ApprovalDecision::Expired => ApprovalState::Expired,
            ApprovalDecision::Failed => ApprovalState::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ToolCapability {
    pub name: ToolName,
    pub description: &'static str,
    pub category: ToolCategory,
    pub approval: ApprovalMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionStatus {
    Ok,
    ApprovalRequired,
}

/// Status summary of a finished tool call, as recorded by the audit trail.
pub trait ToolOutcome {
    fn status(&self) -> ToolExecutionStatus;

    fn message(&self) -> &str {
        ""
    }
}

/// One persisted privileged-action request.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub id: i64,
    pub correlation_id: String,
    pub run_id: String,
    pub project_id: String,
    pub tool_name: ToolName,
    pub action: String,
    pub target_ref: Value,
    pub approval_mode: ApprovalMode,
    pub approval_state: ApprovalState,
    pub requested_by: String,
    pub applied_by: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SecretSyncPolicy {
    Deterministic,
    Random,
    Provided,
}

impl SecretSyncPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            SecretSyncPolicy::Deterministic => "deterministic",
            SecretSyncPolicy::Random => "random",
            SecretSyncPolicy::Provided => "provided",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecretSyncEnvInput {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub github_secret_name: String,
    #[serde(default)]
    pub kubernetes_namespace: String,
    #[serde(default)]
    pub kubernetes_secret_name: String,
    #[serde(default)]
    pub kubernetes_secret_key: String,
    #[serde(default)]
    pub policy: Option<SecretSyncPolicy>,
    #[serde(default)]
    pub secret_value: String,
    #[serde(default)]
    pub idempotency_key: String,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecretSyncEnvResult {
    pub status: ToolExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<i64>,
    pub approval_state: ApprovalState,
    pub environment: String,
    pub github_secret: String,
    pub kubernetes_ref: String,
    pub policy: SecretSyncPolicy,
    pub idempotency_key: String,
    pub reused: bool,
    pub dry_run: bool,
    pub message: String,
}

/// Persisted payload of a secret sync request; the value is only ever stored encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretSyncPayload {
    pub project_id: String,
    pub repository: String,
    pub environment: String,
    pub github_secret_name: String,
    pub kubernetes_namespace: String,
    pub kubernetes_secret_name: String,
    pub kubernetes_secret_key: String,
    pub policy: SecretSyncPolicy,
    pub idempotency_key: String,
    pub secret_value_encrypted: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseLifecycleAction {
    Create,
    Delete,
    Describe,
}

impl DatabaseLifecycleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DatabaseLifecycleAction::Create => "create",
            DatabaseLifecycleAction::Delete => "delete",
            DatabaseLifecycleAction::Describe => "describe",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseLifecycleInput {
    #[serde(default)]
    pub environment: String,
    pub action: DatabaseLifecycleAction,
    #[serde(default)]
    pub database_name: String,
    #[serde(default)]
    pub confirm_delete: bool,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseLifecycleResult {
    pub status: ToolExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<i64>,
    pub approval_state: ApprovalState,
    pub environment: String,
    pub action: DatabaseLifecycleAction,
    pub database_name: String,
    pub applied: bool,
    pub exists: bool,
    pub dry_run: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseLifecyclePayload {
    pub environment: String,
    pub action: DatabaseLifecycleAction,
    pub database_name: String,
    pub confirm_delete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OwnerFeedbackRequestInput {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub allow_custom: bool,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OwnerFeedbackRequestResult {
    pub status: ToolExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<i64>,
    pub approval_state: ApprovalState,
    pub question: String,
    pub options: Vec<String>,
    pub dry_run: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerFeedbackPayload {
    pub question: String,
    pub options: Vec<String>,
    pub allow_custom: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelsInput {
    #[serde(default)]
    pub issue_number: Option<i64>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelsTransitionInput {
    #[serde(default)]
    pub issue_number: Option<i64>,
    #[serde(default)]
    pub remove_labels: Vec<String>,
    #[serde(default)]
    pub add_labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LabelsResult {
    pub status: ToolExecutionStatus,
    pub issue_number: i64,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunStatusReportInput {
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatusReportResult {
    pub status: ToolExecutionStatus,
    pub run_id: String,
    pub report: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelfImproveRunsListInput {
    #[serde(default)]
    pub repository_full_name: String,
    #[serde(default)]
    pub page: i64,
    #[serde(default)]
    pub limit: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelfImproveRunLookupInput {
    #[serde(default)]
    pub repository_full_name: String,
    #[serde(default)]
    pub issue_number: i64,
    #[serde(default)]
    pub pull_request_number: i64,
    #[serde(default)]
    pub limit: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelfImproveSessionGetInput {
    #[serde(default)]
    pub run_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SelfImproveRunRef {
    pub run_id: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub project_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub repository_full_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub agent_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_number: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub trigger_kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub trigger_label: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelfImproveRunsListResult {
    pub status: ToolExecutionStatus,
    pub page: i64,
    pub limit: i64,
    pub has_next: bool,
    pub items: Vec<SelfImproveRunRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelfImproveRunLookupResult {
    pub status: ToolExecutionStatus,
    pub items: Vec<SelfImproveRunRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelfImproveSessionGetResult {
    pub status: ToolExecutionStatus,
    pub run: SelfImproveRunRef,
    pub wait_state: String,
    pub timeout_guard_disabled: bool,
    pub session: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolListResponse {
    pub server: String,
    pub run_id: String,
    pub tools: Vec<ToolCapability>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueRunTokenRequest {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub runtime_mode: String,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedRunToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveApprovalRequest {
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub actor_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveApprovalResult {
    pub id: i64,
    pub correlation_id: String,
    pub run_id: String,
    pub tool_name: ToolName,
    pub action: String,
    pub approval_state: ApprovalState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalListItem {
    pub id: i64,
    pub correlation_id: String,
    pub run_id: String,
    pub project_id: String,
    pub tool_name: ToolName,
    pub action: String,
    pub target_ref: Value,
    pub approval_mode: ApprovalMode,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListApprovalsQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListApprovalsResponse {
    pub items: Vec<ApprovalListItem>,
}

macro_rules! tool_outcome {
    ($($ty:ty),* $(,)?) => {
        $(impl ToolOutcome for $ty {
            fn status(&self) -> ToolExecutionStatus {
                self.status
            }
        })*
    };
}

macro_rules! control_tool_outcome {
    ($($ty:ty),* $(,)?) => {
        $(impl ToolOutcome for $ty {
            fn status(&self) -> ToolExecutionStatus {
                self.status
            }

            fn message(&self) -> &str {
                &self.message
            }
        })*
    };
}

tool_outcome!(
    LabelsResult,
    RunStatusReportResult,
    SelfImproveRunsListResult,
    SelfImproveRunLookupResult,
    SelfImproveSessionGetResult,
);

control_tool_outcome!(
    SecretSyncEnvResult,
    DatabaseLifecycleResult,
    OwnerFeedbackRequestResult,
);
