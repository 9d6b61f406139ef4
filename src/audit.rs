use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::warn;

use crate::{
    db::new_id,
    error::AppError,
    models::{
        ActionRequest, ApprovalMode, SessionContext, ToolCapability, ToolCategory,
        ToolExecutionStatus, ToolName, ToolOutcome,
    },
};

pub const ACTOR_ID_CONTROL_PLANE_MCP: &str = "control-plane-mcp";
const PAYLOAD_MARSHAL_FAILED: &str = r#"{"error":"payload_marshal_failed"}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    RunMcpTokenIssued,
    RunAgentStatusReported,
    McpToolCalled,
    McpToolSucceeded,
    McpToolFailed,
    McpToolApprovalPending,
    ApprovalRequested,
    ApprovalApproved,
    ApprovalDenied,
    ApprovalExpired,
    ApprovalFailed,
    ApprovalApplied,
    RunWaitPaused,
    RunWaitResumed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RunMcpTokenIssued => "run.mcp.token.issued",
            EventType::RunAgentStatusReported => "run.agent.status_reported",
            EventType::McpToolCalled => "mcp.tool.called",
            EventType::McpToolSucceeded => "mcp.tool.succeeded",
            EventType::McpToolFailed => "mcp.tool.failed",
            EventType::McpToolApprovalPending => "mcp.tool.approval_pending",
            EventType::ApprovalRequested => "approval.requested",
            EventType::ApprovalApproved => "approval.approved",
            EventType::ApprovalDenied => "approval.denied",
            EventType::ApprovalExpired => "approval.expired",
            EventType::ApprovalFailed => "approval.failed",
            EventType::ApprovalApplied => "approval.applied",
            EventType::RunWaitPaused => "run.wait.paused",
            EventType::RunWaitResumed => "run.wait.resumed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Agent,
    System,
    Human,
}

impl ActorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorType::Agent => "agent",
            ActorType::System => "system",
            ActorType::Human => "human",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowEvent {
    pub correlation_id: String,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub event_type: EventType,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only event store.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn insert(&self, event: &FlowEvent) -> anyhow::Result<()>;
}

pub struct SqliteAuditSink {
    db: SqlitePool,
}

impl SqliteAuditSink {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn insert(&self, event: &FlowEvent) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO flow_events (id, correlation_id, actor_type, actor_id, event_type, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(new_id("evt"))
        .bind(&event.correlation_id)
        .bind(event.actor_type.as_str())
        .bind(&event.actor_id)
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct ToolEventPayload<'a> {
    server: &'a str,
    tool: ToolName,
    category: ToolCategory,
    approval_state: ApprovalMode,
    run_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    project_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    namespace: &'a str,
    runtime_mode: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<ToolExecutionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[derive(Serialize)]
struct ApprovalEventPayload<'a> {
    request_id: i64,
    run_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    project_id: &'a str,
    tool_name: ToolName,
    action: &'a str,
    approval_mode: &'a str,
    approval_state: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    requested_by: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    applied_by: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    actor_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    reason: &'a str,
    target_ref: &'a Value,
}

#[derive(Serialize)]
struct RunWaitEventPayload<'a> {
    run_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    wait_state: &'a str,
    timeout_guard_disabled: bool,
}

pub fn marshal_event_payload<T: Serialize>(payload: &T) -> String {
    serde_json::to_string(payload).unwrap_or_else(|_| PAYLOAD_MARSHAL_FAILED.to_string())
}

/// Best-effort audit writer; sink failures are logged and swallowed.
#[derive(Clone)]
pub struct AuditTrail {
    sink: Arc<dyn AuditSink>,
    server_name: String,
}

impl AuditTrail {
    pub fn new(sink: Arc<dyn AuditSink>, server_name: impl Into<String>) -> Self {
        Self {
            sink,
            server_name: server_name.into(),
        }
    }

    pub async fn record(
        &self,
        correlation_id: &str,
        actor_type: ActorType,
        actor_id: &str,
        event_type: EventType,
        payload: String,
    ) {
        let event = FlowEvent {
            correlation_id: correlation_id.to_string(),
            actor_type,
            actor_id: actor_id.to_string(),
            event_type,
            payload,
            created_at: Utc::now(),
        };

        if let Err(err) = self.sink.insert(&event).await {
            warn!(
                event_type = event_type.as_str(),
                correlation_id = %correlation_id,
                error = %err,
                "audit event dropped"
            );
        }
    }

    pub async fn tool_called(&self, session: &SessionContext, tool: &ToolCapability) {
        self.tool_event(session, tool, EventType::McpToolCalled, None, None, None)
            .await;
    }

    pub async fn tool_succeeded(&self, session: &SessionContext, tool: &ToolCapability) {
        self.tool_event(
            session,
            tool,
            EventType::McpToolSucceeded,
            Some(ToolExecutionStatus::Ok),
            None,
            None,
        )
        .await;
    }

    pub async fn tool_failed<E: std::fmt::Display>(
        &self,
        session: &SessionContext,
        tool: &ToolCapability,
        err: &E,
    ) {
        self.tool_event(
            session,
            tool,
            EventType::McpToolFailed,
            None,
            Some(err.to_string()),
            None,
        )
        .await;
    }

    pub async fn tool_approval_pending(
        &self,
        session: &SessionContext,
        tool: &ToolCapability,
        message: &str,
    ) {
        self.tool_event(
            session,
            tool,
            EventType::McpToolApprovalPending,
            Some(ToolExecutionStatus::ApprovalRequired),
            None,
            Some(message),
        )
        .await;
    }

    /// Records the terminal event of one tool call from its result.
    pub async fn tool_result<T: ToolOutcome>(
        &self,
        session: &SessionContext,
        tool: &ToolCapability,
        result: &Result<T, AppError>,
    ) {
        match result {
            Ok(outcome) if outcome.status() == ToolExecutionStatus::ApprovalRequired => {
                self.tool_approval_pending(session, tool, outcome.message())
                    .await
            }
            Ok(_) => self.tool_succeeded(session, tool).await,
            Err(err) => self.tool_failed(session, tool, err).await,
        }
    }

    async fn tool_event(
        &self,
        session: &SessionContext,
        tool: &ToolCapability,
        event_type: EventType,
        status: Option<ToolExecutionStatus>,
        error: Option<String>,
        message: Option<&str>,
    ) {
        let payload = ToolEventPayload {
            server: &self.server_name,
            tool: tool.name,
            category: tool.category,
            approval_state: tool.approval,
            run_id: &session.run_id,
            project_id: &session.project_id,
            namespace: &session.namespace,
            runtime_mode: session.runtime_mode.as_str(),
            status,
            error,
            message,
        };
        self.record(
            &session.correlation_id,
            ActorType::Agent,
            &format!("run:{}", session.run_id),
            event_type,
            marshal_event_payload(&payload),
        )
        .await;
    }

    pub async fn approval_event(
        &self,
        request: &ActionRequest,
        actor_type: ActorType,
        event_type: EventType,
        actor_id: &str,
        reason: &str,
    ) {
        let payload = ApprovalEventPayload {
            request_id: request.id,
            run_id: &request.run_id,
            project_id: &request.project_id,
            tool_name: request.tool_name,
            action: &request.action,
            approval_mode: request.approval_mode.as_str(),
            approval_state: request.approval_state.as_str(),
            requested_by: &request.requested_by,
            applied_by: &request.applied_by,
            actor_id,
            reason,
            target_ref: &request.target_ref,
        };
        let recorded_actor = if actor_id.is_empty() {
            ACTOR_ID_CONTROL_PLANE_MCP
        } else {
            actor_id
        };
        self.record(
            &request.correlation_id,
            actor_type,
            recorded_actor,
            event_type,
            marshal_event_payload(&payload),
        )
        .await;
    }

    pub async fn run_wait_event(
        &self,
        correlation_id: &str,
        run_id: &str,
        wait_state: &str,
        timeout_guard_disabled: bool,
    ) {
        let event_type = if wait_state.is_empty() {
            EventType::RunWaitResumed
        } else {
            EventType::RunWaitPaused
        };
        let payload = RunWaitEventPayload {
            run_id,
            wait_state,
            timeout_guard_disabled,
        };
        self.record(
            correlation_id,
            ActorType::System,
            ACTOR_ID_CONTROL_PLANE_MCP,
            event_type,
            marshal_event_payload(&payload),
        )
        .await;
    }
}
