use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqliteConnection, SqlitePool, sqlite::SqliteRow};

use crate::{
    error::AppError,
    models::{ActionRequest, ApprovalMode, ApprovalState, ToolName},
};

const ACTION_COLUMNS: &str = "id, correlation_id, run_id, project_id, tool_name, action, target_ref, \
     approval_mode, approval_state, requested_by, applied_by, payload, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewActionRequest {
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
}

/// Key-sorted serialization so equal targets always produce the same signature text.
pub fn canonical_json(value: &Value) -> Result<String, AppError> {
    serde_json::to_string(&canonicalize_json(value)).map_err(AppError::internal)
}

fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize_json(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in ordered {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(values) => Value::Array(values.iter().map(canonicalize_json).collect()),
        _ => value.clone(),
    }
}

fn action_from_row(row: &SqliteRow) -> Result<ActionRequest, AppError> {
    let tool_name: String = row.try_get("tool_name")?;
    let approval_mode: String = row.try_get("approval_mode")?;
    let approval_state: String = row.try_get("approval_state")?;
    let target_ref: String = row.try_get("target_ref")?;
    let payload: String = row.try_get("payload")?;

    Ok(ActionRequest {
        id: row.try_get("id")?,
        correlation_id: row.try_get("correlation_id")?,
        run_id: row.try_get("run_id")?,
        project_id: row.try_get("project_id")?,
        tool_name: ToolName::parse(&tool_name)
            .ok_or_else(|| AppError::corrupt("tool_name", &tool_name))?,
        action: row.try_get("action")?,
        target_ref: serde_json::from_str(&target_ref)
            .map_err(|e| AppError::corrupt("target_ref", e))?,
        approval_mode: ApprovalMode::parse(&approval_mode)
            .ok_or_else(|| AppError::corrupt("approval_mode", &approval_mode))?,
        approval_state: ApprovalState::parse(&approval_state)
            .ok_or_else(|| AppError::corrupt("approval_state", &approval_state))?,
        requested_by: row.try_get("requested_by")?,
        applied_by: row.try_get("applied_by")?,
        payload: serde_json::from_str(&payload).map_err(|e| AppError::corrupt("payload", e))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Inserts a request. Returns `None` when a pending row with the same signature already exists.
pub async fn insert_action_request(
    conn: &mut SqliteConnection,
    item: &NewActionRequest,
) -> Result<Option<ActionRequest>, AppError> {
    let now = Utc::now();
    let sql = format!(
        r#"
        INSERT INTO mcp_action_requests (
          correlation_id,
          run_id,
          project_id,
          tool_name,
          action,
          target_ref,
          approval_mode,
          approval_state,
          requested_by,
          applied_by,
          payload,
          created_at,
          updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
        ON CONFLICT DO NOTHING
        RETURNING {ACTION_COLUMNS}
        "#
    );

    let row = sqlx::query(&sql)
        .bind(&item.correlation_id)
        .bind(&item.run_id)
        .bind(&item.project_id)
        .bind(item.tool_name.as_str())
        .bind(&item.action)
        .bind(canonical_json(&item.target_ref)?)
        .bind(item.approval_mode.as_str())
        .bind(item.approval_state.as_str())
        .bind(&item.requested_by)
        .bind(&item.applied_by)
        .bind(serde_json::to_string(&item.payload).map_err(AppError::internal)?)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(action_from_row).transpose()
}

pub async fn find_pending_by_signature(
    conn: &mut SqliteConnection,
    run_id: &str,
    tool_name: ToolName,
    action: &str,
    target_ref: &Value,
) -> Result<Option<ActionRequest>, AppError> {
    let sql = format!(
        r#"
        SELECT {ACTION_COLUMNS}
        FROM mcp_action_requests
        WHERE run_id = ?1
          AND tool_name = ?2
          AND action = ?3
          AND target_ref = ?4
          AND approval_state = 'requested'
        ORDER BY id DESC
        LIMIT 1
        "#
    );

    let row = sqlx::query(&sql)
        .bind(run_id)
        .bind(tool_name.as_str())
        .bind(action)
        .bind(canonical_json(target_ref)?)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(action_from_row).transpose()
}

/// Most recent request of any state with the given signature.
pub async fn find_latest_by_signature(
    db: &SqlitePool,
    run_id: &str,
    tool_name: ToolName,
    action: &str,
    target_ref: &Value,
) -> Result<Option<ActionRequest>, AppError> {
    let sql = format!(
        r#"
        SELECT {ACTION_COLUMNS}
        FROM mcp_action_requests
        WHERE run_id = ?1
          AND tool_name = ?2
          AND action = ?3
          AND target_ref = ?4
        ORDER BY id DESC
        LIMIT 1
        "#
    );

    let row = sqlx::query(&sql)
        .bind(run_id)
        .bind(tool_name.as_str())
        .bind(action)
        .bind(canonical_json(target_ref)?)
        .fetch_optional(db)
        .await?;

    row.as_ref().map(action_from_row).transpose()
}

pub async fn get_action_request(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<ActionRequest>, AppError> {
    let sql = format!("SELECT {ACTION_COLUMNS} FROM mcp_action_requests WHERE id = ?1");
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.as_ref().map(action_from_row).transpose()
}

/// Compare-and-set transition. `payload_patch` is merged into the stored payload.
/// Returns `None` when the row is no longer in `expected`.
pub async fn update_action_state(
    conn: &mut SqliteConnection,
    id: i64,
    expected: ApprovalState,
    next: ApprovalState,
    applied_by: Option<&str>,
    payload_patch: &Value,
) -> Result<Option<ActionRequest>, AppError> {
    let sql = format!(
        r#"
        UPDATE mcp_action_requests
        SET approval_state = ?1,
            applied_by = COALESCE(?2, applied_by),
            payload = json_patch(payload, ?3),
            updated_at = ?4
        WHERE id = ?5
          AND approval_state = ?6
        RETURNING {ACTION_COLUMNS}
        "#
    );

    let row = sqlx::query(&sql)
        .bind(next.as_str())
        .bind(applied_by)
        .bind(serde_json::to_string(payload_patch).map_err(AppError::internal)?)
        .bind(Utc::now())
        .bind(id)
        .bind(expected.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(action_from_row).transpose()
}

/// Moves pending rows created before `cutoff` to `expired`, optionally scoped to one signature.
pub async fn expire_stale_pending(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
    signature: Option<(&str, ToolName, &str, &Value)>,
    payload_patch: &Value,
) -> Result<Vec<ActionRequest>, AppError> {
    let sql = format!(
        r#"
        UPDATE mcp_action_requests
        SET approval_state = 'expired',
            payload = json_patch(payload, ?1),
            updated_at = ?2
        WHERE approval_state = 'requested'
          AND created_at < ?3
          AND (?4 IS NULL OR (run_id = ?4 AND tool_name = ?5 AND action = ?6 AND target_ref = ?7))
        RETURNING {ACTION_COLUMNS}
        "#
    );

    let (run_id, tool_name, action, target_ref) = match signature {
        Some((run_id, tool_name, action, target_ref)) => (
            Some(run_id),
            Some(tool_name.as_str()),
            Some(action),
            Some(canonical_json(target_ref)?),
        ),
        None => (None, None, None, None),
    };

    let rows = sqlx::query(&sql)
        .bind(serde_json::to_string(payload_patch).map_err(AppError::internal)?)
        .bind(Utc::now())
        .bind(cutoff)
        .bind(run_id)
        .bind(tool_name)
        .bind(action)
        .bind(target_ref)
        .fetch_all(&mut *conn)
        .await?;

    rows.iter().map(action_from_row).collect()
}

pub async fn count_pending_for_run(
    conn: &mut SqliteConnection,
    run_id: &str,
) -> Result<i64, AppError> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS pending
        FROM mcp_action_requests
        WHERE run_id = ?1
          AND approval_state = 'requested'
        "#,
    )
    .bind(run_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.try_get("pending")?)
}

/// Oldest pending requests first.
pub async fn list_pending(db: &SqlitePool, limit: i64) -> Result<Vec<ActionRequest>, AppError> {
    let sql = format!(
        r#"
        SELECT {ACTION_COLUMNS}
        FROM mcp_action_requests
        WHERE approval_state = 'requested'
        ORDER BY id ASC
        LIMIT ?1
        "#
    );

    let rows = sqlx::query(&sql).bind(limit).fetch_all(db).await?;
    rows.iter().map(action_from_row).collect()
}
