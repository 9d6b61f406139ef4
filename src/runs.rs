use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqliteConnection, SqlitePool, sqlite::SqliteRow};

use crate::{
    error::AppError,
    models::{RepositoryBinding, Run},
};

pub const WAIT_STATE_NONE: &str = "";
pub const WAIT_STATE_MCP: &str = "mcp";

#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: String,
    pub correlation_id: String,
    pub project_id: String,
    pub status: String,
    pub run_payload: Value,
}

#[derive(Debug, Clone)]
pub struct AgentSession {
    pub run_id: String,
    pub session_json: Option<String>,
    pub wait_state: String,
    pub timeout_guard_disabled: bool,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

fn run_from_row(row: &SqliteRow) -> Result<Run, AppError> {
    Ok(Run {
        id: row.try_get("id")?,
        correlation_id: row.try_get("correlation_id")?,
        project_id: row.try_get("project_id")?,
        status: row.try_get("status")?,
        run_payload: row.try_get("run_payload")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

pub async fn get_run(db: &SqlitePool, run_id: &str) -> Result<Option<Run>, AppError> {
    let row = sqlx::query(
        r#"
        SELECT id, correlation_id, project_id, status, run_payload, created_at, started_at, finished_at
        FROM runs
        WHERE id = ?1
        "#,
    )
    .bind(run_id)
    .fetch_optional(db)
    .await?;

    row.as_ref().map(run_from_row).transpose()
}

pub async fn insert_run(db: &SqlitePool, run: &NewRun) -> Result<(), AppError> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO runs (id, correlation_id, project_id, status, run_payload, created_at, started_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)
        "#,
    )
    .bind(&run.id)
    .bind(&run.correlation_id)
    .bind(&run.project_id)
    .bind(&run.status)
    .bind(run.run_payload.to_string())
    .bind(now)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn update_run_status(
    db: &SqlitePool,
    run_id: &str,
    status: &str,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = ?1,
            finished_at = CASE WHEN ?1 IN ('pending', 'running') THEN finished_at ELSE ?2 END,
            updated_at = ?2
        WHERE id = ?3
        "#,
    )
    .bind(status)
    .bind(Utc::now())
    .bind(run_id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_repository_binding(
    db: &SqlitePool,
    repository_id: &str,
) -> Result<Option<RepositoryBinding>, AppError> {
    let row = sqlx::query(
        r#"
        SELECT id, project_id, owner, name, services_yaml_path, token_encrypted
        FROM repository_bindings
        WHERE id = ?1
        "#,
    )
    .bind(repository_id)
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(RepositoryBinding {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        owner: row.try_get("owner")?,
        name: row.try_get("name")?,
        services_yaml_path: row.try_get("services_yaml_path")?,
        token_encrypted: row.try_get("token_encrypted")?,
    }))
}

pub async fn upsert_repository_binding(
    db: &SqlitePool,
    binding: &RepositoryBinding,
) -> Result<(), AppError> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO repository_bindings (id, project_id, owner, name, services_yaml_path, token_encrypted, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
        ON CONFLICT(id) DO UPDATE SET
          project_id = excluded.project_id,
          owner = excluded.owner,
          name = excluded.name,
          services_yaml_path = excluded.services_yaml_path,
          token_encrypted = excluded.token_encrypted,
          updated_at = excluded.updated_at
        "#,
    )
    .bind(&binding.id)
    .bind(&binding.project_id)
    .bind(&binding.owner)
    .bind(&binding.name)
    .bind(&binding.services_yaml_path)
    .bind(&binding.token_encrypted)
    .bind(now)
    .execute(db)
    .await?;
    Ok(())
}

/// Updates the wait-state of the run's agent session, creating the session row when absent.
/// Pausing also refreshes the heartbeat.
pub async fn set_wait_state(
    conn: &mut SqliteConnection,
    run_id: &str,
    wait_state: &str,
    timeout_guard_disabled: bool,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO agent_sessions (run_id, wait_state, timeout_guard_disabled, last_heartbeat_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(run_id) DO UPDATE SET
          wait_state = excluded.wait_state,
          timeout_guard_disabled = excluded.timeout_guard_disabled,
          last_heartbeat_at = COALESCE(excluded.last_heartbeat_at, agent_sessions.last_heartbeat_at),
          updated_at = excluded.updated_at
        "#,
    )
    .bind(run_id)
    .bind(wait_state)
    .bind(timeout_guard_disabled)
    .bind((wait_state == WAIT_STATE_MCP).then(Utc::now))
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Moves the wait-state to paused or cleared; returns whether the stored state changed.
pub async fn reconcile_wait_state(
    conn: &mut SqliteConnection,
    run_id: &str,
    paused: bool,
) -> Result<bool, AppError> {
    let (wait_state, timeout_guard_disabled) = if paused {
        (WAIT_STATE_MCP, true)
    } else {
        (WAIT_STATE_NONE, false)
    };

    let current = sqlx::query(
        r#"
        SELECT wait_state, timeout_guard_disabled
        FROM agent_sessions
        WHERE run_id = ?1
        "#,
    )
    .bind(run_id)
    .fetch_optional(&mut *conn)
    .await?;

    let (current_state, current_guard) = match current {
        Some(row) => (
            row.try_get::<String, _>("wait_state")?,
            row.try_get::<bool, _>("timeout_guard_disabled")?,
        ),
        None => (WAIT_STATE_NONE.to_string(), false),
    };
    if current_state == wait_state && current_guard == timeout_guard_disabled {
        return Ok(false);
    }

    set_wait_state(conn, run_id, wait_state, timeout_guard_disabled).await?;
    Ok(true)
}

pub async fn get_agent_session(
    db: &SqlitePool,
    run_id: &str,
) -> Result<Option<AgentSession>, AppError> {
    let row = sqlx::query(
        r#"
        SELECT run_id, session_json, wait_state, timeout_guard_disabled, last_heartbeat_at
        FROM agent_sessions
        WHERE run_id = ?1
        "#,
    )
    .bind(run_id)
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(AgentSession {
        run_id: row.try_get("run_id")?,
        session_json: row.try_get("session_json")?,
        wait_state: row.try_get("wait_state")?,
        timeout_guard_disabled: row.try_get("timeout_guard_disabled")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
    }))
}

pub async fn save_agent_session_snapshot(
    db: &SqlitePool,
    run_id: &str,
    session_json: &Value,
) -> Result<(), AppError> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO agent_sessions (run_id, session_json, last_heartbeat_at, updated_at)
        VALUES (?1, ?2, ?3, ?3)
        ON CONFLICT(run_id) DO UPDATE SET
          session_json = excluded.session_json,
          last_heartbeat_at = excluded.last_heartbeat_at,
          updated_at = excluded.updated_at
        "#,
    )
    .bind(run_id)
    .bind(session_json.to_string())
    .bind(now)
    .execute(db)
    .await?;
    Ok(())
}

/// Recent runs of a project, newest first. An empty repository name matches every repository.
pub async fn list_recent_by_project(
    db: &SqlitePool,
    project_id: &str,
    repository_full_name: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<Run>, AppError> {
    let rows = sqlx::query(
        r#"
        SELECT id, correlation_id, project_id, status, run_payload, created_at, started_at, finished_at
        FROM runs
        WHERE project_id = ?1
          AND (?2 = '' OR lower(json_extract(run_payload, '$.repository.full_name')) = lower(?2))
        ORDER BY created_at DESC, id DESC
        LIMIT ?3 OFFSET ?4
        "#,
    )
    .bind(project_id)
    .bind(repository_full_name)
    .bind(limit)
    .bind(offset)
    .fetch_all(db)
    .await?;

    rows.iter().map(run_from_row).collect()
}

pub async fn search_by_issue_or_pull_request(
    db: &SqlitePool,
    project_id: &str,
    repository_full_name: &str,
    issue_number: i64,
    pull_request_number: i64,
    limit: i64,
) -> Result<Vec<Run>, AppError> {
    let rows = sqlx::query(
        r#"
        SELECT id, correlation_id, project_id, status, run_payload, created_at, started_at, finished_at
        FROM runs
        WHERE project_id = ?1
          AND (?2 = '' OR lower(json_extract(run_payload, '$.repository.full_name')) = lower(?2))
          AND (
            (?3 > 0 AND json_extract(run_payload, '$.issue.number') = ?3)
            OR (?4 > 0 AND json_extract(run_payload, '$.pull_request.number') = ?4)
          )
        ORDER BY created_at DESC, id DESC
        LIMIT ?5
        "#,
    )
    .bind(project_id)
    .bind(repository_full_name)
    .bind(issue_number)
    .bind(pull_request_number)
    .bind(limit)
    .fetch_all(db)
    .await?;

    rows.iter().map(run_from_row).collect()
}
