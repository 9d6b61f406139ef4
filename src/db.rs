use std::{str::FromStr, time::Duration};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::{SqlitePool, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions}};
use uuid::Uuid;

use crate::{config::Config, error::AppError};

pub async fn connect_and_bootstrap(config: &Config) -> Result<SqlitePool, AppError> {
    let options = SqliteConnectOptions::from_str(&config.database_url)
        .map_err(AppError::internal)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;

    bootstrap_schema(&pool).await?;

    Ok(pool)
}

const SCHEMA_BOOTSTRAP_SQL: &[&str] = &[
    "PRAGMA foreign_keys = ON;",

    "CREATE TABLE IF NOT EXISTS runs (
      id TEXT PRIMARY KEY,
      correlation_id TEXT NOT NULL,
      project_id TEXT NOT NULL DEFAULT '',
      status TEXT NOT NULL,
      run_payload TEXT NOT NULL,
      created_at DATETIME NOT NULL,
      started_at DATETIME,
      finished_at DATETIME,
      updated_at DATETIME NOT NULL
    );",

    "CREATE TABLE IF NOT EXISTS repository_bindings (
      id TEXT PRIMARY KEY,
      project_id TEXT NOT NULL,
      owner TEXT NOT NULL DEFAULT '',
      name TEXT NOT NULL DEFAULT '',
      services_yaml_path TEXT NOT NULL DEFAULT '',
      token_encrypted TEXT,
      created_at DATETIME NOT NULL,
      updated_at DATETIME NOT NULL
    );",

    "CREATE TABLE IF NOT EXISTS agent_sessions (
      run_id TEXT PRIMARY KEY,
      session_json TEXT,
      wait_state TEXT NOT NULL DEFAULT '',
      timeout_guard_disabled INTEGER NOT NULL DEFAULT 0,
      last_heartbeat_at DATETIME,
      updated_at DATETIME NOT NULL,
      FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
    );",

    "CREATE TABLE IF NOT EXISTS mcp_action_requests (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      correlation_id TEXT NOT NULL,
      run_id TEXT NOT NULL,
      project_id TEXT NOT NULL DEFAULT '',
      tool_name TEXT NOT NULL,
      action TEXT NOT NULL,
      target_ref TEXT NOT NULL,
      approval_mode TEXT NOT NULL,
      approval_state TEXT NOT NULL,
      requested_by TEXT NOT NULL,
      applied_by TEXT NOT NULL DEFAULT '',
      payload TEXT NOT NULL,
      created_at DATETIME NOT NULL,
      updated_at DATETIME NOT NULL
    );",

    "CREATE TABLE IF NOT EXISTS flow_events (
      id TEXT PRIMARY KEY,
      correlation_id TEXT NOT NULL,
      actor_type TEXT NOT NULL,
      actor_id TEXT NOT NULL,
      event_type TEXT NOT NULL,
      payload TEXT NOT NULL,
      created_at DATETIME NOT NULL
    );",

    "CREATE INDEX IF NOT EXISTS idx_runs_project_created ON runs(project_id, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_repository_bindings_project ON repository_bindings(project_id);",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_mcp_action_requests_pending_signature
      ON mcp_action_requests(run_id, tool_name, action, target_ref)
      WHERE approval_state = 'requested';",
    "CREATE INDEX IF NOT EXISTS idx_mcp_action_requests_state_created
      ON mcp_action_requests(approval_state, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_mcp_action_requests_signature
      ON mcp_action_requests(run_id, tool_name, action, target_ref, id);",
    "CREATE INDEX IF NOT EXISTS idx_flow_events_correlation
      ON flow_events(correlation_id, created_at);",
];

async fn bootstrap_schema(pool: &SqlitePool) -> Result<(), AppError> {
    for statement in SCHEMA_BOOTSTRAP_SQL {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7())
}

pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn random_token(byte_len: usize) -> String {
    let mut bytes = vec![0_u8; byte_len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
