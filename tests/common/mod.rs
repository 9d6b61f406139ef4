use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use mcp_control_plane::{
    clients::{Clients, SimulatedCluster, SimulatedDatabases, SimulatedSourceControl},
    config::Config,
    db::connect_and_bootstrap,
    handlers::router,
    models::{RepositoryBinding, RuntimeMode},
    runs::{NewRun, insert_run, upsert_repository_binding},
    state::AppState,
    token::{IssueRunTokenParams, issue_run_token},
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

pub const INTERNAL_TOKEN: &str = "internal-test-token";
pub const PROJECT_ID: &str = "project-1";
pub const REPOSITORY_ID: &str = "repo-1";
pub const REPOSITORY_TOKEN: &str = "ghp_test_token";

pub struct TestApp {
    pub app: Router,
    pub config: Config,
    pub state: AppState,
    pub source_control: Arc<SimulatedSourceControl>,
    pub cluster: Arc<SimulatedCluster>,
    pub databases: Arc<SimulatedDatabases>,
    _temp_dir: TempDir,
}

#[derive(Default)]
pub struct TestOptions {
    pub delegated_auto_apply: bool,
    pub cluster_unavailable: bool,
}

/// One seeded run. `runtime_mode` decides the privileges of the issued token.
pub struct RunSeed<'a> {
    pub run_id: &'a str,
    pub trigger_kind: &'a str,
    pub trigger_label: &'a str,
    pub agent_key: &'a str,
    pub issue_number: Option<i64>,
    pub runtime_mode: RuntimeMode,
}

impl<'a> RunSeed<'a> {
    pub fn dev(run_id: &'a str) -> Self {
        Self {
            run_id,
            trigger_kind: "dev",
            trigger_label: "run:dev",
            agent_key: "dev",
            issue_number: Some(42),
            runtime_mode: RuntimeMode::FullEnv,
        }
    }

    pub fn ops(run_id: &'a str) -> Self {
        Self {
            run_id,
            trigger_kind: "ops",
            trigger_label: "run:ops",
            agent_key: "sre",
            issue_number: Some(7),
            runtime_mode: RuntimeMode::FullEnv,
        }
    }

    pub fn self_improve(run_id: &'a str) -> Self {
        Self {
            run_id,
            trigger_kind: "self_improve",
            trigger_label: "run:self-improve",
            agent_key: "dev",
            issue_number: Some(9),
            runtime_mode: RuntimeMode::FullEnv,
        }
    }

    pub fn code_only(mut self) -> Self {
        self.runtime_mode = RuntimeMode::CodeOnly;
        self
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("request should execute");
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("response body should be readable");
        let parsed = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);
        (status, parsed)
    }

    /// Inserts the run and returns a run token for it.
    pub async fn seed_run(&self, seed: RunSeed<'_>) -> String {
        let mut payload = json!({
            "project": {"id": PROJECT_ID, "repository_id": REPOSITORY_ID},
            "repository": {"full_name": "acme/api", "name": "api"},
            "trigger": {"kind": seed.trigger_kind, "label": seed.trigger_label},
            "agent": {"key": seed.agent_key, "name": seed.agent_key},
        });
        if let Some(number) = seed.issue_number {
            payload["issue"] = json!({"number": number, "title": "test issue"});
        }

        insert_run(
            &self.state.db,
            &NewRun {
                id: seed.run_id.to_string(),
                correlation_id: format!("corr-{}", seed.run_id),
                project_id: PROJECT_ID.to_string(),
                status: "running".to_string(),
                run_payload: payload,
            },
        )
        .await
        .expect("run should be inserted");

        issue_run_token(
            &self.state,
            IssueRunTokenParams {
                run_id: seed.run_id.to_string(),
                namespace: "acme-dev".to_string(),
                runtime_mode: seed.runtime_mode,
                ttl_seconds: None,
            },
        )
        .await
        .expect("run token should be issued")
        .token
    }

    pub async fn call_tool(&self, token: &str, tool: &str, args: Value) -> (StatusCode, Value) {
        self.send(json_auth_request(
            "POST",
            &format!("/v1/mcp/tools/{tool}"),
            token,
            args,
        ))
        .await
    }

    pub async fn resolve(&self, request_id: i64, decision: &str) -> (StatusCode, Value) {
        self.send(json_auth_request(
            "POST",
            &format!("/internal/v1/approvals/{request_id}/resolve"),
            INTERNAL_TOKEN,
            json!({"decision": decision, "actor_id": "owner:alice", "reason": "reviewed"}),
        ))
        .await
    }

    pub async fn event_types(&self, correlation_id: &str) -> Vec<String> {
        sqlx::query_scalar::<_, String>(
            "SELECT event_type FROM flow_events WHERE correlation_id = ?1 ORDER BY created_at, rowid",
        )
        .bind(correlation_id)
        .fetch_all(&self.state.db)
        .await
        .expect("flow events should load")
    }
}

pub async fn build_test_app() -> TestApp {
    build_test_app_with(TestOptions::default()).await
}

pub async fn build_test_app_with(options: TestOptions) -> TestApp {
    let temp_dir = TempDir::new().expect("temp directory should be created");
    let db_path = temp_dir.path().join("test-control-plane.db");
    let db_url = format!("sqlite://{}", db_path.display());

    let config = Config {
        bind_addr: "127.0.0.1:0".to_string(),
        database_url: db_url,
        server_name: "control-plane-mcp".to_string(),
        token_signing_key: "test-signing-key".to_string(),
        token_issuer: "control-plane/mcp".to_string(),
        token_ttl_seconds: 3600,
        token_min_ttl_seconds: 60,
        token_max_ttl_seconds: 7200,
        database_lifecycle_allowed_envs: vec!["dev".to_string(), "staging".to_string()],
        approval_ttl_seconds: 3600,
        delegated_auto_apply: options.delegated_auto_apply,
        secret_derivation_seed: "test-derivation-seed".to_string(),
        credential_encryption_key: "11".repeat(32),
        internal_api_token: Some(INTERNAL_TOKEN.to_string()),
    };

    let db = connect_and_bootstrap(&config)
        .await
        .expect("db bootstrap should succeed");

    let source_control = Arc::new(SimulatedSourceControl::default());
    let cluster = Arc::new(if options.cluster_unavailable {
        SimulatedCluster::unavailable()
    } else {
        SimulatedCluster::default()
    });
    let databases = Arc::new(SimulatedDatabases::default());
    let clients = Clients {
        source_control: source_control.clone(),
        cluster: cluster.clone(),
        databases: databases.clone(),
    };

    let state = AppState::new(config.clone(), db, clients).expect("state should build");
    upsert_repository_binding(
        &state.db,
        &RepositoryBinding {
            id: REPOSITORY_ID.to_string(),
            project_id: PROJECT_ID.to_string(),
            owner: "acme".to_string(),
            name: "api".to_string(),
            services_yaml_path: String::new(),
            token_encrypted: Some(
                state
                    .crypt
                    .encrypt_string(REPOSITORY_TOKEN)
                    .expect("credential should encrypt"),
            ),
        },
    )
    .await
    .expect("repository binding should be stored");

    let app = router(state.clone());

    TestApp {
        app,
        config,
        state,
        source_control,
        cluster,
        databases,
        _temp_dir: temp_dir,
    }
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request should build")
}

pub fn json_auth_request(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(body.to_string()))
        .expect("request should build")
}

pub fn auth_request(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request should build")
}
