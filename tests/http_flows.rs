mod common;

use axum::{body::Body, http::{Request, StatusCode}};
use common::{
    INTERNAL_TOKEN, RunSeed, TestApp, TestOptions, auth_request, build_test_app,
    build_test_app_with, json_auth_request, json_request,
};
use mcp_control_plane::{
    clients::DatabaseLifecycleClient, models::ToolName, policy::is_tool_allowed,
    runs::get_agent_session, token::verify_run_token,
};
use serde_json::{Value, json};

fn tool_names(body: &Value) -> Vec<String> {
    body["tools"]
        .as_array()
        .expect("tools should be an array")
        .iter()
        .map(|tool| tool["name"].as_str().unwrap_or_default().to_string())
        .collect()
}

async fn wait_state(app: &TestApp, run_id: &str) -> (String, bool) {
    let session = get_agent_session(&app.state.db, run_id)
        .await
        .expect("agent session should load");
    session
        .map(|s| (s.wait_state, s.timeout_guard_disabled))
        .unwrap_or_default()
}

async fn request_state(app: &TestApp, request_id: i64) -> String {
    sqlx::query_scalar::<_, String>("SELECT approval_state FROM mcp_action_requests WHERE id = ?1")
        .bind(request_id)
        .fetch_one(&app.state.db)
        .await
        .expect("action request should exist")
}

async fn action_request_count(app: &TestApp) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM mcp_action_requests")
        .fetch_one(&app.state.db)
        .await
        .expect("count should load")
}

fn secret_sync_args() -> Value {
    json!({
        "environment": "dev",
        "github_secret_name": "APP_TOKEN",
        "kubernetes_secret_name": "app-secrets",
        "secret_value": "s3cr3t-value",
    })
}

#[tokio::test]
async fn health_and_ready_endpoints_return_ok() {
    let app = build_test_app().await;

    let req = Request::builder()
        .method("GET")
        .uri("/v1/healthz")
        .body(Body::empty())
        .expect("request should build");
    let (status, body) = app.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));

    let req = Request::builder()
        .method("GET")
        .uri("/v1/readyz")
        .body(Body::empty())
        .expect("request should build");
    let (status, body) = app.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ready": true}));
}

#[tokio::test]
async fn mcp_routes_require_run_token() {
    let app = build_test_app().await;

    let (status, body) = app
        .send(json_request("POST", "/v1/mcp/tools/run_status_report", json!({"status": "x"})))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, body) = app.send(auth_request("GET", "/v1/mcp/tools", "not-a-jwt")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn tool_list_follows_trigger_and_agent() {
    let app = build_test_app().await;
    let dev = app.seed_run(RunSeed::dev("run-dev")).await;
    let ops = app.seed_run(RunSeed::ops("run-ops")).await;
    let improve = app.seed_run(RunSeed::self_improve("run-improve")).await;

    let (status, body) = app.send(auth_request("GET", "/v1/mcp/tools", &dev)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["server"], "control-plane-mcp");
    assert_eq!(body["run_id"], "run-dev");
    assert_eq!(
        tool_names(&body),
        vec![
            "github_labels_add",
            "github_labels_list",
            "github_labels_remove",
            "github_labels_transition",
            "run_status_report",
        ]
    );

    let (_, body) = app.send(auth_request("GET", "/v1/mcp/tools", &ops)).await;
    let names = tool_names(&body);
    assert_eq!(names.len(), 8);
    assert!(names.contains(&"secret.sync.github_k8s".to_string()));
    assert!(names.contains(&"database.lifecycle".to_string()));
    assert!(names.contains(&"owner.feedback.request".to_string()));

    let (_, body) = app.send(auth_request("GET", "/v1/mcp/tools", &improve)).await;
    let names = tool_names(&body);
    assert_eq!(names.len(), 8);
    assert!(names.contains(&"self_improve_session_get".to_string()));
    assert!(!names.contains(&"secret.sync.github_k8s".to_string()));
}

#[tokio::test]
async fn invisible_and_unknown_tools_are_rejected() {
    let app = build_test_app().await;
    let dev = app.seed_run(RunSeed::dev("run-dev")).await;

    let (status, body) = app
        .call_tool(&dev, "secret.sync.github_k8s", secret_sync_args())
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let (status, body) = app.call_tool(&dev, "shell.exec", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    assert_eq!(action_request_count(&app).await, 0);
    let events = app.event_types("corr-run-dev").await;
    assert!(events.contains(&"mcp.tool.failed".to_string()));
    assert!(!events.contains(&"mcp.tool.called".to_string()));
}

#[tokio::test]
async fn run_status_report_is_audited() {
    let app = build_test_app().await;
    let dev = app.seed_run(RunSeed::dev("run-dev")).await;

    let (status, body) = app
        .call_tool(&dev, "run_status_report", json!({"status": "  running tests  "}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["report"], "running tests");

    let (status, body) = app
        .call_tool(&dev, "run_status_report", json!({"status": "x".repeat(101)}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");

    let events = app.event_types("corr-run-dev").await;
    assert!(events.contains(&"run.mcp.token.issued".to_string()));
    assert!(events.contains(&"run.agent.status_reported".to_string()));
    assert!(events.contains(&"mcp.tool.succeeded".to_string()));
    assert!(events.contains(&"mcp.tool.failed".to_string()));
}

#[tokio::test]
async fn label_tools_use_run_issue_by_default() {
    let app = build_test_app().await;
    let dev = app.seed_run(RunSeed::dev("run-dev")).await;

    let (status, body) = app
        .call_tool(&dev, "github_labels_add", json!({"labels": ["bug", " Bug ", "triage", ""]}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["issue_number"], 42);
    assert_eq!(body["labels"], json!(["bug", "triage"]));

    let (status, body) = app
        .call_tool(
            &dev,
            "github_labels_transition",
            json!({"remove_labels": ["triage"], "add_labels": ["in-progress"]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["labels"], json!(["bug", "in-progress"]));

    let (status, body) = app
        .call_tool(&dev, "github_labels_list", json!({"issue_number": 100}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["issue_number"], 100);
    assert_eq!(body["labels"], json!([]));

    let (status, _) = app.call_tool(&dev, "github_labels_add", json!({"labels": []})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn dry_run_persists_nothing() {
    let app = build_test_app().await;
    let ops = app.seed_run(RunSeed::ops("run-ops")).await;

    let mut args = secret_sync_args();
    args["dry_run"] = json!(true);
    let (status, body) = app.call_tool(&ops, "secret.sync.github_k8s", args).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "dry_run");
    assert_eq!(body["dry_run"], true);
    assert_eq!(body["kubernetes_ref"], "acme-dev/app-secrets#value");
    assert_eq!(body["policy"], "provided");
    assert!(body.get("request_id").is_none());

    assert_eq!(action_request_count(&app).await, 0);
    assert_eq!(wait_state(&app, "run-ops").await, (String::new(), false));
}

#[tokio::test]
async fn code_only_secret_sync_waits_for_owner_and_applies_on_approval() {
    let app = build_test_app().await;
    let token = app.seed_run(RunSeed::ops("run-ops").code_only()).await;

    let (status, first) = app
        .call_tool(&token, "secret.sync.github_k8s", secret_sync_args())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "approval_required");
    assert_eq!(first["message"], "approval_required");
    assert_eq!(first["approval_state"], "requested");
    assert_eq!(first["reused"], false);
    let request_id = first["request_id"].as_i64().expect("request id");

    let (_, retry) = app
        .call_tool(&token, "secret.sync.github_k8s", secret_sync_args())
        .await;
    assert_eq!(retry["request_id"], request_id);
    assert_eq!(retry["reused"], true);
    assert_eq!(action_request_count(&app).await, 1);

    let stored: String =
        sqlx::query_scalar("SELECT payload FROM mcp_action_requests WHERE id = ?1")
            .bind(request_id)
            .fetch_one(&app.state.db)
            .await
            .expect("payload should load");
    assert!(!stored.contains("s3cr3t-value"));
    assert!(stored.contains("secret_value_encrypted"));

    let mode: String =
        sqlx::query_scalar("SELECT approval_mode FROM mcp_action_requests WHERE id = ?1")
            .bind(request_id)
            .fetch_one(&app.state.db)
            .await
            .expect("mode should load");
    assert_eq!(mode, "owner");
    assert_eq!(wait_state(&app, "run-ops").await, ("mcp".to_string(), true));

    let (status, resolved) = app.resolve(request_id, "approved").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["approval_state"], "applied");
    assert_eq!(resolved["tool_name"], "secret.sync.github_k8s");

    let k8s = app
        .cluster
        .secret("acme-dev", "app-secrets")
        .expect("kubernetes secret should exist");
    assert_eq!(k8s.get("value").map(String::as_str), Some("s3cr3t-value"));
    assert_eq!(
        app.source_control.environment_secret("acme/api", "dev", "APP_TOKEN").as_deref(),
        Some("s3cr3t-value")
    );
    assert_eq!(wait_state(&app, "run-ops").await, (String::new(), false));

    let (status, again) = app.resolve(request_id, "denied").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["approval_state"], "applied");

    let events = app.event_types("corr-run-ops").await;
    for expected in [
        "mcp.tool.approval_pending",
        "approval.requested",
        "run.wait.paused",
        "approval.approved",
        "approval.applied",
        "run.wait.resumed",
    ] {
        assert!(events.contains(&expected.to_string()), "missing {expected}");
    }
}

#[tokio::test]
async fn denied_request_clears_wait_state() {
    let app = build_test_app().await;
    let ops = app.seed_run(RunSeed::ops("run-ops")).await;

    let (status, body) = app
        .call_tool(
            &ops,
            "database.lifecycle",
            json!({"environment": "dev", "action": "create", "database_name": "orders_db"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approval_required");
    let request_id = body["request_id"].as_i64().expect("request id");
    assert_eq!(wait_state(&app, "run-ops").await, ("mcp".to_string(), true));

    let (status, resolved) = app.resolve(request_id, "denied").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["approval_state"], "denied");
    assert_eq!(request_state(&app, request_id).await, "denied");
    assert_eq!(wait_state(&app, "run-ops").await, (String::new(), false));

    let (status, body) = app.resolve(request_id, "bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");

    let (status, _) = app.resolve(9_999, "approved").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn concurrent_retries_share_one_pending_request() {
    let app = build_test_app().await;
    let ops = app.seed_run(RunSeed::ops("run-ops")).await;
    let args = json!({"question": "Rotate now?", "options": ["yes", "no"]});

    let ((first_status, first), (second_status, second)) = tokio::join!(
        app.call_tool(&ops, "owner.feedback.request", args.clone()),
        app.call_tool(&ops, "owner.feedback.request", args.clone()),
    );
    assert_eq!(first_status, StatusCode::OK);
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(first["request_id"], second["request_id"]);
    assert_eq!(action_request_count(&app).await, 1);

    let request_id = first["request_id"].as_i64().expect("request id");
    let (_, resolved) = app.resolve(request_id, "denied").await;
    assert_eq!(resolved["approval_state"], "denied");

    let (_, again) = app.call_tool(&ops, "owner.feedback.request", args).await;
    assert_eq!(again["status"], "approval_required");
    assert_ne!(again["request_id"], first["request_id"]);
    assert_eq!(action_request_count(&app).await, 2);
}

#[tokio::test]
async fn delegated_auto_apply_replays_by_idempotency_key() {
    let app = build_test_app_with(TestOptions {
        delegated_auto_apply: true,
        ..TestOptions::default()
    })
    .await;
    let ops = app.seed_run(RunSeed::ops("run-ops")).await;

    let mut args = secret_sync_args();
    args["idempotency_key"] = json!("Deploy-1");
    let (status, first) = app.call_tool(&ops, "secret.sync.github_k8s", args.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "ok");
    assert_eq!(first["message"], "applied");
    assert_eq!(first["approval_state"], "applied");
    assert_eq!(first["idempotency_key"], "deploy-1");
    let request_id = first["request_id"].as_i64().expect("request id");

    let (status, second) = app.call_tool(&ops, "secret.sync.github_k8s", args).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["message"], "idempotent_replay");
    assert_eq!(second["reused"], true);
    assert_eq!(second["request_id"], request_id);
    assert_eq!(action_request_count(&app).await, 1);
    assert_eq!(wait_state(&app, "run-ops").await, (String::new(), false));
}

#[tokio::test]
async fn database_lifecycle_validates_and_describes() {
    let app = build_test_app_with(TestOptions {
        delegated_auto_apply: true,
        ..TestOptions::default()
    })
    .await;
    let ops = app.seed_run(RunSeed::ops("run-ops")).await;

    let (status, body) = app
        .call_tool(
            &ops,
            "database.lifecycle",
            json!({"environment": "dev", "action": "create", "database_name": "1 bad name"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");

    let (status, _) = app
        .call_tool(
            &ops,
            "database.lifecycle",
            json!({"environment": "prod", "action": "create", "database_name": "orders"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, created) = app
        .call_tool(
            &ops,
            "database.lifecycle",
            json!({"environment": "dev", "action": "create", "database_name": "orders"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["message"], "applied");
    assert_eq!(created["applied"], true);
    assert_eq!(created["exists"], true);

    let (status, described) = app
        .call_tool(
            &ops,
            "database.lifecycle",
            json!({"environment": "dev", "action": "describe", "database_name": "orders"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(described["message"], "described");
    assert_eq!(described["exists"], true);
    assert!(described.get("request_id").is_none());

    let (status, delete) = app
        .call_tool(
            &ops,
            "database.lifecycle",
            json!({"environment": "dev", "action": "delete", "database_name": "orders"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(delete["status"], "approval_required");
    assert_eq!(delete["message"], "delete_confirmation_required");

    assert_eq!(action_request_count(&app).await, 2);
}

#[tokio::test]
async fn owner_feedback_requires_options_and_owner() {
    let app = build_test_app_with(TestOptions {
        delegated_auto_apply: true,
        ..TestOptions::default()
    })
    .await;
    let ops = app.seed_run(RunSeed::ops("run-ops")).await;

    let (status, body) = app
        .call_tool(
            &ops,
            "owner.feedback.request",
            json!({"question": "Ship it?", "options": ["yes", " YES "]}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");

    let (status, body) = app
        .call_tool(
            &ops,
            "owner.feedback.request",
            json!({"question": "Ship it?", "options": ["yes", "no", "later"]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approval_required");
    assert_eq!(body["options"], json!(["yes", "no", "later"]));
    let request_id = body["request_id"].as_i64().expect("request id");

    let (_, resolved) = app.resolve(request_id, "approved").await;
    assert_eq!(resolved["approval_state"], "applied");
}

#[tokio::test]
async fn failed_apply_is_persisted() {
    let app = build_test_app_with(TestOptions {
        delegated_auto_apply: true,
        cluster_unavailable: true,
    })
    .await;
    let ops = app.seed_run(RunSeed::ops("run-ops")).await;

    let (status, body) = app
        .call_tool(&ops, "secret.sync.github_k8s", secret_sync_args())
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "upstream");

    let state: String = sqlx::query_scalar(
        "SELECT approval_state FROM mcp_action_requests WHERE run_id = 'run-ops'",
    )
    .fetch_one(&app.state.db)
    .await
    .expect("failed request should be stored");
    assert_eq!(state, "failed");
}

#[tokio::test]
async fn approved_request_fails_when_sink_is_down() {
    let app = build_test_app_with(TestOptions {
        cluster_unavailable: true,
        ..TestOptions::default()
    })
    .await;
    let token = app.seed_run(RunSeed::ops("run-ops").code_only()).await;

    let (_, body) = app
        .call_tool(&token, "secret.sync.github_k8s", secret_sync_args())
        .await;
    let request_id = body["request_id"].as_i64().expect("request id");

    let (status, resolved) = app.resolve(request_id, "approved").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["approval_state"], "failed");
    assert_eq!(wait_state(&app, "run-ops").await, (String::new(), false));
}

#[tokio::test]
async fn pending_approvals_are_listed_for_internal_callers() {
    let app = build_test_app().await;
    let ops = app.seed_run(RunSeed::ops("run-ops")).await;

    app.call_tool(&ops, "secret.sync.github_k8s", secret_sync_args()).await;
    app.call_tool(
        &ops,
        "database.lifecycle",
        json!({"environment": "staging", "action": "create", "database_name": "orders"}),
    )
    .await;

    let (status, body) = app
        .send(auth_request("GET", "/internal/v1/approvals?limit=10", INTERNAL_TOKEN))
        .await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().expect("items should be an array");
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["tool_name"], "secret.sync.github_k8s");
    assert_eq!(items[0]["approval_mode"], "delegated");
    assert_eq!(items[1]["target_ref"]["database_name"], "orders");

    let (status, body) = app
        .send(auth_request("GET", "/internal/v1/approvals", "wrong-token"))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn internal_token_issuance() {
    let app = build_test_app().await;
    app.seed_run(RunSeed::dev("run-dev")).await;

    let (status, body) = app
        .send(json_auth_request(
            "POST",
            "/internal/v1/runs/run-dev/mcp-token",
            INTERNAL_TOKEN,
            json!({"runtime_mode": "full-env"}),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");

    let (status, body) = app
        .send(json_auth_request(
            "POST",
            "/internal/v1/runs/run-dev/mcp-token",
            INTERNAL_TOKEN,
            json!({"runtime_mode": "code-only", "ttl_seconds": 120}),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().expect("token").to_string();
    assert!(body["expires_at"].is_string());

    let (status, body) = app.send(auth_request("GET", "/v1/mcp/tools", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run_id"], "run-dev");

    let (status, _) = app
        .send(json_auth_request(
            "POST",
            "/internal/v1/runs/missing-run/mcp-token",
            INTERNAL_TOKEN,
            json!({}),
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .send(json_auth_request(
            "POST",
            "/internal/v1/runs/run-dev/mcp-token",
            app.config.token_signing_key.as_str(),
            json!({}),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn self_improve_tools_read_project_runs() {
    let app = build_test_app().await;
    app.seed_run(RunSeed::dev("run-a")).await;
    app.seed_run(RunSeed::ops("run-b")).await;
    let improve = app.seed_run(RunSeed::self_improve("run-improve")).await;

    let (status, body) = app
        .call_tool(&improve, "self_improve_runs_list", json!({"limit": 2}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"], 2);
    assert_eq!(body["page"], 1);
    assert_eq!(body["has_next"], true);
    assert_eq!(body["items"].as_array().map(Vec::len), Some(2));

    let (status, body) = app
        .call_tool(&improve, "self_improve_run_lookup", json!({"issue_number": 42}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"][0]["run_id"], "run-a");
    assert_eq!(body["items"][0]["trigger_kind"], "dev");

    let (status, _) = app
        .call_tool(&improve, "self_improve_run_lookup", json!({}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Runs that never paused have no session row.
    let (status, _) = app
        .call_tool(&improve, "self_improve_session_get", json!({"run_id": "run-a"}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let ops_token = app.seed_run(RunSeed::ops("run-c").code_only()).await;
    app.call_tool(&ops_token, "secret.sync.github_k8s", secret_sync_args()).await;

    let (status, body) = app
        .call_tool(&improve, "self_improve_session_get", json!({"run_id": "run-c"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run"]["run_id"], "run-c");
    assert_eq!(body["wait_state"], "mcp");
    assert_eq!(body["timeout_guard_disabled"], true);
    assert_eq!(body["session"], Value::Null);
}

async fn backdate_request(app: &TestApp, request_id: i64) {
    sqlx::query("UPDATE mcp_action_requests SET created_at = ?1 WHERE id = ?2")
        .bind(chrono::Utc::now() - chrono::Duration::hours(2))
        .bind(request_id)
        .execute(&app.state.db)
        .await
        .expect("request should be backdated");
}

#[tokio::test]
async fn stale_requests_expire_lazily() {
    let app = build_test_app().await;
    let ops = app.seed_run(RunSeed::ops("run-ops")).await;

    let (_, body) = app
        .call_tool(
            &ops,
            "database.lifecycle",
            json!({"environment": "dev", "action": "create", "database_name": "orders"}),
        )
        .await;
    let listed_id = body["request_id"].as_i64().expect("request id");
    backdate_request(&app, listed_id).await;

    let (status, body) = app
        .send(auth_request("GET", "/internal/v1/approvals", INTERNAL_TOKEN))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"], json!([]));
    assert_eq!(request_state(&app, listed_id).await, "expired");
    assert_eq!(wait_state(&app, "run-ops").await, (String::new(), false));

    let events = app.event_types("corr-run-ops").await;
    assert!(events.contains(&"approval.expired".to_string()));
    assert!(events.contains(&"run.wait.resumed".to_string()));

    // A stale request resolved by the owner is expired instead of applied.
    let (_, body) = app
        .call_tool(
            &ops,
            "owner.feedback.request",
            json!({"question": "Proceed?", "options": ["yes", "no"]}),
        )
        .await;
    let resolved_id = body["request_id"].as_i64().expect("request id");
    backdate_request(&app, resolved_id).await;

    let (status, resolved) = app.resolve(resolved_id, "approved").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["approval_state"], "expired");
    assert_eq!(wait_state(&app, "run-ops").await, (String::new(), false));
}

#[tokio::test]
async fn visibility_check_matches_tool_listing() {
    let app = build_test_app().await;
    let dev = app.seed_run(RunSeed::dev("run-dev")).await;
    let ops = app.seed_run(RunSeed::ops("run-ops")).await;

    let dev_session = verify_run_token(&app.state, &dev).await.expect("dev token should verify");
    let ops_session = verify_run_token(&app.state, &ops).await.expect("ops token should verify");

    let cases = [
        (&dev_session, ToolName::RunStatusReport, true),
        (&dev_session, ToolName::DatabaseLifecycle, false),
        (&dev_session, ToolName::SelfImproveRunsList, false),
        (&ops_session, ToolName::DatabaseLifecycle, true),
        (&ops_session, ToolName::SelfImproveRunsList, false),
    ];
    for (session, tool, expected) in cases {
        let (run_ctx, allowed) = is_tool_allowed(&app.state, session, tool)
            .await
            .expect("visibility should resolve");
        assert_eq!(allowed, expected, "{} {tool}", run_ctx.session.run_id);
    }

    let (_, listed) = app.send(auth_request("GET", "/v1/mcp/tools", &ops)).await;
    for name in tool_names(&listed) {
        let tool = ToolName::parse(&name).expect("listed tool should be registered");
        let (_, allowed) = is_tool_allowed(&app.state, &ops_session, tool)
            .await
            .expect("visibility should resolve");
        assert!(allowed, "{name} is listed but not allowed");
    }
}

#[tokio::test]
async fn generated_secret_waits_for_delegate_and_lands_in_both_sinks() {
    let app = build_test_app().await;
    let ops = app.seed_run(RunSeed::ops("run-ops")).await;

    let mut args = secret_sync_args();
    args.as_object_mut()
        .expect("args should be an object")
        .remove("secret_value");

    let (status, body) = app.call_tool(&ops, "secret.sync.github_k8s", args).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approval_required");
    assert_eq!(body["approval_state"], "requested");
    assert_eq!(body["policy"], "random");
    let request_id = body["request_id"].as_i64().expect("request id");

    let (mode, payload): (String, String) = sqlx::query_as(
        "SELECT approval_mode, payload FROM mcp_action_requests WHERE id = ?1",
    )
    .bind(request_id)
    .fetch_one(&app.state.db)
    .await
    .expect("request should load");
    assert_eq!(mode, "delegated");
    let payload: Value = serde_json::from_str(&payload).expect("payload should be json");
    assert!(payload.get("secret_value").is_none());
    assert!(
        payload["secret_value_encrypted"]
            .as_str()
            .is_some_and(|sealed| !sealed.is_empty())
    );
    assert!(app.source_control.environment_secret("acme/api", "dev", "APP_TOKEN").is_none());

    let (status, resolved) = app.resolve(request_id, "approved").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["approval_state"], "applied");

    let github = app
        .source_control
        .environment_secret("acme/api", "dev", "APP_TOKEN")
        .expect("github secret should be written");
    let k8s = app
        .cluster
        .secret("acme-dev", "app-secrets")
        .expect("kubernetes secret should exist");
    assert_eq!(k8s.get("value"), Some(&github));
    assert_eq!(github.len(), 43);
    assert!(
        github
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    );
    assert!(!payload.to_string().contains(&github));
}

async fn mark_approved(app: &TestApp, request_id: i64) {
    sqlx::query("UPDATE mcp_action_requests SET approval_state = 'approved' WHERE id = ?1")
        .bind(request_id)
        .execute(&app.state.db)
        .await
        .expect("request should be marked approved");
}

#[tokio::test]
async fn decisions_on_approved_request_never_reapply() {
    let app = build_test_app().await;
    let ops = app.seed_run(RunSeed::ops("run-ops").code_only()).await;

    let (_, body) = app
        .call_tool(
            &ops,
            "database.lifecycle",
            json!({"environment": "dev", "action": "create", "database_name": "orders"}),
        )
        .await;
    assert_eq!(body["status"], "approval_required");
    let request_id = body["request_id"].as_i64().expect("request id");
    mark_approved(&app, request_id).await;

    for decision in ["denied", "approved"] {
        let (status, resolved) = app.resolve(request_id, decision).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resolved["approval_state"], "approved");
    }
    assert!(
        !app.databases
            .database_exists("dev", "orders")
            .await
            .expect("registry should answer")
    );

    // Past the apply lease the row is failed, still without running the action.
    sqlx::query("UPDATE mcp_action_requests SET updated_at = ?1 WHERE id = ?2")
        .bind(chrono::Utc::now() - chrono::Duration::hours(2))
        .bind(request_id)
        .execute(&app.state.db)
        .await
        .expect("request should be backdated");

    let (status, resolved) = app.resolve(request_id, "approved").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["approval_state"], "failed");
    assert!(
        !app.databases
            .database_exists("dev", "orders")
            .await
            .expect("registry should answer")
    );
    assert_eq!(wait_state(&app, "run-ops").await, (String::new(), false));

    let payload: String =
        sqlx::query_scalar("SELECT payload FROM mcp_action_requests WHERE id = ?1")
            .bind(request_id)
            .fetch_one(&app.state.db)
            .await
            .expect("payload should load");
    assert!(payload.contains("apply interrupted"));

    let (_, again) = app.resolve(request_id, "approved").await;
    assert_eq!(again["approval_state"], "failed");
}
