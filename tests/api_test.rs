//! Management API: auth, role checks, validation, workspace scoping and
//! rate limiting.

mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use common::{ScriptedProvider, TestApp, ACCOUNT_ID};
use inboxpilot::{
    config::Config,
    models::{Channel, ThreadKey},
    store::Store,
};

fn rule_body() -> serde_json::Value {
    json!({
        "name": "Tag refunds",
        "trigger": "new_message",
        "conditions": [{ "type": "message_contains", "keywords": ["refund"] }],
        "actions": [{ "type": "apply_tag", "tag": "  Billing " }],
        "priority": 5
    })
}

async fn seed_thread(app: &TestApp) -> Uuid {
    app.store
        .get_or_create_thread(&ThreadKey {
            workspace_id: app.workspace_id,
            channel: Channel::Whatsapp,
            external_id: "5511300".to_string(),
            account_id: ACCOUNT_ID.to_string(),
            contact_name: None,
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_management_routes_require_token() {
    let app = TestApp::new().await;

    let (status, body) = app.get("/api/automations", None).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_error!(body);
}

#[tokio::test]
async fn test_forged_token_is_rejected() {
    let app = TestApp::new().await;

    let (status, _) = app.get("/api/automations", Some("not.a.jwt")).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_creates_rule_with_normalized_tag() {
    let app = TestApp::new().await;
    let token = app.token("admin");

    let (status, body) = app.post("/api/automations", Some(&token), rule_body()).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_success!(body);
    assert_eq!(body["data"]["actions"][0]["tag"], "billing");
    assert_eq!(body["data"]["enabled"], true);

    let (status, body) = app.get("/api/automations", Some(&app.token("agent"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_agent_cannot_create_rule() {
    let app = TestApp::new().await;

    let (status, body) = app.post("/api/automations", Some(&app.token("agent")), rule_body()).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_error!(body);
}

#[tokio::test]
async fn test_rule_without_actions_is_rejected() {
    let app = TestApp::new().await;
    let mut body = rule_body();
    body["actions"] = json!([]);

    let (status, body) = app.post("/api/automations", Some(&app.token("admin")), body).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_error!(body);
}

#[tokio::test]
async fn test_rule_with_invalid_regex_is_rejected() {
    let app = TestApp::new().await;
    let mut body = rule_body();
    body["conditions"] = json!([{ "type": "message_matches", "pattern": "(unclosed" }]);

    let (status, _) = app.post("/api/automations", Some(&app.token("admin")), body).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rule_update_and_delete() {
    let app = TestApp::new().await;
    let token = app.token("admin");
    let (_, created) = app.post("/api/automations", Some(&token), rule_body()).await;
    let id = created["data"]["id"].as_str().unwrap().to_string();
    let path = format!("/api/automations/{id}");

    let (status, body) = app
        .request("PUT", &path, Some(&token), Some(json!({ "enabled": false })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enabled"], false);
    assert_eq!(body["data"]["name"], "Tag refunds");

    let (status, _) = app.request("DELETE", &path, Some(&token), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app.get(&path, Some(&token)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rules_are_scoped_to_workspace() {
    let app = TestApp::new().await;
    let (_, created) = app.post("/api/automations", Some(&app.token("admin")), rule_body()).await;
    let id = created["data"]["id"].as_str().unwrap();

    let outsider = app
        .state
        .auth
        .issue_token(Uuid::new_v4(), Uuid::new_v4(), "admin", Duration::hours(1))
        .unwrap();
    let (status, _) = app.get(&format!("/api/automations/{id}"), Some(&outsider)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_scheduled_action_create_and_cancel() {
    let app = TestApp::new().await;
    let token = app.token("agent");
    let thread_id = seed_thread(&app).await;

    let (status, created) = app
        .post(
            "/api/scheduled-actions",
            Some(&token),
            json!({
                "thread_id": thread_id,
                "run_at": Utc::now() + Duration::hours(1),
                "action": { "type": "send_message", "text": "Reminder" }
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["data"]["status"], "pending");
    let id = created["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .post(&format!("/api/scheduled-actions/{id}/cancel"), Some(&token), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");

    let (status, _) = app
        .post(&format!("/api/scheduled-actions/{id}/cancel"), Some(&token), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_scheduled_action_requires_thread() {
    let app = TestApp::new().await;

    let (status, _) = app
        .post(
            "/api/scheduled-actions",
            Some(&app.token("agent")),
            json!({
                "run_at": Utc::now() + Duration::hours(1),
                "action": { "type": "apply_tag", "tag": "later" }
            }),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_ai_settings_update_is_admin_only_and_audited() {
    let app = TestApp::new().await;
    let update = json!({ "allow_automation": true, "monthly_token_cap": 10000 });

    let (status, _) = app
        .request("PUT", "/api/ai-reply/settings", Some(&app.token("agent")), Some(update.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = app.token("admin");
    let (status, body) = app
        .request("PUT", "/api/ai-reply/settings", Some(&admin), Some(update))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["allow_automation"], true);
    assert_eq!(body["data"]["monthly_token_cap"], 10000);

    let (_, audit) = app.get("/api/audit-logs", Some(&admin)).await;
    let actions: Vec<&str> = audit["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|log| log["action"].as_str())
        .collect();
    assert!(actions.contains(&"ai_settings_updated"));
}

#[tokio::test]
async fn test_manual_handoff_and_reset() {
    let app = TestApp::new().await;
    let token = app.token("agent");
    let thread_id = seed_thread(&app).await;

    let (status, body) = app
        .post(
            &format!("/api/ai-reply/threads/{thread_id}/handoff"),
            Some(&token),
            json!({ "reason": "VIP customer" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["handoff"], "handed_off");

    let (_, body) = app
        .get(&format!("/api/ai-reply/threads/{thread_id}"), Some(&token))
        .await;
    assert_eq!(body["data"]["handoff_reason"], "VIP customer");

    let (status, body) = app
        .post(&format!("/api/ai-reply/threads/{thread_id}/reset"), Some(&token), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["handoff"], "none");
}

#[tokio::test]
async fn test_usage_summary_reports_cap() {
    let app = TestApp::new().await;
    app.enable_ai(|s| s.monthly_token_cap = Some(5000)).await;

    let (status, body) = app.get("/api/ai-reply/usage?days=7", Some(&app.token("agent"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["monthly_token_cap"], 5000);
    assert_eq!(body["data"]["month_to_date_tokens"], 0);
}

#[tokio::test]
async fn test_audit_log_is_admin_only() {
    let app = TestApp::new().await;

    let (status, _) = app.get("/api/audit-logs", Some(&app.token("agent"))).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_management_api_is_rate_limited() {
    let mut config = Config::for_testing();
    config.rate_limit_max_requests = 2;
    let app = TestApp::with(config, ScriptedProvider::replying("ok")).await;
    let token = app.token("agent");

    for _ in 0..2 {
        let (status, _) = app.get("/api/automations", Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = app.get("/api/automations", Some(&token)).await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_error!(body);

    // Webhooks and health are outside the limiter
    let (status, _) = app.get("/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
}
