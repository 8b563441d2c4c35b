//! Webhook ingress: handshake, signature verification, and the
//! queue-to-pipeline path with idempotent delivery handling.

mod common;

use axum::{body::Body, http::Request, http::StatusCode};
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use common::{now_ts, text_message_payload, ScriptedProvider, TestApp, ACCOUNT_ID, APP_SECRET};
use inboxpilot::{
    config::Config,
    services::{
        pipeline_service::EventDisposition,
        signature_service::{body_signature_header, sign},
    },
    store::Store,
};

fn signed(body: &[u8]) -> String {
    body_signature_header(body, APP_SECRET)
}

#[tokio::test]
async fn test_handshake_echoes_challenge() {
    let app = TestApp::new().await;
    let req = Request::builder()
        .uri("/api/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=test-verify-token&hub.challenge=1158201444")
        .body(Body::empty())
        .unwrap();

    let (status, body) = app.send_raw(req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"1158201444");
}

#[tokio::test]
async fn test_handshake_rejects_wrong_token() {
    let app = TestApp::new().await;
    let req = Request::builder()
        .uri("/api/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=1")
        .body(Body::empty())
        .unwrap();

    let (status, _) = app.send_raw(req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unsigned_delivery_is_rejected() {
    let mut app = TestApp::new().await;
    let body = serde_json::to_vec(&text_message_payload("wamid.1", "5511999", "hi", now_ts())).unwrap();

    let (status, _) = app.post_webhook(&body, None).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(app.jobs.try_recv().is_err());
}

#[tokio::test]
async fn test_tampered_delivery_is_rejected() {
    let mut app = TestApp::new().await;
    let body = serde_json::to_vec(&text_message_payload("wamid.1", "5511999", "hi", now_ts())).unwrap();
    let signature = signed(&body);
    let tampered = serde_json::to_vec(&text_message_payload("wamid.1", "5511999", "hello", now_ts())).unwrap();

    let (status, _) = app.post_webhook(&tampered, Some(&signature)).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(app.jobs.try_recv().is_err());
}

#[tokio::test]
async fn test_signed_delivery_is_acknowledged_and_queued() {
    let mut app = TestApp::new().await;
    let body = serde_json::to_vec(&text_message_payload("wamid.1", "5511999", "hi", now_ts())).unwrap();

    let (status, ack) = app.post_webhook(&body, Some(&signed(&body))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "ok");
    let job = app.jobs.try_recv().expect("job queued");
    assert_eq!(job.batch.events.len(), 1);
    assert_eq!(job.batch.events[0].workspace_id, app.workspace_id);
    assert_eq!(job.batch.events[0].account_id, ACCOUNT_ID);
}

#[tokio::test]
async fn test_garbage_body_is_acknowledged_without_work() {
    let mut app = TestApp::new().await;
    let body = b"not json at all";

    let (status, _) = app.post_webhook(body, Some(&signed(body))).await;

    assert_eq!(status, StatusCode::OK);
    assert!(app.jobs.try_recv().is_err());
}

#[tokio::test]
async fn test_unknown_account_is_acknowledged_without_work() {
    let mut app = TestApp::new().await;
    let mut payload = text_message_payload("wamid.1", "5511999", "hi", now_ts());
    payload["entry"][0]["changes"][0]["value"]["metadata"]["phone_number_id"] = json!("999");
    let body = serde_json::to_vec(&payload).unwrap();

    let (status, _) = app.post_webhook(&body, Some(&signed(&body))).await;

    assert_eq!(status, StatusCode::OK);
    assert!(app.jobs.try_recv().is_err());
}

#[tokio::test]
async fn test_missing_app_secret_accepts_unsigned_delivery() {
    let mut config = Config::for_testing();
    config.whatsapp_app_secret = None;
    let mut app = TestApp::with(config, ScriptedProvider::replying("ok")).await;
    let body = serde_json::to_vec(&text_message_payload("wamid.1", "5511999", "hi", now_ts())).unwrap();

    let (status, _) = app.post_webhook(&body, None).await;

    assert_eq!(status, StatusCode::OK);
    assert!(app.jobs.try_recv().is_ok());
}

#[tokio::test]
async fn test_duplicate_delivery_sets_first_response_once() {
    let mut app = TestApp::new().await;
    let first_ts = now_ts() - 120;
    let body = serde_json::to_vec(&text_message_payload("wamid.A", "5511999", "hello", first_ts)).unwrap();
    let signature = signed(&body);

    // Provider retries the same delivery
    for _ in 0..2 {
        let (status, _) = app.post_webhook(&body, Some(&signature)).await;
        assert_eq!(status, StatusCode::OK);
    }

    let first = app.jobs.try_recv().unwrap();
    let second = app.jobs.try_recv().unwrap();
    let results = app.worker.process_batch(first).await;
    assert!(matches!(results[0], Ok(EventDisposition::Processed { .. })));
    let results = app.worker.process_batch(second).await;
    assert!(matches!(results[0], Ok(EventDisposition::Duplicate)));

    let thread = app.thread_for("5511999").await;
    let expected = Utc.timestamp_opt(first_ts, 0).unwrap();
    assert_eq!(thread.first_response_at, Some(expected));
    assert_eq!(thread.unread_count, 1);
    assert_eq!(app.store.event_count().await, 1);

    // A later message on the same thread leaves it untouched
    let later = serde_json::to_vec(&text_message_payload("wamid.B", "5511999", "still there?", first_ts + 60)).unwrap();
    app.post_webhook(&later, Some(&signed(&later))).await;
    let job = app.jobs.try_recv().unwrap();
    app.worker.process_batch(job).await;

    let thread = app.thread_for("5511999").await;
    assert_eq!(thread.first_response_at, Some(expected));
    assert_eq!(thread.unread_count, 2);
    assert_eq!(thread.last_message_text.as_deref(), Some("still there?"));
}

#[tokio::test]
async fn test_failed_event_is_not_swallowed_as_duplicate() {
    let mut app = TestApp::new().await;
    let body = serde_json::to_vec(&text_message_payload("wamid.F1", "5511777", "hello", now_ts())).unwrap();
    app.post_webhook(&body, Some(&signed(&body))).await;
    let job = app.jobs.try_recv().unwrap();
    let event = job.batch.events[0].clone();

    app.faults.fail("get_or_create_thread");
    let results = app.worker.process_batch(job).await;
    assert!(results[0].is_err());

    // Provider redelivers once the database is back
    app.faults.heal("get_or_create_thread");
    let disposition = app.worker.process_event(&event).await.unwrap();
    assert!(matches!(disposition, EventDisposition::Processed { .. }));
    assert_eq!(app.thread_for("5511777").await.unread_count, 1);

    let disposition = app.worker.process_event(&event).await.unwrap();
    assert_eq!(disposition, EventDisposition::Duplicate);
}

#[tokio::test]
async fn test_failed_event_is_retried_by_scheduler() {
    let mut app = TestApp::new().await;
    let body = serde_json::to_vec(&text_message_payload("wamid.F2", "5511778", "hello", now_ts())).unwrap();
    app.post_webhook(&body, Some(&signed(&body))).await;
    let job = app.jobs.try_recv().unwrap();
    let event = job.batch.events[0].clone();

    app.faults.fail("record_customer_message");
    assert!(app.worker.process_batch(job).await[0].is_err());
    app.faults.heal("record_customer_message");
    let error = app.store.event_error(app.workspace_id, "wamid.F2").await;
    assert!(error.unwrap_or_default().contains("pool timed out"));

    // Backed off: not due yet
    assert_eq!(app.scheduler.tick(Utc::now()).await.events_retried, 0);

    let report = app.scheduler.tick(Utc::now() + Duration::minutes(5)).await;
    assert_eq!(report.events_retried, 1);
    let thread = app.thread_for("5511778").await;
    assert_eq!(thread.unread_count, 1);
    assert_eq!(thread.last_message_text.as_deref(), Some("hello"));

    let report = app.scheduler.tick(Utc::now() + Duration::minutes(10)).await;
    assert_eq!(report.events_retried, 0);
    assert_eq!(
        app.worker.process_event(&event).await.unwrap(),
        EventDisposition::Duplicate
    );
}

#[tokio::test]
async fn test_event_is_given_up_after_max_attempts() {
    let mut config = Config::for_testing();
    config.scheduler_max_attempts = 2;
    let mut app = TestApp::with(config, ScriptedProvider::replying("ok")).await;
    let body = serde_json::to_vec(&text_message_payload("wamid.F3", "5511779", "hello", now_ts())).unwrap();
    app.post_webhook(&body, Some(&signed(&body))).await;
    let job = app.jobs.try_recv().unwrap();
    let event = job.batch.events[0].clone();

    app.faults.fail("get_or_create_thread");
    assert!(app.worker.process_batch(job).await[0].is_err());
    let report = app.scheduler.tick(Utc::now() + Duration::minutes(5)).await;
    assert_eq!(report.events_retried, 0);

    let audit = app.store.list_audit(app.workspace_id, 20, 0).await.unwrap();
    let failed: Vec<_> = audit.iter().filter(|log| log.action == "inbound_event_failed").collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].resource_id.as_deref(), Some("wamid.F3"));

    // Given up: no more retries and redeliveries are ignored
    app.faults.heal("get_or_create_thread");
    let report = app.scheduler.tick(Utc::now() + Duration::hours(2)).await;
    assert_eq!(report.events_retried, 0);
    assert_eq!(
        app.worker.process_event(&event).await.unwrap(),
        EventDisposition::Duplicate
    );
}

#[tokio::test]
async fn test_status_update_is_recorded_not_threaded() {
    let mut app = TestApp::new().await;
    let payload = json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "WABA-1",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": { "display_phone_number": "15550001111", "phone_number_id": ACCOUNT_ID },
                    "statuses": [{
                        "id": "wamid.out.1",
                        "status": "delivered",
                        "timestamp": now_ts().to_string(),
                        "recipient_id": "5511999"
                    }]
                }
            }]
        }]
    });
    let body = serde_json::to_vec(&payload).unwrap();

    app.post_webhook(&body, Some(&signed(&body))).await;
    let job = app.jobs.try_recv().unwrap();
    let results = app.worker.process_batch(job).await;

    assert!(matches!(results[0], Ok(EventDisposition::StatusRecorded)));
    assert!(app
        .state
        .store
        .list_open_threads(app.workspace_id, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_deauthorize_accepts_valid_signed_request() {
    let app = TestApp::new().await;
    let token = sign(&json!({ "algorithm": "HMAC-SHA256", "user_id": "42" }), APP_SECRET);

    let (status, body) = app
        .post("/api/webhooks/meta/deauthorize", None, json!({ "signed_request": token }))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_success!(body);
}

#[tokio::test]
async fn test_deauthorize_rejects_forged_signed_request() {
    let app = TestApp::new().await;
    let token = sign(&json!({ "algorithm": "HMAC-SHA256", "user_id": "42" }), "some-other-secret");

    let (status, body) = app
        .post("/api/webhooks/meta/deauthorize", None, json!({ "signed_request": token }))
        .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_error!(body);
}
