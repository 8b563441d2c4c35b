//! Shared helpers for integration tests.
//!
//! This module provides:
//! - `TestApp` – the full router over an in-memory store, with scripted
//!   AI provider and channel sender doubles
//! - `FaultyStore` – store wrapper the app runs on, for failure injection
//! - JSON assertion helpers
//! - Webhook payload builders

#![allow(dead_code)]

mod faulty_store;

pub use faulty_store::FaultyStore;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use inboxpilot::{
    assemble, build_router,
    config::Config,
    error::{ProviderError, SendError},
    middleware::MemoryRateLimitStore,
    models::{AIReplySettings, LLMProvider, Prompt, ProviderReply, Thread},
    services::{
        pipeline_service::JobReceiver, AiProvider, AiReplyService, AuditService, AutomationEngine,
        MessageSender, PipelineWorker, ProviderRegistry, Scheduler,
    },
    store::{MemoryStore, Store},
    AppState, Components,
};

pub const ACCOUNT_ID: &str = "100200300";
pub const APP_SECRET: &str = "test-app-secret";

/// AI provider double that counts calls and returns a scripted reply
pub struct ScriptedProvider {
    calls: AtomicUsize,
    reply: Mutex<Result<ProviderReply, String>>,
    delay: Option<std::time::Duration>,
}

impl ScriptedProvider {
    pub fn replying(text: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            reply: Mutex::new(Ok(ProviderReply {
                text: text.to_string(),
                tokens_in: Some(40),
                tokens_out: Some(10),
            })),
            delay: None,
        }
    }

    /// Replies without reporting token usage
    pub fn without_usage(text: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            reply: Mutex::new(Ok(ProviderReply {
                text: text.to_string(),
                tokens_in: None,
                tokens_out: None,
            })),
            delay: None,
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            reply: Mutex::new(Err(reason.to_string())),
            delay: None,
        }
    }

    /// Sleep for `delay` before answering
    pub fn stalling(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiProvider for ScriptedProvider {
    fn kind(&self) -> LLMProvider {
        LLMProvider::Anthropic
    }

    async fn complete(&self, _prompt: &Prompt) -> Result<ProviderReply, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reply
            .lock()
            .unwrap()
            .clone()
            .map_err(ProviderError::CallFailed)
    }
}

/// Channel sender double that records every outbound text
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(Uuid, String)>>,
    fail: Mutex<bool>,
}

impl RecordingSender {
    pub fn sent(&self) -> Vec<(Uuid, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send_text(&self, thread: &Thread, text: &str) -> Result<String, SendError> {
        if *self.fail.lock().unwrap() {
            return Err(SendError::Failed("channel unavailable".to_string()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((thread.id, text.to_string()));
        Ok(format!("wamid.out.{}", sent.len()))
    }
}

/// Fully wired application over a `MemoryStore`.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    /// The store the app runs on, wrapping `store`
    pub faults: Arc<FaultyStore>,
    pub provider: Arc<ScriptedProvider>,
    pub sender: Arc<RecordingSender>,
    pub worker: PipelineWorker,
    pub scheduler: Scheduler,
    pub jobs: JobReceiver,
    pub workspace_id: Uuid,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with(Config::for_testing(), ScriptedProvider::replying("Happy to help!")).await
    }

    pub async fn with(config: Config, provider: ScriptedProvider) -> Self {
        let store = Arc::new(MemoryStore::new());
        let workspace_id = Uuid::new_v4();
        store.register_account(ACCOUNT_ID, workspace_id).await;

        let provider = Arc::new(provider);
        let sender = Arc::new(RecordingSender::default());
        let providers = ProviderRegistry::new().with(provider.clone());
        let faults = Arc::new(FaultyStore::new(store.clone()));

        let Components {
            state,
            worker,
            scheduler,
            jobs,
        } = assemble(
            config,
            faults.clone(),
            providers,
            sender.clone(),
            Arc::new(MemoryRateLimitStore::new()),
        );

        Self {
            router: build_router(state.clone()),
            state,
            store,
            faults,
            provider,
            sender,
            worker,
            scheduler,
            jobs,
            workspace_id,
        }
    }

    /// Engine over the same store the app runs on
    pub fn engine(&self) -> AutomationEngine {
        AutomationEngine::new(
            self.faults.clone(),
            AuditService::new(self.faults.clone()),
            self.sender.clone(),
        )
    }

    pub fn ai(&self) -> &AiReplyService {
        &self.state.ai
    }

    /// Enable AI replies for the test workspace
    pub async fn enable_ai(&self, tweak: impl FnOnce(&mut AIReplySettings)) {
        let mut settings = AIReplySettings::disabled(self.workspace_id);
        settings.allow_automation = true;
        settings.provider = LLMProvider::Anthropic;
        tweak(&mut settings);
        self.store.upsert_ai_settings(&settings).await.unwrap();
    }

    pub fn token(&self, role: &str) -> String {
        self.state
            .auth
            .issue_token(Uuid::new_v4(), self.workspace_id, role, Duration::hours(1))
            .unwrap()
    }

    pub async fn request(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        payload: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().uri(path).method(method);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let body = match payload {
            Some(payload) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(serde_json::to_vec(&payload).unwrap())
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).unwrap()).await
    }

    /// Send a GET request and return (status, body).
    pub async fn get(&self, path: &str, token: Option<&str>) -> (StatusCode, Value) {
        self.request("GET", path, token, None).await
    }

    /// Send a POST request with a JSON body and return (status, body).
    pub async fn post(&self, path: &str, token: Option<&str>, payload: Value) -> (StatusCode, Value) {
        self.request("POST", path, token, Some(payload)).await
    }

    /// POST raw bytes to the WhatsApp webhook with an optional signature header
    pub async fn post_webhook(&self, body: &[u8], signature: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .uri("/api/webhooks/whatsapp")
            .method("POST")
            .header("Content-Type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("X-Hub-Signature-256", signature);
        }
        self.send(builder.body(Body::from(body.to_vec())).unwrap()).await
    }

    pub async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let (status, bytes) = self.send_raw(req).await;
        let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    pub async fn send_raw(&self, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    /// Thread created for a customer by the pipeline
    pub async fn thread_for(&self, customer: &str) -> Thread {
        let threads = self.store.list_open_threads(self.workspace_id, 100).await.unwrap();
        threads
            .into_iter()
            .find(|t| t.external_id == customer)
            .unwrap_or_else(|| panic!("no thread for {customer}"))
    }
}

/// WhatsApp Cloud payload carrying one text message
pub fn text_message_payload(message_id: &str, from: &str, text: &str, timestamp: i64) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "WABA-1",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {
                        "display_phone_number": "15550001111",
                        "phone_number_id": ACCOUNT_ID
                    },
                    "contacts": [{ "profile": { "name": "Ana" }, "wa_id": from }],
                    "messages": [{
                        "from": from,
                        "id": message_id,
                        "timestamp": timestamp.to_string(),
                        "type": "text",
                        "text": { "body": text }
                    }]
                }
            }]
        }]
    })
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Assert that a JSON object has `"success": true`.
#[macro_export]
macro_rules! assert_success {
    ($body:expr) => {
        assert_eq!(
            $body["success"],
            serde_json::Value::Bool(true),
            "Expected success=true, got: {}",
            $body
        );
    };
}

/// Assert that a JSON object has `"success": false`.
#[macro_export]
macro_rules! assert_error {
    ($body:expr) => {
        assert_eq!(
            $body["success"],
            serde_json::Value::Bool(false),
            "Expected success=false, got: {}",
            $body
        );
    };
}
