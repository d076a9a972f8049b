#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parley::auth::{Identity, Role};
use parley::completion::{CompletionClient, UpstreamError};
use parley::conversation::MemoryConversationStore;
use parley::ratelimit::MemoryCounterStore;
use parley::{app, build_state, AppConfig, AppState, Backends};
use serde_json::Value;
use tokio::net::TcpListener;

pub const SECRET: &str = "integration-test-secret";
pub const MOCK_ANSWER: &str = "This is a mock AI response";

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Completion provider double that counts calls.
pub struct MockCompletion {
    reply: Result<String, String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockCompletion {
    pub fn answering(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(text.to_string()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(detail: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(detail.to_string()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(text: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(text.to_string()),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CompletionClient for MockCompletion {
    async fn complete(&self, _prompt: &str, _model: &str) -> Result<String, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply
            .clone()
            .map_err(|detail| UpstreamError::Status {
                status: 500,
                body: detail,
            })
    }
}

pub fn config(limit: u32) -> AppConfig {
    let mut cfg = AppConfig::with_secret(SECRET);
    cfg.rate_limit = limit;
    cfg
}

/// A running server on an ephemeral port backed by in-memory stores.
pub struct TestApp {
    pub base: String,
    pub state: AppState,
    pub mock: Arc<MockCompletion>,
    pub conversations: Arc<MemoryConversationStore>,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn_with(config: AppConfig, mock: Arc<MockCompletion>) -> TestApp {
    let conversations = Arc::new(MemoryConversationStore::new());
    let backends = Backends {
        counters: Arc::new(MemoryCounterStore::new()),
        conversations: conversations.clone(),
        completion: mock.clone(),
    };
    let state = build_state(&config, backends);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    TestApp {
        base: format!("http://{}", addr),
        state,
        mock,
        conversations,
        client: reqwest::Client::new(),
        handle,
    }
}

pub async fn spawn(limit: u32) -> TestApp {
    spawn_with(config(limit), MockCompletion::answering(MOCK_ANSWER)).await
}

impl TestApp {
    pub fn token(&self, subject: &str, role: Role) -> String {
        let identity = Identity {
            subject_id: subject.to_string(),
            email: format!("{}@example.com", subject),
            role,
        };
        self.state
            .auth
            .sign(&identity, Duration::from_secs(3600))
            .unwrap()
    }

    pub async fn call(
        &self,
        kind: &str,
        name: &str,
        token: Option<&str>,
        args: Value,
    ) -> (u16, Value) {
        let mut req = self
            .client
            .post(format!("{}/{}/{}", self.base, kind, name))
            .json(&args);
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {}", token));
        }
        let resp = req.send().await.unwrap();
        let status = resp.status().as_u16();
        let body = resp.json::<Value>().await.unwrap();
        (status, body)
    }

    pub async fn ask(&self, token: Option<&str>, question: &str) -> (u16, Value) {
        self.call(
            "mutation",
            "askQuestion",
            token,
            serde_json::json!({ "question": question }),
        )
        .await
    }

    pub async fn get_text(&self, path: &str) -> String {
        self.client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
    }
}

pub fn error_message(body: &Value) -> &str {
    body["errors"][0]["message"].as_str().unwrap_or_default()
}

pub fn error_code(body: &Value) -> &str {
    body["errors"][0]["extensions"]["code"]
        .as_str()
        .unwrap_or_default()
}
