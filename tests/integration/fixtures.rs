//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted execution provider
//! - Building a coordinator around it
//! - Predefined requests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mesh::agent::AgentRegistry;
use mesh::orchestration::TurnLimits;
use mesh::provider::{ExecutionProvider, ProviderRequest, ProviderResponse};
use mesh::session::{MemoryStore, SessionStore};
use mesh::{Error, MeshConfig, MeshCoordinator, Result};

pub const LOGIN_FORM: &str = "Create a login form";
pub const ECOMMERCE: &str =
    "Build a complete e-commerce web application with frontend, backend, and database";

/// How the scripted provider answers a prompt.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    /// Report `success: false` with this message.
    Fail(String),
    /// Return an `Err` from `execute`.
    Error(String),
}

/// Provider that answers from a script instead of spawning a process.
pub struct MockProvider {
    /// (prompt substring, behaviour); first match wins.
    rules: Vec<(String, Script)>,
    tokens_per_call: u64,
    delay: Duration,
    requests: Mutex<Vec<ProviderRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            tokens_per_call: 100,
            delay: Duration::from_millis(5),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_rule(mut self, prompt_contains: &str, script: Script) -> Self {
        self.rules.push((prompt_contains.to_string(), script));
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_per_call = tokens;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Highest number of overlapping `execute` calls seen.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn script_for(&self, prompt: &str) -> Script {
        self.rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, script)| script.clone())
            .unwrap_or(Script::Succeed)
    }
}

#[async_trait]
impl ExecutionProvider for MockProvider {
    async fn execute(&self, request: ProviderRequest) -> Result<ProviderResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.script_for(&request.prompt) {
            Script::Succeed => Ok(ProviderResponse::success(
                &format!("{} done: {}", request.agent, request.prompt),
                self.tokens_per_call,
            )),
            Script::Fail(message) => Ok(ProviderResponse {
                tokens_used: self.tokens_per_call,
                ..ProviderResponse::failure(&message)
            }),
            Script::Error(message) => Err(Error::Provider(message)),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// A coordinator wired to a `MockProvider` and an in-memory store.
pub struct MeshHarness {
    pub coordinator: MeshCoordinator,
    pub provider: Arc<MockProvider>,
    pub store: Arc<MemoryStore>,
}

pub struct HarnessBuilder {
    config: MeshConfig,
    provider: MockProvider,
}

impl HarnessBuilder {
    pub fn provider(mut self, provider: MockProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn turn_limits(mut self, limits: TurnLimits) -> Self {
        self.config.turns.limits = limits;
        self
    }

    pub fn parallel_threshold(mut self, percent: f64) -> Self {
        self.config.coordinator.parallel_threshold_percent = percent;
        self
    }

    pub fn build(self) -> MeshHarness {
        let provider = Arc::new(self.provider);
        let store = Arc::new(MemoryStore::new());
        let coordinator = MeshCoordinator::new(
            &self.config,
            AgentRegistry::with_defaults(),
            provider.clone(),
            store.clone() as Arc<dyn SessionStore>,
        );
        MeshHarness {
            coordinator,
            provider,
            store,
        }
    }
}

impl MeshHarness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: MeshConfig::default(),
            provider: MockProvider::new(),
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }
}

/// Turn limits that only constrain the number of turns.
pub fn turn_only_limits(max_turns: u32) -> TurnLimits {
    TurnLimits {
        max_turns,
        ..TurnLimits::default()
    }
}
