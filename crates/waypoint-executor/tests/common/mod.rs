//! Scripted capabilities shared by the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use waypoint_core::config::{Config, LlmConfig};
use waypoint_core::types::TokenUsage;
use waypoint_executor::capability::{
    Capability, CapabilityContext, CapabilityError, CapabilityRegistry,
};
use waypoint_executor::context::RuntimeContext;
use waypoint_executor::llm::LlmClient;
use waypoint_providers::{CompletionRequest, CompletionResponse, Provider, ProviderError};

/// Fails with a missing-module error until `install_dependency` has run.
pub struct NeedsPackage {
    pub name: &'static str,
    pub module: &'static str,
    pub output: Value,
    pub installed: Arc<AtomicBool>,
}

#[async_trait]
impl Capability for NeedsPackage {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Needs a package that is not installed yet"
    }

    async fn invoke(&self, _params: &Value, _ctx: &CapabilityContext) -> Result<Value, CapabilityError> {
        if self.installed.load(Ordering::SeqCst) {
            Ok(self.output.clone())
        } else {
            Err(CapabilityError::failed(format!(
                "Error: Cannot find module '{}'",
                self.module
            )))
        }
    }
}

/// Records the package it was asked to install.
pub struct Installer {
    pub installed: Arc<AtomicBool>,
    pub packages: Arc<std::sync::Mutex<Vec<String>>>,
}

#[async_trait]
impl Capability for Installer {
    fn name(&self) -> &str {
        "install_dependency"
    }

    fn description(&self) -> &str {
        "Pretends to install a package"
    }

    async fn invoke(&self, params: &Value, _ctx: &CapabilityContext) -> Result<Value, CapabilityError> {
        let package = params["package"].as_str().unwrap_or_default().to_string();
        self.packages.lock().unwrap().push(package.clone());
        self.installed.store(true, Ordering::SeqCst);
        Ok(json!({"package": package, "manager": params["manager"]}))
    }
}

/// Sleeps for a fixed time, then returns its params.
pub struct Sleeper {
    pub name: &'static str,
    pub delay: Duration,
    pub calls: Arc<AtomicUsize>,
}

impl Sleeper {
    pub fn new(name: &'static str, delay: Duration) -> Self {
        Self {
            name,
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Capability for Sleeper {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Sleeps, then echoes"
    }

    async fn invoke(&self, params: &Value, _ctx: &CapabilityContext) -> Result<Value, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(params.clone())
    }
}

/// Writes its `path` param, then sleeps past any reasonable deadline.
pub struct SlowWriter;

#[async_trait]
impl Capability for SlowWriter {
    fn name(&self) -> &str {
        "slow_writer"
    }

    fn description(&self) -> &str {
        "Overwrites a file and hangs"
    }

    fn mutates_files(&self) -> bool {
        true
    }

    async fn invoke(&self, params: &Value, _ctx: &CapabilityContext) -> Result<Value, CapabilityError> {
        let path = PathBuf::from(params["path"].as_str().unwrap_or_default());
        std::fs::write(&path, "clobbered").map_err(|e| CapabilityError::failed(e.to_string()))?;
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!({"path": path}))
    }
}

/// Config with small, deterministic limits.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.executor.max_retries = 0;
    config.executor.retry_delay_ms = 10;
    config.streaming.throttle_ms = 0;
    config
}

pub fn runtime(registry: CapabilityRegistry, config: Config) -> Arc<RuntimeContext> {
    RuntimeContext::builder()
        .capabilities(registry)
        .config(config)
        .build()
}

/// Fails with `message` for the first `failures` calls, then echoes.
pub struct Flaky {
    pub message: &'static str,
    pub failures: usize,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Capability for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Fails a few times, then works"
    }

    async fn invoke(&self, params: &Value, _ctx: &CapabilityContext) -> Result<Value, CapabilityError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            Err(CapabilityError::failed(self.message))
        } else {
            Ok(params.clone())
        }
    }
}

/// LLM provider that replies with queued texts.
pub struct ScriptedProvider {
    replies: std::sync::Mutex<std::collections::VecDeque<String>>,
    pub prompts: std::sync::Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies.iter().map(ToString::to_string).collect()),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().unwrap().push(prompt);

        let text = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::Config("no scripted reply left".to_string()))?;
        Ok(CompletionResponse {
            id: "scripted".to_string(),
            model: request.model,
            text,
            stop_reason: None,
            usage: TokenUsage::default(),
        })
    }
}

pub fn llm(provider: Arc<ScriptedProvider>) -> LlmClient {
    LlmClient::new(provider, &LlmConfig::default())
}
