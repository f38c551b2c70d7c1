//! Runtime context shared by every component of one runtime.
//!
//! Built once and injected at construction; nothing in this crate is global.

use std::sync::Arc;

use waypoint_core::config::Config;
use waypoint_core::history::{HistoryEvent, HistoryKind, HistorySink};
use waypoint_core::types::TaskId;

use crate::capability::CapabilityRegistry;
use crate::checkpoint::ContractRegistry;
use crate::executor::snapshot::PathLocks;
use crate::executor::validators::ValidatorRegistry;
use crate::llm::LlmClient;

/// Collaborators and settings of one runtime.
pub struct RuntimeContext {
    capabilities: Arc<CapabilityRegistry>,
    contracts: ContractRegistry,
    validators: ValidatorRegistry,
    llm: Option<LlmClient>,
    history: Option<Arc<dyn HistorySink>>,
    path_locks: Arc<PathLocks>,
    config: Config,
}

impl RuntimeContext {
    /// Start building a context.
    #[must_use]
    pub fn builder() -> RuntimeContextBuilder {
        RuntimeContextBuilder::default()
    }

    /// Capability registry.
    #[must_use]
    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    /// Capability contracts for checkpoint validation.
    #[must_use]
    pub const fn contracts(&self) -> &ContractRegistry {
        &self.contracts
    }

    /// Structural result validators.
    #[must_use]
    pub const fn validators(&self) -> &ValidatorRegistry {
        &self.validators
    }

    /// LLM client, if configured.
    #[must_use]
    pub const fn llm(&self) -> Option<&LlmClient> {
        self.llm.as_ref()
    }

    /// Path lock table for snapshots.
    #[must_use]
    pub fn path_locks(&self) -> &PathLocks {
        &self.path_locks
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Append a history event. Failures are logged and swallowed.
    pub fn record(&self, task_id: &TaskId, kind: HistoryKind, payload: serde_json::Value) {
        let Some(sink) = &self.history else {
            return;
        };
        let event = HistoryEvent::new(task_id.clone(), kind, payload);
        if let Err(e) = sink.append(&event) {
            tracing::warn!(task_id = %task_id, kind = kind.as_str(), error = %e, "Failed to record history");
        }
    }
}

/// Builder for [`RuntimeContext`].
#[derive(Default)]
pub struct RuntimeContextBuilder {
    capabilities: Option<Arc<CapabilityRegistry>>,
    contracts: Option<ContractRegistry>,
    validators: Option<ValidatorRegistry>,
    llm: Option<LlmClient>,
    history: Option<Arc<dyn HistorySink>>,
    config: Option<Config>,
}

impl RuntimeContextBuilder {
    /// Use a capability registry (default: built-ins).
    #[must_use]
    pub fn capabilities(mut self, registry: CapabilityRegistry) -> Self {
        self.capabilities = Some(Arc::new(registry));
        self
    }

    /// Use a contract registry (default: built-in contracts).
    #[must_use]
    pub fn contracts(mut self, contracts: ContractRegistry) -> Self {
        self.contracts = Some(contracts);
        self
    }

    /// Use a validator registry (default: built-in validators).
    #[must_use]
    pub fn validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = Some(validators);
        self
    }

    /// Attach an LLM client.
    #[must_use]
    pub fn llm(mut self, llm: LlmClient) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Attach a history sink.
    #[must_use]
    pub fn history(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.history = Some(sink);
        self
    }

    /// Use a configuration (default: `Config::default()`).
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the context.
    #[must_use]
    pub fn build(self) -> Arc<RuntimeContext> {
        Arc::new(RuntimeContext {
            capabilities: self
                .capabilities
                .unwrap_or_else(|| Arc::new(CapabilityRegistry::with_builtins())),
            contracts: self.contracts.unwrap_or_else(ContractRegistry::with_defaults),
            validators: self.validators.unwrap_or_else(ValidatorRegistry::with_defaults),
            llm: self.llm,
            history: self.history,
            path_locks: Arc::new(PathLocks::new()),
            config: self.config.unwrap_or_default(),
        })
    }
}
