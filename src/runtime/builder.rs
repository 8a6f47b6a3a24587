use std::sync::Arc;

use crate::breaker::CircuitBreakerConfig;
use crate::config::PipelineConfig;
use crate::error::ErrorClassifier;
use crate::executor::ResilientExecutor;
use crate::retry::RetryPolicyTable;

use super::pipeline::{EventHandler, EventPipeline};

/// Builder for constructing an [`EventPipeline`] with explicit dependencies.
///
/// Only the handler is required; retry policies, error classification, and
/// breaker thresholds fall back to their defaults.
///
/// # Example
///
/// ```ignore
/// use skua::*;
///
/// let pipeline = EventPipelineBuilder::new(PipelineConfig::default())
///     .with_handler(handler)
///     .with_policies(policies)
///     .build()?;
/// pipeline.start().await;
/// ```
pub struct EventPipelineBuilder {
    config: PipelineConfig,
    handler: Option<Arc<dyn EventHandler>>,
    policies: RetryPolicyTable,
    classifier: ErrorClassifier,
    breaker_config: CircuitBreakerConfig,
}

impl std::fmt::Debug for EventPipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPipelineBuilder")
            .field("config", &self.config)
            .field("handler_set", &self.handler.is_some())
            .field("breaker_config", &self.breaker_config)
            .finish_non_exhaustive()
    }
}

impl EventPipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            handler: None,
            policies: RetryPolicyTable::default(),
            classifier: ErrorClassifier::default(),
            breaker_config: CircuitBreakerConfig::default(),
        }
    }

    /// Set the job handler.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Override the per-class retry policy table.
    pub fn with_policies(mut self, policies: RetryPolicyTable) -> Self {
        self.policies = policies;
        self
    }

    /// Override the error classifier used by the executor and the inline
    /// fast path.
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Override the circuit breaker thresholds shared by all classes.
    pub fn with_breaker_config(mut self, breaker_config: CircuitBreakerConfig) -> Self {
        self.breaker_config = breaker_config;
        self
    }

    /// Build the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler is missing or the configuration is
    /// inconsistent.
    pub fn build(self) -> anyhow::Result<EventPipeline> {
        let handler = self
            .handler
            .ok_or_else(|| anyhow::anyhow!("handler dependency missing"))?;
        if self.config.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1");
        }
        if self.config.rate_limit.max_dispatches == 0 {
            anyhow::bail!("rate_limit.max_dispatches must be at least 1");
        }
        if self.config.batch.max_size == 0 {
            anyhow::bail!("batch.max_size must be at least 1");
        }

        let executor = Arc::new(ResilientExecutor::new(
            self.policies,
            self.classifier.clone(),
            self.breaker_config,
        ));
        Ok(EventPipeline::from_parts(
            self.config,
            handler,
            executor,
            self.classifier,
        ))
    }
}
