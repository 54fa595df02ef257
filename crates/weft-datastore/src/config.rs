//! Datastore configuration

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::MIN_QUEUE_SIZE;
use crate::script::ScriptEvaluator;
use crate::transform::ExpressionFilter;

/// TTL monitor settings
#[derive(Debug, Clone)]
pub struct TtlConfig {
    /// Whether the periodic monitor runs and TTL keys are tracked
    pub enabled: bool,
    /// Time between sweeps
    pub check_interval: Duration,
    /// Maximum finalizations emitted per sweep; remaining tracked keys are
    /// picked up on the next tick
    pub buffer_size: usize,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(30),
            buffer_size: 1024,
        }
    }
}

/// Top-level datastore settings
#[derive(Clone, Default)]
pub struct DatastoreConfig {
    /// Event queue depth; raised to the bus minimum if below it
    pub event_queue_size: usize,
    /// TTL monitor settings
    pub ttl: TtlConfig,
    /// External script evaluator for scripted subscriptions
    ///
    /// Without one, persisted subscriptions are not rehydrated at startup
    /// and `subscribe_script` fails.
    pub evaluator: Option<Arc<dyn ScriptEvaluator>>,
    /// External expression engine for filter-expression transforms
    pub expression_filter: Option<Arc<dyn ExpressionFilter>>,
}

impl DatastoreConfig {
    /// Configuration with all defaults
    pub fn new() -> Self {
        Self {
            event_queue_size: MIN_QUEUE_SIZE,
            ..Default::default()
        }
    }

    /// Attach a script evaluator
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Attach an expression engine
    pub fn with_expression_filter(mut self, filter: Arc<dyn ExpressionFilter>) -> Self {
        self.expression_filter = Some(filter);
        self
    }

    /// Override the TTL monitor settings
    pub fn with_ttl(mut self, ttl: TtlConfig) -> Self {
        self.ttl = ttl;
        self
    }
}

impl fmt::Debug for DatastoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatastoreConfig")
            .field("event_queue_size", &self.event_queue_size)
            .field("ttl", &self.ttl)
            .field("evaluator", &self.evaluator.as_ref().map(|_| "…"))
            .field("expression_filter", &self.expression_filter.as_ref().map(|_| "…"))
            .finish()
    }
}
