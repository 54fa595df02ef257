//! Scripted subscriptions: external evaluator seam, persisted records,
//! and the subscriber bridging events into script invocations

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use smol_str::SmolStr;
use tokio_util::sync::CancellationToken;

use crate::error::{DatastoreError, Result};
use crate::event::{Event, EventKind};
use crate::subscriber::Subscriber;

/// Reserved namespace holding subscription records
pub const SUBSCRIPTIONS_PREFIX: &str = "/_system/ds-subscriptions/";

/// Default per-event execution timeout in milliseconds
pub const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 5_000;

/// Storage key for a subscription record
pub fn subscription_key(id: &str) -> String {
    format!("{}{}", SUBSCRIPTIONS_PREFIX, id)
}

/// External script evaluator contract
///
/// The platform never inspects language internals: it hands over source,
/// structured bindings and a cancellation handle, and takes back a value or
/// an error. Implementations are expected to sandbox execution and route
/// side effects through capabilities they provide themselves.
#[async_trait::async_trait]
pub trait ScriptEvaluator: Send + Sync {
    /// Run `source` with the given bindings
    async fn evaluate(
        &self,
        source: &str,
        bindings: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value>;
}

/// Persisted definition of a scripted subscription
///
/// Stored as canonical JSON under [`SUBSCRIPTIONS_PREFIX`] and rehydrated at
/// startup, replacing any live subscriber with the same id.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SubscriptionRecord {
    /// Subscriber id
    pub id: SmolStr,
    /// Script source handed to the evaluator per event
    pub script: String,
    /// Per-event timeout in milliseconds
    pub execution_timeout: u64,
    /// Whether the evaluator may grant the script network access
    pub enable_networking: bool,
    /// Whether the evaluator may grant the script logging access
    pub enable_logging: bool,
    /// Kinds this subscription wants; empty means all
    pub event_filters: Vec<EventKind>,
    /// Whether the evaluator should run the script in strict mode
    pub strict_mode: bool,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    /// Record with defaults for everything but id and script
    pub fn new(id: impl Into<SmolStr>, script: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: script.into(),
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT_MS,
            enable_networking: false,
            enable_logging: false,
            event_filters: Vec::new(),
            strict_mode: false,
            created_at: Utc::now(),
        }
    }

    /// Canonical JSON bytes for persistence
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(DatastoreError::serialization)
    }

    /// Decode a persisted record
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(DatastoreError::serialization)
    }
}

/// Subscriber that delegates events to an external script evaluator
///
/// Each invocation runs under the record's per-event timeout with
/// cancellation propagated to the evaluator. Failures and timeouts are
/// logged by the dispatcher; the subscriber is never removed for them.
pub struct ScriptedSubscriber {
    record: SubscriptionRecord,
    evaluator: Arc<dyn ScriptEvaluator>,
}

impl ScriptedSubscriber {
    /// Bridge a record to an evaluator
    pub fn new(record: SubscriptionRecord, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        Self { record, evaluator }
    }

    /// The subscription definition this subscriber runs
    pub fn record(&self) -> &SubscriptionRecord {
        &self.record
    }

    fn bindings(&self, event: &Event) -> serde_json::Value {
        serde_json::json!({
            "type": event.kind.as_str(),
            "key": event.key.as_str(),
            "value": String::from_utf8_lossy(&event.value),
            "timestamp": event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            "metadata": serde_json::Value::Object(event.metadata.clone()),
        })
    }
}

#[async_trait::async_trait]
impl Subscriber for ScriptedSubscriber {
    fn id(&self) -> &str {
        &self.record.id
    }

    async fn on_event(&self, event: &Event) -> Result<()> {
        if !self.record.event_filters.is_empty()
            && !self.record.event_filters.contains(&event.kind)
        {
            return Ok(());
        }

        let bindings = self.bindings(event);
        let cancel = CancellationToken::new();
        let timeout = Duration::from_millis(self.record.execution_timeout.max(1));

        let outcome = tokio::time::timeout(
            timeout,
            self.evaluator
                .evaluate(&self.record.script, bindings, cancel.clone()),
        )
        .await;

        match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(DatastoreError::subscriber(&self.record.id, e.to_string())),
            Err(_) => {
                cancel.cancel();
                tracing::warn!(
                    subscriber = %self.record.id,
                    timeout_ms = self.record.execution_timeout,
                    "script evaluation timed out, cancelled"
                );
                Err(DatastoreError::timeout("script evaluation"))
            }
        }
    }
}
