//! Data-change events

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use smol_str::SmolStr;

/// Pseudo-key carried by the [`EventKind::BatchCommitted`] sentinel
pub const BATCH_PSEUDO_KEY: &str = "/batch";

/// Metadata key holding the expiration instant on [`EventKind::TtlExpired`]
pub const EXPIRED_AT_KEY: &str = "expired_at";

/// What happened to a key
///
/// The serde encoding doubles as the script-facing type string
/// (`put | delete | batch | ttl_expired | unknown`); `Unknown` absorbs
/// unrecognized kinds from records written by newer versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EventKind {
    /// A key was written
    #[serde(rename = "put")]
    Put,
    /// A key was removed
    #[serde(rename = "delete")]
    Delete,
    /// A batch finished committing; follows the batch's per-op events
    #[serde(rename = "batch")]
    BatchCommitted,
    /// A key's TTL elapsed and the key was finalized
    #[serde(rename = "ttl_expired")]
    TtlExpired,
    /// Unrecognized kind
    #[serde(other, rename = "unknown")]
    Unknown,
}

impl EventKind {
    /// Script-facing encoding of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Put => "put",
            EventKind::Delete => "delete",
            EventKind::BatchCommitted => "batch",
            EventKind::TtlExpired => "ttl_expired",
            EventKind::Unknown => "unknown",
        }
    }
}

/// A single data-change notification
///
/// Created by a datastore mutation, enqueued onto the bus, fanned out to a
/// snapshot of the current subscribers, then discarded.
#[derive(Debug, Clone)]
pub struct Event {
    /// What happened
    pub kind: EventKind,
    /// The key it happened to (pseudo-key for batch sentinels)
    pub key: SmolStr,
    /// The written value; empty for deletes and batch sentinels
    pub value: Bytes,
    /// When the event was created
    pub timestamp: DateTime<Utc>,
    /// Kind-specific extras, e.g. `expired_at` for TTL expirations
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Event for a successful put
    pub fn put(key: impl Into<SmolStr>, value: Bytes) -> Self {
        Self {
            kind: EventKind::Put,
            key: key.into(),
            value,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Event for a successful delete
    pub fn delete(key: impl Into<SmolStr>) -> Self {
        Self {
            kind: EventKind::Delete,
            key: key.into(),
            value: Bytes::new(),
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Sentinel marking the end of a committed batch
    pub fn batch_committed() -> Self {
        Self {
            kind: EventKind::BatchCommitted,
            key: SmolStr::new_static(BATCH_PSEUDO_KEY),
            value: Bytes::new(),
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Event for a TTL finalization
    ///
    /// `last_value` is best-effort: empty when the value could not be read
    /// back before finalization.
    pub fn ttl_expired(
        key: impl Into<SmolStr>,
        last_value: Bytes,
        expired_at: DateTime<Utc>,
    ) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            EXPIRED_AT_KEY.to_string(),
            serde_json::Value::String(expired_at.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        Self {
            kind: EventKind::TtlExpired,
            key: key.into(),
            value: last_value,
            timestamp: Utc::now(),
            metadata,
        }
    }
}
