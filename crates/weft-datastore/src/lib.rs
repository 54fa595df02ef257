//! Durable event-emitting keyspace for the weft data platform
//!
//! This crate provides the datastore half of the platform:
//!
//! - **Datastore**: sled-backed sorted keyspace with prefix queries, TTL,
//!   batching and silent-mode event suppression
//! - **EventBus**: bounded async queue with snapshot fan-out to named
//!   subscribers, panic-isolated per subscriber
//! - **TTLMonitor**: periodic scan of tracked TTL keys that finalizes
//!   expirations and emits `TTLExpired`
//! - **TransformEngine**: prefix-scoped batched read-modify-write via path
//!   extract, structural patches or an external filter expression
//! - **ScriptedSubscriber**: bridges events to an external script evaluator
//!   with per-event timeouts and persisted subscription records
//! - **EngineBlockStore**: a durable `weft_repo::BlockStore` sharing the
//!   keyspace, so the verifiable collection layer runs over the same file
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_datastore::{Datastore, DatastoreConfig};
//!
//! # async fn example() -> weft_datastore::Result<()> {
//! let ds = Datastore::open("./data", DatastoreConfig::new())?;
//! let mut events = ds.subscribe_channel("probe", 64);
//!
//! ds.put("/users/alice", &b"{\"name\":\"alice\"}"[..]).await?;
//! let ev = events.recv().await.unwrap();
//! assert_eq!(ev.key.as_str(), "/users/alice");
//!
//! ds.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

/// Engine-backed block storage
pub mod blocks;
/// Bounded event queue with fan-out dispatch
pub mod bus;
/// Datastore configuration
pub mod config;
/// The datastore facade and batches
pub mod datastore;
/// Embedded ordered KV engine
pub mod engine;
pub mod error;
/// Data-change events
pub mod event;
/// Scripted subscriptions
pub mod script;
/// Subscriber capability interface
pub mod subscriber;
/// Value transformation pipeline
pub mod transform;
/// TTL monitoring
pub mod ttl;

pub use blocks::EngineBlockStore;
pub use bus::EventBus;
pub use config::{DatastoreConfig, TtlConfig};
pub use datastore::{Batch, Datastore, IterEntry};
pub use error::{DatastoreError, DatastoreErrorKind, Result};
pub use event::{Event, EventKind};
pub use script::{ScriptEvaluator, ScriptedSubscriber, SubscriptionRecord};
pub use subscriber::{ChannelSubscriber, FunctionSubscriber, Subscriber};
pub use transform::{
    CompiledExpression, ExpressionFilter, PatchOp, TransformOptions, TransformReport,
    Transformation,
};
pub use ttl::TtlMonitor;
