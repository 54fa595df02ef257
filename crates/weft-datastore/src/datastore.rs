//! Durable sorted keyspace with events, TTL and batching

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::blocks::EngineBlockStore;
use crate::bus::EventBus;
use crate::config::{DatastoreConfig, TtlConfig};
use crate::engine::{DataBatch, DataScan, Engine, ExpirationStatus};
use crate::error::{DatastoreError, Result};
use crate::event::Event;
use crate::script::{
    ScriptEvaluator, ScriptedSubscriber, SubscriptionRecord, SUBSCRIPTIONS_PREFIX,
    subscription_key,
};
use crate::subscriber::Subscriber;
use crate::transform::{
    ExpressionFilter, TransformEngine, TransformOptions, TransformReport, Transformation,
};
use crate::ttl::{TtlMonitor, tracking_key};

/// Buffer size for iterate/query channels
const ITER_BUFFER: usize = 64;

/// One entry yielded by [`Datastore::iterate`]
#[derive(Debug, Clone)]
pub struct IterEntry {
    /// Logical key
    pub key: SmolStr,
    /// Value bytes; `None` in keys-only mode
    pub value: Option<Bytes>,
}

struct Inner {
    engine: Engine,
    bus: Arc<EventBus>,
    ttl: TtlMonitor,
    silent: Arc<AtomicBool>,
    closed: AtomicBool,
    evaluator: Option<Arc<dyn ScriptEvaluator>>,
    expression_filter: Option<Arc<dyn ExpressionFilter>>,
}

/// Durable key-value datastore with value-level event notification
///
/// Owns the KV engine, the event bus, the TTL monitor and the subscriber
/// table. Cloning shares the same store. `close` is the authoritative
/// shutdown; double-close is a no-op.
#[derive(Clone)]
pub struct Datastore {
    inner: Arc<Inner>,
}

impl Datastore {
    /// Open (or create) a datastore at `path`
    ///
    /// Must be called within a tokio runtime: the dispatcher and TTL monitor
    /// spawn onto it. Persisted scripted subscriptions are rehydrated here.
    pub fn open(path: impl AsRef<Path>, config: DatastoreConfig) -> Result<Self> {
        Self::from_engine(Engine::open(path)?, config)
    }

    /// Open a datastore backed by temporary storage, reclaimed on drop
    pub fn open_temporary(config: DatastoreConfig) -> Result<Self> {
        Self::from_engine(Engine::open_temporary()?, config)
    }

    fn from_engine(engine: Engine, config: DatastoreConfig) -> Result<Self> {
        let bus = Arc::new(EventBus::start(config.event_queue_size));
        let silent = Arc::new(AtomicBool::new(false));
        let ttl = TtlMonitor::new(engine.clone(), bus.clone(), silent.clone(), config.ttl);

        let ds = Self {
            inner: Arc::new(Inner {
                engine,
                bus,
                ttl,
                silent,
                closed: AtomicBool::new(false),
                evaluator: config.evaluator,
                expression_filter: config.expression_filter,
            }),
        };

        ds.inner.ttl.start();
        ds.rehydrate_subscriptions()?;
        Ok(ds)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DatastoreError::closed());
        }
        Ok(())
    }

    fn emit(&self, event: Event) {
        if !self.inner.silent.load(Ordering::Relaxed) {
            self.inner.bus.publish(event);
        }
    }

    // ------------------------------------------------------------------
    // Core KV surface
    // ------------------------------------------------------------------

    /// Write a key
    ///
    /// Emits `Put` unless silent mode is on. Overwriting a TTL key clears
    /// its expiration.
    pub async fn put(&self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;
        let value = value.into();
        self.inner.engine.data_insert(key, &value, None)?;
        self.emit(Event::put(key, value));
        Ok(())
    }

    /// Write a key that expires after `ttl`
    ///
    /// Registers the key in the TTL tracking index when monitoring is
    /// enabled; the tracking record itself is a system-internal write and
    /// emits nothing.
    pub async fn put_with_ttl(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        ttl: Duration,
    ) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;
        let expires_at = expiry_instant(ttl)?;
        let value = value.into();
        self.inner.engine.data_insert(key, &value, Some(expires_at))?;
        if self.inner.ttl.enabled() {
            self.inner.engine.data_insert(
                &tracking_key(key),
                expires_at.to_rfc3339().as_bytes(),
                None,
            )?;
        }
        self.emit(Event::put(key, value));
        Ok(())
    }

    /// Remove a key and any TTL tracking record for it
    ///
    /// Emits `Delete` unless silent mode is on.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;
        self.inner.engine.data_remove(key)?;
        self.inner.engine.data_remove(&tracking_key(key))?;
        self.emit(Event::delete(key));
        Ok(())
    }

    /// Whether a key is present and unexpired
    pub async fn has(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        self.inner.engine.data_contains(key)
    }

    /// Read a key
    ///
    /// Absence is a `NotFound` error, distinguishable from backend failures.
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        self.ensure_open()?;
        self.inner
            .engine
            .data_get(key)?
            .ok_or_else(|| DatastoreError::not_found(key))
    }

    /// Give an existing key an expiration `ttl` from now
    pub async fn set_ttl(&self, key: &str, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let value = self
            .inner
            .engine
            .data_get(key)?
            .ok_or_else(|| DatastoreError::not_found(key))?;
        let expires_at = expiry_instant(ttl)?;
        self.inner.engine.data_insert(key, &value, Some(expires_at))?;
        if self.inner.ttl.enabled() {
            self.inner.engine.data_insert(
                &tracking_key(key),
                expires_at.to_rfc3339().as_bytes(),
                None,
            )?;
        }
        Ok(())
    }

    /// Expiration instant of a key (`None` when it carries no TTL)
    pub async fn get_expiration(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        self.ensure_open()?;
        match self.inner.engine.expiration(key)? {
            ExpirationStatus::Missing => Err(DatastoreError::not_found(key)),
            ExpirationStatus::Unset => Ok(None),
            ExpirationStatus::At(at) => Ok(Some(at)),
        }
    }

    /// Start an atomic batch of writes
    pub fn batch(&self) -> Batch {
        Batch {
            datastore: self.clone(),
            inner: DataBatch::new(),
            ops: Vec::new(),
        }
    }

    /// Stream entries under a prefix
    ///
    /// The producer stops within one buffered send of the receiver being
    /// dropped. Keys-only mode omits value bytes.
    pub fn iterate(
        &self,
        prefix: &str,
        keys_only: bool,
    ) -> Result<mpsc::Receiver<Result<IterEntry>>> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(ITER_BUFFER);
        let engine = self.inner.engine.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            for item in engine.scan_data(&prefix) {
                let out = item.map(|entry| IterEntry {
                    key: entry.key,
                    value: (!keys_only).then_some(entry.value),
                });
                let stop = out.is_err();
                if tx.blocking_send(out).is_err() {
                    // Receiver dropped: close the backing query.
                    break;
                }
                if stop {
                    break;
                }
            }
        });

        Ok(rx)
    }

    /// Stream keys under a prefix (keys-only shorthand for [`iterate`])
    ///
    /// [`iterate`]: Datastore::iterate
    pub fn query(&self, prefix: &str) -> Result<mpsc::Receiver<SmolStr>> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(ITER_BUFFER);
        let engine = self.inner.engine.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            for item in engine.scan_data(&prefix) {
                match item {
                    Ok(entry) => {
                        if tx.blocking_send(entry.key).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "query scan failed");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Batched delete of all keys
    pub async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        let keys: Vec<SmolStr> = self
            .inner
            .engine
            .scan_data("")
            .map(|item| item.map(|e| e.key))
            .collect::<Result<_>>()?;

        for chunk in keys.chunks(crate::transform::DEFAULT_BATCH_SIZE) {
            let mut batch = self.batch();
            for key in chunk {
                batch.delete(key);
            }
            batch.commit().await?;
        }
        Ok(())
    }

    /// Batched copy of another datastore's full contents into this one
    ///
    /// Expirations survive the copy; events fire through the normal batch
    /// path.
    pub async fn merge(&self, other: &Datastore) -> Result<()> {
        self.ensure_open()?;
        other.ensure_open()?;

        let mut batch = self.batch();
        let mut pending = 0usize;
        for item in other.inner.engine.scan_data("") {
            let entry = item?;
            batch.put_with_expiry(entry.key.as_str(), entry.value, entry.expires_at)?;
            pending += 1;
            if pending >= crate::transform::DEFAULT_BATCH_SIZE {
                batch.commit().await?;
                batch = self.batch();
                pending = 0;
            }
        }
        if pending > 0 {
            batch.commit().await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Events and subscribers
    // ------------------------------------------------------------------

    /// Suppress (or restore) event emission
    ///
    /// A mode flag, not a key-space filter: while on, nothing emits, and
    /// user writes under `/_system/…` emit like any other key while off.
    pub fn set_silent_mode(&self, silent: bool) {
        self.inner.silent.store(silent, Ordering::Relaxed);
    }

    /// Whether silent mode is on
    pub fn silent_mode(&self) -> bool {
        self.inner.silent.load(Ordering::Relaxed)
    }

    /// Register a subscriber, replacing any prior one with the same id
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.inner.bus.subscribe(subscriber);
    }

    /// Remove a subscriber; reports whether it existed
    pub fn unsubscribe(&self, id: &str) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    /// Register a plain callback under `id`
    pub fn subscribe_function(
        &self,
        id: impl Into<SmolStr>,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) {
        self.inner.bus.subscribe_function(id, handler);
    }

    /// Register a bounded channel under `id` and return its receiver
    pub fn subscribe_channel(
        &self,
        id: impl Into<SmolStr>,
        buffer_size: usize,
    ) -> mpsc::Receiver<Event> {
        self.inner.bus.subscribe_channel(id, buffer_size)
    }

    /// Ids of the currently registered subscribers
    pub fn subscriber_ids(&self) -> Vec<SmolStr> {
        self.inner.bus.subscriber_ids()
    }

    /// Persist a scripted subscription and register its subscriber
    ///
    /// The record is written as canonical JSON under the reserved
    /// subscriptions namespace and survives restarts.
    pub fn subscribe_script(&self, record: SubscriptionRecord) -> Result<()> {
        self.ensure_open()?;
        let evaluator = self
            .inner
            .evaluator
            .clone()
            .ok_or_else(|| {
                DatastoreError::invalid_input(
                    "scripted subscriptions require an evaluator in the config",
                )
            })?;

        let json = record.to_canonical_json()?;
        self.inner
            .engine
            .data_insert(&subscription_key(&record.id), &json, None)?;
        self.inner
            .bus
            .subscribe(Arc::new(ScriptedSubscriber::new(record, evaluator)));
        Ok(())
    }

    /// Drop a scripted subscription and its persisted record
    pub fn unsubscribe_script(&self, id: &str) -> Result<bool> {
        self.ensure_open()?;
        self.inner.engine.data_remove(&subscription_key(id))?;
        Ok(self.inner.bus.unsubscribe(id))
    }

    /// Rebuild scripted subscribers from persisted records
    fn rehydrate_subscriptions(&self) -> Result<()> {
        let Some(evaluator) = self.inner.evaluator.clone() else {
            let mut scan = self.inner.engine.scan_data(SUBSCRIPTIONS_PREFIX);
            if scan.next().is_some() {
                tracing::warn!(
                    "persisted subscriptions present but no evaluator configured; skipping"
                );
            }
            return Ok(());
        };

        for item in self.inner.engine.scan_data(SUBSCRIPTIONS_PREFIX) {
            let entry = item?;
            match SubscriptionRecord::from_json(&entry.value) {
                Ok(record) => {
                    tracing::debug!(subscriber = %record.id, "rehydrated subscription");
                    self.inner
                        .bus
                        .subscribe(Arc::new(ScriptedSubscriber::new(record, evaluator.clone())));
                }
                Err(e) => {
                    tracing::warn!(key = %entry.key, error = %e, "skipping corrupt subscription record");
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // TTL and transforms
    // ------------------------------------------------------------------

    /// One synchronous TTL sweep regardless of the periodic timer
    pub fn cleanup_expired(&self) -> Result<usize> {
        self.ensure_open()?;
        self.inner.ttl.cleanup_expired()
    }

    /// Current TTL monitor settings
    pub fn ttl_config(&self) -> TtlConfig {
        self.inner.ttl.config()
    }

    /// Replace the TTL monitor settings; takes effect on the next tick
    pub fn set_ttl_config(&self, config: TtlConfig) {
        self.inner.ttl.set_config(config);
    }

    /// Apply a transformation to every entry under `prefix`
    pub async fn transform(
        &self,
        prefix: &str,
        transformation: &Transformation,
        options: &TransformOptions,
    ) -> Result<TransformReport> {
        self.ensure_open()?;
        TransformEngine::new(self).run(prefix, transformation, options).await
    }

    pub(crate) fn scan(&self, prefix: &str) -> Result<DataScan> {
        self.ensure_open()?;
        Ok(self.inner.engine.scan_data(prefix))
    }

    pub(crate) fn expression_filter(&self) -> Option<Arc<dyn ExpressionFilter>> {
        self.inner.expression_filter.clone()
    }

    // ------------------------------------------------------------------
    // Blocks and shutdown
    // ------------------------------------------------------------------

    /// Durable block storage sharing this datastore's keyspace
    ///
    /// Hand this to `weft_repo::Mst` / `weft_repo::CollectionIndex` to run
    /// the verifiable layer over the same file.
    pub fn blockstore(&self) -> EngineBlockStore {
        EngineBlockStore::new(self.inner.engine.clone())
    }

    /// Authoritative shutdown
    ///
    /// Stops the TTL monitor, stops the dispatcher and waits for in-flight
    /// dispatches, closes channel subscribers, flushes the engine.
    /// Double-close is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.ttl.stop().await;
        self.inner.bus.shutdown().await;
        self.inner.engine.flush()?;
        Ok(())
    }
}

/// Accumulates puts and deletes for one atomic commit
///
/// On commit, one `Put`/`Delete` event fires per accumulated op in enqueue
/// order, then one `BatchCommitted` sentinel, unless silent. Ordering across
/// concurrent batches is not guaranteed; within one batch it is.
pub struct Batch {
    datastore: Datastore,
    inner: DataBatch,
    ops: Vec<BatchOp>,
}

enum BatchOp {
    Put { key: SmolStr, value: Bytes },
    Delete { key: SmolStr },
}

impl Batch {
    /// Queue a write
    pub fn put(&mut self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        self.put_with_expiry(key, value, None)
    }

    /// Queue a write carrying an expiration instant
    pub(crate) fn put_with_expiry(
        &mut self,
        key: &str,
        value: impl Into<Bytes>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        validate_key(key)?;
        let value = value.into();
        self.inner.insert(key, &value, expires_at)?;
        self.ops.push(BatchOp::Put {
            key: SmolStr::new(key),
            value,
        });
        Ok(())
    }

    /// Queue a removal
    pub fn delete(&mut self, key: &str) {
        self.inner.remove(key);
        self.ops.push(BatchOp::Delete {
            key: SmolStr::new(key),
        });
    }

    /// Number of queued ops
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply all queued ops atomically, then emit their events
    pub async fn commit(self) -> Result<()> {
        self.datastore.ensure_open()?;
        self.datastore.inner.engine.apply_data_batch(self.inner)?;

        if self.datastore.silent_mode() {
            return Ok(());
        }
        for op in self.ops {
            match op {
                BatchOp::Put { key, value } => {
                    self.datastore.inner.bus.publish(Event::put(key, value));
                }
                BatchOp::Delete { key } => {
                    self.datastore.inner.bus.publish(Event::delete(key));
                }
            }
        }
        self.datastore.inner.bus.publish(Event::batch_committed());
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(DatastoreError::invalid_input("key must be non-empty"));
    }
    Ok(())
}

fn expiry_instant(ttl: Duration) -> Result<DateTime<Utc>> {
    let delta = chrono::Duration::from_std(ttl)
        .map_err(|e| DatastoreError::invalid_input(format!("ttl out of range: {}", e)))?;
    Ok(Utc::now() + delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatastoreConfig;

    fn store() -> Datastore {
        Datastore::open_temporary(DatastoreConfig::new()).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let ds = store();
        ds.put("/k", Bytes::from_static(b"v")).await.unwrap();
        assert!(ds.has("/k").await.unwrap());
        assert_eq!(ds.get("/k").await.unwrap().as_ref(), b"v");

        ds.delete("/k").await.unwrap();
        let err = ds.get("/k").await.unwrap_err();
        assert!(err.is_not_found());
        ds.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_expiration_states() {
        let ds = store();
        ds.put("/plain", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(ds.get_expiration("/plain").await.unwrap(), None);

        ds.put_with_ttl("/ttl", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(ds.get_expiration("/ttl").await.unwrap().is_some());

        assert!(ds.get_expiration("/none").await.unwrap_err().is_not_found());
        ds.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_put_with_ttl_registers_tracking() {
        let ds = store();
        ds.put_with_ttl("/k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(ds.has(&tracking_key("/k")).await.unwrap());

        ds.delete("/k").await.unwrap();
        assert!(!ds.has(&tracking_key("/k")).await.unwrap());
        ds.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_iterate_stops_when_receiver_drops() {
        let ds = store();
        for i in 0..500u32 {
            ds.put(&format!("/k/{:04}", i), Bytes::from_static(b"v"))
                .await
                .unwrap();
        }

        let mut rx = ds.iterate("/k/", true).unwrap();
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.key.as_str(), "/k/0000");
        assert_eq!(first.value, None);
        drop(rx);
        // Producer unblocks and exits on its next send.
        ds.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_yields_keys_in_order() {
        let ds = store();
        ds.put("/b", Bytes::new()).await.unwrap();
        ds.put("/a", Bytes::new()).await.unwrap();

        let mut rx = ds.query("/").unwrap();
        let mut keys = Vec::new();
        while let Some(k) = rx.recv().await {
            keys.push(k.to_string());
        }
        assert_eq!(keys, vec!["/a", "/b"]);
        ds.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_and_merge() {
        let a = store();
        let b = store();
        a.put("/x", Bytes::from_static(b"1")).await.unwrap();
        a.put_with_ttl("/y", Bytes::from_static(b"2"), Duration::from_secs(60))
            .await
            .unwrap();

        b.merge(&a).await.unwrap();
        assert_eq!(b.get("/x").await.unwrap().as_ref(), b"1");
        // The expiration survived the copy.
        assert!(b.get_expiration("/y").await.unwrap().is_some());

        a.clear().await.unwrap();
        assert!(!a.has("/x").await.unwrap());
        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_close_is_noop() {
        let ds = store();
        ds.close().await.unwrap();
        ds.close().await.unwrap();
        assert!(ds.put("/k", Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_blockstore_shares_keyspace() {
        let ds = store();
        let blocks = ds.blockstore();
        let index = weft_repo::CollectionIndex::new(Arc::new(blocks));
        index.create_collection("users").await.unwrap();
        assert!(index.global_root().is_some());
        ds.close().await.unwrap();
    }
}
