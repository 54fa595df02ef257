//! TTL monitor: discovers and finalizes expired keys

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::config::TtlConfig;
use crate::engine::{Engine, ExpirationStatus};
use crate::error::Result;
use crate::event::Event;

/// Reserved namespace holding TTL tracking records
///
/// Each put-with-TTL records the expiration instant under
/// `/_system/ds-ttls/<original-key>` with an RFC 3339 body, so sweeps scan a
/// bounded subset of the keyspace instead of the whole store.
pub const TTL_PREFIX: &str = "/_system/ds-ttls/";

/// Storage key for a TTL tracking record
pub fn tracking_key(key: &str) -> String {
    format!("{}{}", TTL_PREFIX, key)
}

/// Periodic scanner finalizing expired keys
///
/// Tracking records and data keys are removed through the engine directly:
/// finalization is system-internal work, so no `Delete` event precedes the
/// `TTLExpired` it emits.
pub struct TtlMonitor {
    engine: Engine,
    bus: Arc<EventBus>,
    silent: Arc<AtomicBool>,
    config: Arc<RwLock<TtlConfig>>,
    done: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TtlMonitor {
    /// Create a monitor; does not start the periodic loop
    pub fn new(
        engine: Engine,
        bus: Arc<EventBus>,
        silent: Arc<AtomicBool>,
        config: TtlConfig,
    ) -> Self {
        Self {
            engine,
            bus,
            silent,
            config: Arc::new(RwLock::new(config)),
            done: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Whether TTL tracking is enabled
    pub fn enabled(&self) -> bool {
        self.config.read().enabled
    }

    /// Current monitor settings
    pub fn config(&self) -> TtlConfig {
        self.config.read().clone()
    }

    /// Replace the monitor settings; takes effect on the next tick
    pub fn set_config(&self, config: TtlConfig) {
        *self.config.write() = config;
    }

    /// Start the periodic loop (no-op when disabled or already running)
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&self) {
        if !self.enabled() {
            return;
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let engine = self.engine.clone();
        let bus = self.bus.clone();
        let silent = self.silent.clone();
        let config = self.config.clone();
        let done = self.done.child_token();

        *worker = Some(tokio::spawn(async move {
            loop {
                let interval = config.read().check_interval;
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !config.read().enabled {
                    continue;
                }
                let budget = config.read().buffer_size;
                match sweep(&engine, &bus, &silent, budget) {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(finalized = n, "ttl sweep finalized keys"),
                    Err(e) => tracing::warn!(error = %e, "ttl sweep failed"),
                }
            }
            tracing::debug!("ttl monitor stopped");
        }));
    }

    /// Run one synchronous sweep regardless of the periodic timer
    ///
    /// Returns the number of keys finalized.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let budget = self.config.read().buffer_size;
        sweep(&self.engine, &self.bus, &self.silent, budget)
    }

    /// Signal the loop to stop and wait for it
    ///
    /// Idempotent: later calls are no-ops.
    pub async fn stop(&self) {
        self.done.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "ttl worker failed during shutdown");
            }
        }
    }
}

/// One pass over the tracking index
///
/// Per tracked key, the engine's native expiration decides the outcome:
/// already reaped → drop the stale tracking record; expired → finalize and
/// emit `TTLExpired`; otherwise leave untouched. At most `budget` keys are
/// finalized per pass; the rest wait for the next tick.
fn sweep(
    engine: &Engine,
    bus: &EventBus,
    silent: &AtomicBool,
    budget: usize,
) -> Result<usize> {
    let now = Utc::now();
    let mut finalized = 0usize;

    for entry in engine.scan_data(TTL_PREFIX) {
        if finalized >= budget {
            break;
        }
        let entry = entry?;
        let Some(original) = entry.key.as_str().strip_prefix(TTL_PREFIX) else {
            continue;
        };

        match engine.expiration(original)? {
            ExpirationStatus::Missing | ExpirationStatus::Unset => {
                // The key was reaped or rewritten without a TTL; the
                // tracking record is stale.
                engine.data_remove(entry.key.as_str())?;
            }
            ExpirationStatus::At(at) if now >= at => {
                let last_value = engine
                    .data_get_ignoring_expiry(original)
                    .unwrap_or(None)
                    .unwrap_or_else(Bytes::new);
                engine.data_remove(original)?;
                engine.data_remove(entry.key.as_str())?;
                if !silent.load(Ordering::Relaxed) {
                    bus.publish(Event::ttl_expired(original, last_value, at));
                }
                finalized += 1;
            }
            ExpirationStatus::At(_) => {}
        }
    }

    Ok(finalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MIN_QUEUE_SIZE;
    use chrono::Duration as ChronoDuration;

    fn fixture() -> (Engine, Arc<EventBus>, Arc<AtomicBool>) {
        (
            Engine::open_temporary().unwrap(),
            Arc::new(EventBus::start(MIN_QUEUE_SIZE)),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn track(engine: &Engine, key: &str, at: chrono::DateTime<Utc>) {
        engine
            .data_insert(&tracking_key(key), at.to_rfc3339().as_bytes(), None)
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_finalizes_expired() {
        let (engine, bus, silent) = fixture();
        let mut rx = bus.subscribe_channel("probe", 16);

        let past = Utc::now() - ChronoDuration::milliseconds(50);
        engine.data_insert("/k", b"v", Some(past)).unwrap();
        track(&engine, "/k", past);

        let n = sweep(&engine, &bus, &silent, 1024).unwrap();
        assert_eq!(n, 1);

        // Data key and tracking record are both gone.
        assert!(engine.data_get_ignoring_expiry("/k").unwrap().is_none());
        assert!(engine.data_get_ignoring_expiry(&tracking_key("/k")).unwrap().is_none());

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, crate::event::EventKind::TtlExpired);
        assert_eq!(ev.key.as_str(), "/k");
        assert_eq!(ev.value.as_ref(), b"v");
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_drops_stale_tracking() {
        let (engine, bus, silent) = fixture();
        // Tracked key that no longer exists.
        track(&engine, "/gone", Utc::now());
        // Tracked key rewritten without a TTL.
        engine.data_insert("/plain", b"v", None).unwrap();
        track(&engine, "/plain", Utc::now());

        let n = sweep(&engine, &bus, &silent, 1024).unwrap();
        assert_eq!(n, 0);
        assert!(engine.data_get(&tracking_key("/gone")).unwrap().is_none());
        assert!(engine.data_get(&tracking_key("/plain")).unwrap().is_none());
        // The untracked plain key itself survives.
        assert!(engine.data_contains("/plain").unwrap());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_leaves_live_keys() {
        let (engine, bus, silent) = fixture();
        let future = Utc::now() + ChronoDuration::hours(1);
        engine.data_insert("/live", b"v", Some(future)).unwrap();
        track(&engine, "/live", future);

        let n = sweep(&engine, &bus, &silent, 1024).unwrap();
        assert_eq!(n, 0);
        assert!(engine.data_contains("/live").unwrap());
        assert!(engine.data_contains(&tracking_key("/live")).unwrap());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_silent_mode_suppresses_emission() {
        let (engine, bus, silent) = fixture();
        let mut rx = bus.subscribe_channel("probe", 16);
        silent.store(true, Ordering::Relaxed);

        let past = Utc::now() - ChronoDuration::milliseconds(50);
        engine.data_insert("/k", b"v", Some(past)).unwrap();
        track(&engine, "/k", past);

        assert_eq!(sweep(&engine, &bus, &silent, 1024).unwrap(), 1);
        bus.shutdown().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_budget_bounds_one_pass() {
        let (engine, bus, silent) = fixture();
        let past = Utc::now() - ChronoDuration::milliseconds(50);
        for i in 0..5 {
            let key = format!("/k/{}", i);
            engine.data_insert(&key, b"v", Some(past)).unwrap();
            track(&engine, &key, past);
        }

        assert_eq!(sweep(&engine, &bus, &silent, 2).unwrap(), 2);
        assert_eq!(sweep(&engine, &bus, &silent, 1024).unwrap(), 3);
        bus.shutdown().await;
    }
}
