//! Bounded event queue with fan-out dispatch

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::event::Event;
use crate::subscriber::{ChannelSubscriber, FunctionSubscriber, Subscriber};

/// Minimum queue depth; configured sizes below this are raised to it
pub const MIN_QUEUE_SIZE: usize = 1024;

type SubscriberTable = Arc<RwLock<HashMap<SmolStr, Arc<dyn Subscriber>>>>;

/// Bounded async queue plus fan-out to named subscribers
///
/// Producers enqueue without blocking; a single dispatcher task drains the
/// queue and fans each event out to a snapshot of the subscriber table, one
/// short-lived task per subscriber so a panicking subscriber stays isolated
/// and slow subscribers of the same event run side by side.
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    subscribers: SubscriberTable,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Start the bus and its dispatcher task
    ///
    /// Must be called within a tokio runtime.
    pub fn start(queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(MIN_QUEUE_SIZE));
        let subscribers: SubscriberTable = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(dispatch_loop(rx, subscribers.clone(), shutdown.clone()));

        Self {
            tx,
            subscribers,
            shutdown,
            dispatcher: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue an event for dispatch
    ///
    /// A full queue drops the event: dropping is logged but never blocks the
    /// producer.
    pub fn publish(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                tracing::warn!(kind = ?ev.kind, key = %ev.key, "event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("event bus stopped, discarding event");
            }
        }
    }

    /// Register a subscriber, replacing any prior one with the same id
    ///
    /// Replacing a channel subscriber drops its sender, closing the old
    /// receiver.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        let id = SmolStr::new(subscriber.id());
        let prior = self.subscribers.write().insert(id.clone(), subscriber);
        if prior.is_some() {
            tracing::debug!(subscriber = %id, "replaced existing subscriber");
        }
    }

    /// Remove a subscriber; reports whether it existed
    pub fn unsubscribe(&self, id: &str) -> bool {
        self.subscribers.write().remove(id).is_some()
    }

    /// Register a plain callback under `id`
    pub fn subscribe_function(
        &self,
        id: impl Into<SmolStr>,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) {
        self.subscribe(Arc::new(FunctionSubscriber::new(id.into(), handler)));
    }

    /// Register a bounded channel under `id` and return its receiver
    pub fn subscribe_channel(
        &self,
        id: impl Into<SmolStr>,
        buffer_size: usize,
    ) -> mpsc::Receiver<Event> {
        let (sub, rx) = ChannelSubscriber::new(id.into(), buffer_size);
        self.subscribe(Arc::new(sub));
        rx
    }

    /// Ids of the currently registered subscribers
    pub fn subscriber_ids(&self) -> Vec<SmolStr> {
        self.subscribers.read().keys().cloned().collect()
    }

    /// Stop the dispatcher, wait for in-flight dispatches, drop subscribers
    ///
    /// Idempotent: later calls are no-ops.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "dispatcher task failed during shutdown");
            }
        }
        // Dropping the table closes every channel subscriber's receiver.
        self.subscribers.write().clear();
    }
}

/// Dispatcher: drain the queue one event at a time
///
/// Subscribers of one event run concurrently, each on its own task, but the
/// next event is not taken until every callback for the current one has
/// finished. That keeps per-subscriber delivery in dispatch order while a
/// panicking or erroring subscriber stays isolated from the rest.
async fn dispatch_loop(
    mut rx: mpsc::Receiver<Event>,
    subscribers: SubscriberTable,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                dispatch_one(&subscribers, event).await;
            }
        }
    }
    tracing::debug!("event dispatcher stopped");
}

async fn dispatch_one(subscribers: &SubscriberTable, event: Event) {
    // Snapshot under the read lock; dispatch happens outside it.
    let snapshot: Vec<Arc<dyn Subscriber>> = subscribers.read().values().cloned().collect();

    let event = Arc::new(event);
    let mut callbacks: JoinSet<()> = JoinSet::new();
    for subscriber in snapshot {
        let event = event.clone();
        callbacks.spawn(async move {
            if let Err(e) = subscriber.on_event(&event).await {
                tracing::warn!(
                    subscriber = %subscriber.id(),
                    error = %e,
                    "subscriber returned error"
                );
            }
        });
    }

    while let Some(result) = callbacks.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                tracing::error!(error = %e, "subscriber panicked; continuing dispatch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn settle() {
        // Give the dispatcher a few polls to drain.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = EventBus::start(MIN_QUEUE_SIZE);
        let mut rx_a = bus.subscribe_channel("a", 16);
        let mut rx_b = bus.subscribe_channel("b", 16);

        bus.publish(Event::put("/k", Bytes::from_static(b"v")));
        settle().await;

        assert_eq!(rx_a.recv().await.unwrap().key.as_str(), "/k");
        assert_eq!(rx_b.recv().await.unwrap().key.as_str(), "/k");
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_replacement_closes_prior_channel() {
        let bus = EventBus::start(MIN_QUEUE_SIZE);
        let mut old_rx = bus.subscribe_channel("dup", 16);
        let mut new_rx = bus.subscribe_channel("dup", 16);

        bus.publish(Event::put("/k", Bytes::new()));
        settle().await;

        // Old receiver closes without the event; the replacement sees it.
        assert!(old_rx.recv().await.is_none());
        assert_eq!(new_rx.recv().await.unwrap().key.as_str(), "/k");
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_subscriber_does_not_stop_others() {
        let bus = EventBus::start(MIN_QUEUE_SIZE);
        let delivered = Arc::new(AtomicUsize::new(0));
        let counted = delivered.clone();

        bus.subscribe_function("panicker", |_| panic!("boom"));
        bus.subscribe_function("counter", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Event::put("/1", Bytes::new()));
        bus.publish(Event::put("/2", Bytes::new()));
        settle().await;

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::start(MIN_QUEUE_SIZE);
        let mut rx = bus.subscribe_channel("gone", 16);

        assert!(bus.unsubscribe("gone"));
        assert!(!bus.unsubscribe("gone"));
        bus.publish(Event::put("/k", Bytes::new()));
        settle().await;

        assert!(rx.recv().await.is_none());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_channels_and_is_idempotent() {
        let bus = EventBus::start(MIN_QUEUE_SIZE);
        let mut rx = bus.subscribe_channel("ch", 16);

        bus.shutdown().await;
        bus.shutdown().await;
        assert!(rx.recv().await.is_none());
    }
}
