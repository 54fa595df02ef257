//! Subscriber capability interface and built-in variants

use bytes::Bytes;
use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::event::Event;

/// A named consumer of data-change events
///
/// Concrete variants are [`FunctionSubscriber`], [`ChannelSubscriber`] and
/// the scripted subscriber in [`crate::script`]. Each callback runs on its
/// own short-lived task; a panic is caught and logged by the dispatcher and
/// never stops delivery to other subscribers.
#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
    /// Stable identifier; re-registering an id replaces the prior subscriber
    fn id(&self) -> &str;

    /// Handle one event
    ///
    /// Errors are logged by the dispatcher, never propagated to producers.
    async fn on_event(&self, event: &Event) -> Result<()>;
}

/// Subscriber wrapping a plain callback
pub struct FunctionSubscriber {
    id: SmolStr,
    handler: Box<dyn Fn(&Event) + Send + Sync>,
}

impl FunctionSubscriber {
    /// Wrap `handler` under the given id
    pub fn new(id: impl Into<SmolStr>, handler: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        Self {
            id: id.into(),
            handler: Box::new(handler),
        }
    }
}

#[async_trait::async_trait]
impl Subscriber for FunctionSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    async fn on_event(&self, event: &Event) -> Result<()> {
        (self.handler)(event);
        Ok(())
    }
}

/// Subscriber forwarding events into a bounded channel
///
/// Uses the same drop-on-full policy as the bus queue: a full buffer drops
/// the event with a log line rather than blocking dispatch. Dropping the
/// subscriber (e.g. on replacement or shutdown) closes the receiver.
pub struct ChannelSubscriber {
    id: SmolStr,
    tx: mpsc::Sender<Event>,
}

impl ChannelSubscriber {
    /// Create a subscriber/receiver pair with the given buffer size
    pub fn new(id: impl Into<SmolStr>, buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        (Self { id: id.into(), tx }, rx)
    }
}

#[async_trait::async_trait]
impl Subscriber for ChannelSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    async fn on_event(&self, event: &Event) -> Result<()> {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    subscriber = %self.id,
                    key = %event.key,
                    "channel buffer full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = %self.id, "receiver dropped, ignoring event");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_function_subscriber_runs_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let sub = FunctionSubscriber::new("fn", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        sub.on_event(&Event::put("/k", Bytes::new())).await.unwrap();
        sub.on_event(&Event::delete("/k")).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_channel_subscriber_drops_on_full() {
        let (sub, mut rx) = ChannelSubscriber::new("ch", 1);
        sub.on_event(&Event::put("/1", Bytes::new())).await.unwrap();
        // Buffer full: second event is dropped, not an error.
        sub.on_event(&Event::put("/2", Bytes::new())).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().key.as_str(), "/1");
        drop(sub);
        assert!(rx.recv().await.is_none());
    }
}
