//! In-process pub/sub for run lifecycle [`Event`]s.
//!
//! Delivery is best-effort and at-most-once: a slow subscriber that falls
//! behind the broadcast channel's capacity silently misses the oldest
//! events rather than stalling publishers. Ordering is preserved per
//! publisher (a single `tokio::sync::broadcast::Sender` serializes every
//! `publish` call), not globally across concurrent publishers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::models::Event;

const DEFAULT_CAPACITY: usize = 1024;

/// A handle a subscriber uses to pull events, with throttling support for
/// dashboard-style consumers that only want an occasional snapshot.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Await the next event, or `None` once every sender has dropped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, dropping oldest events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Broadcast-backed event bus. Cheap to clone: the inner sender is an
/// `Arc`-like handle already.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish one event. Never blocks and never fails even with zero
    /// subscribers attached.
    pub fn publish(&self, event: Event) {
        trace!(event_type = ?event.event_type, "publishing event");
        // A send error just means no one is listening right now.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription { rx: self.tx.subscribe() }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives a subscriber's handler in a dedicated task, isolating one
/// subscriber's panic/error from the bus and from every other subscriber.
/// `throttle` limits how often `handler` is invoked for non-terminal
/// events (dashboard-style aggregators); pass `Duration::ZERO` for
/// unthrottled delivery.
pub struct EventDrain {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl EventDrain {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn a drain task for `subscription`. `handler` runs for every
    /// event that survives throttling; it must not panic across an await
    /// point that would poison shared state, but a panic inside the
    /// spawned task is isolated to that task by tokio itself.
    pub fn spawn<F>(&self, mut subscription: Subscription, throttle: Duration, mut handler: F)
    where
        F: FnMut(Event) + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let mut last_emit: Option<Instant> = None;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("event drain task received cancellation signal");
                        break;
                    }
                    event = subscription.recv() => {
                        let Some(event) = event else {
                            debug!("event bus closed, draining task exiting");
                            break;
                        };
                        let forced = matches!(
                            event.event_type,
                            crate::models::EventType::RunDone | crate::models::EventType::ErrorOccurred
                        );
                        let throttled = !forced
                            && throttle > Duration::ZERO
                            && last_emit.is_some_and(|t| t.elapsed() < throttle);
                        if throttled {
                            continue;
                        }
                        last_emit = Some(Instant::now());
                        handler(event);
                    }
                }
            }
        });
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for EventDrain {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle combining a bus with its drain lifecycle, the shape most
/// call sites actually want to hold onto.
#[derive(Clone)]
pub struct EventBusHandle {
    pub bus: EventBus,
    drain: Arc<EventDrain>,
}

impl EventBusHandle {
    pub fn new() -> Self {
        Self {
            bus: EventBus::new(),
            drain: Arc::new(EventDrain::new()),
        }
    }

    pub fn spawn_subscriber<F>(&self, throttle: Duration, handler: F)
    where
        F: FnMut(Event) + Send + 'static,
    {
        self.drain.spawn(self.bus.subscribe(), throttle, handler);
    }

    pub async fn shutdown(&self) {
        self.drain.shutdown().await;
    }
}

impl Default for EventBusHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn sample(event_type: EventType) -> Event {
        Event::new(event_type, serde_json::json!({}), Uuid::nil())
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(sample(EventType::RunStart));
        bus.publish(sample(EventType::RunDone));

        assert_eq!(sub.recv().await.unwrap().event_type, EventType::RunStart);
        assert_eq!(sub.recv().await.unwrap().event_type, EventType::RunDone);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(sample(EventType::RunStart));
    }

    #[tokio::test]
    async fn drain_task_isolates_handler_and_honors_cancellation() {
        let bus = EventBus::new();
        let drain = EventDrain::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        drain.spawn(bus.subscribe(), Duration::ZERO, move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(sample(EventType::DiscoverStart));
        bus.publish(sample(EventType::DiscoverDone));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        drain.shutdown().await;
    }

    #[tokio::test]
    async fn throttle_drops_non_terminal_events_but_keeps_forced_ones() {
        let bus = EventBus::new();
        let drain = EventDrain::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        drain.spawn(bus.subscribe(), Duration::from_secs(60), move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(sample(EventType::FetchProgress));
        bus.publish(sample(EventType::FetchProgress));
        bus.publish(sample(EventType::RunDone));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // First progress event passes (nothing emitted yet), the second is
        // throttled, RunDone always forces through.
        assert_eq!(count.load(Ordering::SeqCst), 2);
        drain.shutdown().await;
    }
}
