// =============================================================================
// Event Bus — single-process topic-keyed publish/subscribe
// =============================================================================
//
// Topics are plain strings (`bar.AAPL`, `alert`, `signal.murphy.AAPL`,
// `scale.progress.<position_id>`, `position.AAPL`).  Delivery is in-order per
// topic and best-effort: each subscriber has a bounded buffer and a slow
// subscriber loses the oldest events.  Publishers never block.
//
// Built on one `tokio::sync::broadcast` channel per topic. A lagged receiver
// surfaces as `RecvError::Lagged(n)`; the subscriber wrapper counts the loss
// and keeps reading.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::classifiers::Signal;
use crate::ledger::PositionEvent;
use crate::scale::ScaleProgress;
use crate::screener::Alert;
use crate::types::Bar;

// =============================================================================
// Events
// =============================================================================

/// A typed event flowing through the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BusEvent {
    Bar(Bar),
    Alert(Alert),
    Signal(Signal),
    ScaleProgress(ScaleProgress),
    Position(PositionEvent),
}

// =============================================================================
// Topic name helpers
// =============================================================================

pub mod topics {
    use crate::types::ClassifierKind;

    pub fn bar(symbol: &str) -> String {
        format!("bar.{symbol}")
    }

    /// Firehose of every sealed bar, regardless of symbol.
    pub fn bar_all() -> String {
        "bar".to_string()
    }

    pub fn alert() -> String {
        "alert".to_string()
    }

    /// Firehose of every scale-progress event.
    pub fn scale_progress_all() -> String {
        "scale.progress".to_string()
    }

    pub fn signal(classifier: ClassifierKind, symbol: &str) -> String {
        format!("signal.{}.{symbol}", classifier.as_str())
    }

    pub fn scale_progress(position_id: &str) -> String {
        format!("scale.progress.{position_id}")
    }

    pub fn position(symbol: &str) -> String {
        format!("position.{symbol}")
    }
}

// =============================================================================
// EventBus
// =============================================================================

struct Topic {
    sender: broadcast::Sender<BusEvent>,
    /// Total events lost across all subscribers of this topic.
    dropped: Arc<AtomicU64>,
}

/// Process-wide event bus. Cheap to share via `Arc`.
pub struct EventBus {
    topics: RwLock<HashMap<String, Topic>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus whose per-subscriber buffers hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Publish an event to a topic. Returns the number of subscribers that
    /// will observe it. Never blocks; a topic with no subscribers discards
    /// the event.
    pub fn publish(&self, topic: &str, event: BusEvent) -> usize {
        // Fast path: topic already exists.
        {
            let topics = self.topics.read();
            if let Some(t) = topics.get(topic) {
                return t.sender.send(event).unwrap_or(0);
            }
        }

        // Create the topic so late subscribers attach to the same channel.
        let mut topics = self.topics.write();
        let t = topics.entry(topic.to_string()).or_insert_with(|| {
            debug!(topic, "event bus topic created");
            let (sender, _) = broadcast::channel(self.capacity);
            Topic {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            }
        });
        t.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to a topic. Creating the subscription also creates the topic
    /// if it does not exist yet.
    pub fn subscribe(&self, topic: &str) -> BusSubscriber {
        let mut topics = self.topics.write();
        let t = topics.entry(topic.to_string()).or_insert_with(|| {
            debug!(topic, "event bus topic created");
            let (sender, _) = broadcast::channel(self.capacity);
            Topic {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            }
        });
        BusSubscriber {
            rx: t.sender.subscribe(),
            dropped: t.dropped.clone(),
        }
    }

    /// Total events lost by slow subscribers of `topic`.
    pub fn dropped(&self, topic: &str) -> u64 {
        self.topics
            .read()
            .get(topic)
            .map(|t| t.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// `(topic, subscriber_count, dropped)` for every live topic.
    pub fn stats(&self) -> Vec<(String, usize, u64)> {
        self.topics
            .read()
            .iter()
            .map(|(name, t)| {
                (
                    name.clone(),
                    t.sender.receiver_count(),
                    t.dropped.load(Ordering::Relaxed),
                )
            })
            .collect()
    }
}

// =============================================================================
// Subscriber
// =============================================================================

/// Receiving half of a topic subscription.
pub struct BusSubscriber {
    rx: broadcast::Receiver<BusEvent>,
    dropped: Arc<AtomicU64>,
}

impl BusSubscriber {
    /// Receive the next event. Lag (overflow of the bounded buffer) is
    /// absorbed: the drop counter is incremented and reading continues from
    /// the oldest retained event. Returns `None` once the topic is closed.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    debug!(lost = n, "slow subscriber dropped oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive for poll-style consumers.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BarSource;

    fn sample_bar(symbol: &str, minute: i64, close: f64) -> Bar {
        Bar {
            symbol: symbol.into(),
            minute_start: minute * 60_000,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            trade_count: 1,
            source: BarSource::Live,
        }
    }

    #[tokio::test]
    async fn publish_subscribe_in_order() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(&topics::bar("AAPL"));

        for i in 0..3 {
            bus.publish(&topics::bar("AAPL"), BusEvent::Bar(sample_bar("AAPL", i, 10.0)));
        }

        for i in 0..3 {
            match sub.recv().await {
                Some(BusEvent::Bar(bar)) => assert_eq!(bar.minute_start, i * 60_000),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::new(16);
        let mut aapl = bus.subscribe(&topics::bar("AAPL"));
        let _tsla = bus.subscribe(&topics::bar("TSLA"));

        bus.publish(&topics::bar("TSLA"), BusEvent::Bar(sample_bar("TSLA", 1, 5.0)));
        assert!(aapl.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe(&topics::bar("BYND"));

        // Overflow the bounded buffer.
        for i in 0..10 {
            bus.publish(&topics::bar("BYND"), BusEvent::Bar(sample_bar("BYND", i, 1.0)));
        }

        // The first received event is not minute 0 — the oldest were dropped.
        let first = sub.recv().await.unwrap();
        match first {
            BusEvent::Bar(bar) => assert!(bar.minute_start > 0),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(bus.dropped(&topics::bar("BYND")) > 0);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        let n = bus.publish(&topics::alert(), BusEvent::Bar(sample_bar("X", 0, 1.0)));
        assert_eq!(n, 0);
    }
}
