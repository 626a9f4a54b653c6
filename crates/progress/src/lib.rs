//! In-process progress events and the bus carrying them.
//!
//! Every stage of planning, execution, and aggregation publishes
//! well-typed events which any UI, log sink, or test harness may consume
//! as a stream. Delivery is at-least-once within the process; a slow
//! subscriber lags and loses the oldest events rather than stalling the
//! publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

mod event;
pub use event::EventKind;

/// One progress record: the closed event variant plus the fields every
/// record carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Renders this event as one line-delimited JSON record.
    pub fn to_json_line(&self) -> String {
        // Serialization of a closed enum over JSON-native fields cannot
        // fail; fall back to an empty object rather than panicking.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Default bus capacity. Events beyond this, unread by a lagging
/// subscriber, are dropped oldest-first.
const DEFAULT_CAPACITY: usize = 1024;

/// ProgressBus is a bounded publish-subscribe channel for [`Event`]s.
///
/// Publishing never blocks and never waits on subscribers. Cloning the bus
/// shares the underlying channel and session.
#[derive(Debug, Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<Event>,
    session_id: Uuid,
    dropped: Arc<AtomicU64>,
}

impl ProgressBus {
    pub fn new(session_id: Uuid) -> Self {
        Self::with_capacity(session_id, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(session_id: Uuid, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            session_id,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Total events lost to lagging subscribers, across all subscribers.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Publishes an event, stamping the session id and a timestamp.
    /// Publishing with no subscribers is a no-op.
    pub fn publish(&self, kind: EventKind) {
        let event = Event {
            timestamp: Utc::now(),
            session_id: self.session_id,
            kind,
        };
        tracing::trace!(event = %event.to_json_line(), "progress event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            dropped: self.dropped.clone(),
        }
    }
}

/// A subscription to the bus. Receiving skips over dropped events,
/// recording how many were lost.
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// The next event, or `None` once the bus is closed and drained.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    tracing::warn!(dropped = n, "slow progress subscriber dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drains whatever is currently buffered without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(_) => return events,
            }
        }
    }
}

/// Convenience constructors for the operation lifecycle events the
/// executor publishes.
impl EventKind {
    pub fn operation_failed(
        operation_id: impl Into<String>,
        error: impl Into<String>,
        error_kind: impl Into<String>,
    ) -> EventKind {
        EventKind::OperationFailed {
            operation_id: operation_id.into(),
            error: error.into(),
            error_kind: error_kind.into(),
        }
    }

    pub fn operation_completed(
        operation_id: impl Into<String>,
        rows: usize,
        execution_time: f64,
    ) -> EventKind {
        EventKind::OperationCompleted {
            operation_id: operation_id.into(),
            rows,
            execution_time,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bus() -> ProgressBus {
        ProgressBus::with_capacity(Uuid::nil(), 4)
    }

    #[tokio::test]
    async fn events_reach_subscribers_in_order() {
        let bus = bus();
        let mut sub = bus.subscribe();
        bus.publish(EventKind::Classifying {
            message: "determining relevant backends".to_string(),
        });
        bus.publish(EventKind::Complete { success: true });

        let first = sub.next().await.unwrap();
        assert_eq!(first.session_id, Uuid::nil());
        assert!(matches!(first.kind, EventKind::Classifying { .. }));
        let second = sub.next().await.unwrap();
        assert!(matches!(second.kind, EventKind::Complete { success: true }));
    }

    #[tokio::test]
    async fn slow_subscribers_drop_oldest() {
        let bus = bus();
        let mut sub = bus.subscribe();
        for i in 0..10 {
            bus.publish(EventKind::BatchSnapshot {
                pending: 10 - i,
                active: 0,
                completed: i,
                failed: 0,
            });
        }
        // Capacity is 4: the oldest six events are gone, the rest arrive.
        let events = sub.drain();
        assert_eq!(events.len(), 4);
        assert_eq!(bus.dropped_events(), 6);
        match &events[0].kind {
            EventKind::BatchSnapshot { completed, .. } => assert_eq!(*completed, 6),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_noop() {
        let bus = bus();
        bus.publish(EventKind::Complete { success: false });
        assert_eq!(bus.dropped_events(), 0);
    }

    #[test]
    fn event_json_lines_are_tagged() {
        let event = Event {
            timestamp: "2024-05-01T00:00:00Z".parse().unwrap(),
            session_id: Uuid::nil(),
            kind: EventKind::OperationStarted {
                operation_id: "op1".to_string(),
                source_id: Some("postgres_main".to_string()),
                attempt: 1,
            },
        };
        let line = event.to_json_line();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["type"], "operation_started");
        assert_eq!(parsed["operation_id"], "op1");
        assert!(parsed["timestamp"]
            .as_str()
            .unwrap()
            .starts_with("2024-05-01T00:00:00"));

        let round: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(round, event);
    }
}
