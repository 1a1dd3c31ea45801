//! Broadcast bus for run events
//!
//! Output lines can outpace a slow subscriber. A lagging [`Subscriber`]
//! skips what it missed and keeps a count instead of failing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

use crate::types::{Event, EventEnvelope};

const DEFAULT_CAPACITY: usize = 4096;

/// Cloneable handle; all clones publish to the same subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    published: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` is how many events a subscriber may fall behind before it
    /// starts missing them.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns how many subscribers will see the envelope.
    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.sender.send(envelope).unwrap_or(0)
    }

    pub fn emit(&self, event: Event) -> usize {
        self.publish(EventEnvelope::new(event))
    }

    /// Only events published after this call are received.
    pub fn subscribe(&self) -> Subscriber {
        Subscriber {
            receiver: self.sender.subscribe(),
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.published_count())
            .finish()
    }
}

pub struct Subscriber {
    receiver: broadcast::Receiver<EventEnvelope>,
    missed: u64,
}

impl Subscriber {
    /// Next event, or `None` once every bus handle is dropped.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(RecvError::Lagged(n)) => self.skip(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(TryRecvError::Lagged(n)) => self.skip(n),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Events dropped because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn skip(&mut self, n: u64) {
        warn!(missed = n, "Event subscriber fell behind, skipping events");
        self.missed += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opexec_core::StreamTag;
    use uuid::Uuid;

    fn output_line(run_id: Uuid, line: &str) -> Event {
        Event::OutputLine {
            run_id,
            stream: StreamTag::Stdout,
            line: line.to_string(),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let run_id = Uuid::new_v4();

        bus.emit(Event::RunStarted {
            run_id,
            operation: "train".to_string(),
            pid: Some(42),
            args: vec!["python3".to_string()],
        });
        bus.emit(output_line(run_id, "epoch 1"));
        bus.emit(Event::RunStopped {
            run_id,
            exit_code: 0,
        });

        assert!(matches!(sub.recv().await.unwrap().event, Event::RunStarted { .. }));
        match sub.recv().await.unwrap().event {
            Event::OutputLine { line, .. } => assert_eq!(line, "epoch 1"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            sub.recv().await.unwrap().event,
            Event::RunStopped { exit_code: 0, .. }
        ));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_lagging_subscriber_skips() {
        let bus = EventBus::with_capacity(2);
        let mut sub = bus.subscribe();
        let run_id = Uuid::new_v4();

        for i in 0..5 {
            bus.emit(output_line(run_id, &format!("line {}", i)));
        }

        match sub.try_recv().unwrap().event {
            Event::OutputLine { line, .. } => assert_eq!(line, "line 3"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(sub.missed(), 3);
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_bus_ends_subscription() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.emit(output_line(Uuid::new_v4(), "last"));
        drop(bus);

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        let clone = bus.clone();
        assert_eq!(clone.emit(output_line(Uuid::new_v4(), "dropped")), 0);
        assert_eq!(bus.published_count(), 1);

        let _sub = clone.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
