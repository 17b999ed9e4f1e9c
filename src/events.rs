//! Event publication for the UI layer.
//!
//! Core logic publishes into a broadcast channel and never depends on a
//! subscriber being present; a UI can subscribe or poll the snapshot
//! accessors on `RemoteManager` instead.

use tokio::sync::broadcast;

use crate::remote::RemoteStatus;
use crate::transfer::{Direction, OpStatus};

#[derive(Debug, Clone)]
pub enum Event {
    RemoteStatusChanged {
        uuid: String,
        status: RemoteStatus,
    },
    RemoteRemoved {
        uuid: String,
    },
    TransferRequested {
        uuid: String,
        timestamp: u64,
        sender_name: String,
        total_size: u64,
    },
    TransferUpdated {
        uuid: String,
        timestamp: u64,
        direction: Direction,
        status: OpStatus,
        bytes_transferred: u64,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. A send error only means nobody is listening.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(Event::RemoteRemoved {
            uuid: "nobody".into(),
        });
    }

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(Event::RemoteStatusChanged {
            uuid: "peer".into(),
            status: RemoteStatus::Connected,
        });
        match rx.recv().await.unwrap() {
            Event::RemoteStatusChanged { uuid, status } => {
                assert_eq!(uuid, "peer");
                assert_eq!(status, RemoteStatus::Connected);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
