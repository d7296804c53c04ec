//! In-memory broadcast substrate shared by peers and the registry.
//!
//! A [`Bus`] bundles everything a peer talks to besides its own database:
//!
//! - the registry port, an `mpsc` channel of [`RegistryMessage`]
//! - the `clients` topic, carrying the current peer count
//! - the `go` topic, carrying the [`EndTime`] of a run
//! - the [`LockManager`] holding liveness sessions
//!
//! Every peer is handed a clone at construction, so tests can build a whole
//! deployment in one process.

use std::time::Duration;

use contend_core::{ContendError, EndTime, PeerId, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::lock::LockManager;

/// Topic capacity. Receivers that fall further behind see `Lagged`.
const TOPIC_CAPACITY: usize = 64;

/// Messages accepted by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryMessage {
    /// A peer holding the liveness lock `name` joined.
    Register { name: PeerId },
    /// Start a run lasting `duration` from the moment the registry handles it.
    Go { duration: Duration },
}

/// Receiving end of the registry port.
pub type RegistryPort = mpsc::UnboundedReceiver<RegistryMessage>;

/// Publishing side of the topics, shared with the registry task.
#[derive(Clone)]
pub(crate) struct Topics {
    pub(crate) clients: broadcast::Sender<usize>,
    pub(crate) go: broadcast::Sender<EndTime>,
    pub(crate) locks: LockManager,
}

impl Topics {
    pub(crate) fn publish_clients(&self, count: usize) {
        // No subscribers is fine: nobody is displaying the count.
        let _ = self.clients.send(count);
        trace!(count, "Published client count");
    }

    pub(crate) fn publish_go(&self, end: EndTime) {
        let _ = self.go.send(end);
    }
}

/// Handle to the registry port, topics and lock manager.
#[derive(Clone)]
pub struct Bus {
    registry: mpsc::UnboundedSender<RegistryMessage>,
    topics: Topics,
}

impl Bus {
    /// Create a bus and the port the registry reads from.
    pub fn new() -> (Self, RegistryPort) {
        Self::with_locks(LockManager::new())
    }

    /// Create a bus on top of an existing lock table.
    pub fn with_locks(locks: LockManager) -> (Self, RegistryPort) {
        let (registry, port) = mpsc::unbounded_channel();
        let (clients, _) = broadcast::channel(TOPIC_CAPACITY);
        let (go, _) = broadcast::channel(TOPIC_CAPACITY);
        let bus = Self {
            registry,
            topics: Topics { clients, go, locks },
        };
        (bus, port)
    }

    pub fn send(&self, message: RegistryMessage) -> Result<()> {
        self.registry
            .send(message)
            .map_err(|_| ContendError::ChannelClosed("registry port".into()))
    }

    pub fn register(&self, name: PeerId) -> Result<()> {
        self.send(RegistryMessage::Register { name })
    }

    pub fn request_go(&self, duration: Duration) -> Result<()> {
        self.send(RegistryMessage::Go { duration })
    }

    pub fn subscribe_clients(&self) -> broadcast::Receiver<usize> {
        self.topics.clients.subscribe()
    }

    pub fn subscribe_go(&self) -> broadcast::Receiver<EndTime> {
        self.topics.go.subscribe()
    }

    pub fn locks(&self) -> &LockManager {
        &self.topics.locks
    }

    pub(crate) fn topics(&self) -> Topics {
        self.topics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_delivers_in_order() {
        let (bus, mut port) = Bus::new();
        let id = PeerId::from("tab");
        bus.register(id.clone()).unwrap();
        bus.request_go(Duration::from_secs(1)).unwrap();

        assert_eq!(port.recv().await, Some(RegistryMessage::Register { name: id }));
        assert_eq!(
            port.recv().await,
            Some(RegistryMessage::Go {
                duration: Duration::from_secs(1)
            })
        );
    }

    #[tokio::test]
    async fn test_closed_port_is_channel_error() {
        let (bus, port) = Bus::new();
        drop(port);
        let err = bus.request_go(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ContendError::ChannelClosed(_)));
    }

    #[tokio::test]
    async fn test_go_reaches_every_subscriber() {
        let (bus, _port) = Bus::new();
        let mut a = bus.subscribe_go();
        let mut b = bus.clone().subscribe_go();
        let end = EndTime::from_millis(42);
        bus.topics().publish_go(end);

        assert_eq!(a.recv().await.unwrap(), end);
        assert_eq!(b.recv().await.unwrap(), end);
    }
}
