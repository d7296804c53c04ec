//! Peer registry.
//!
//! Tracks which peers are connected and turns start requests into one shared
//! deadline:
//!
//! - `Register { name }` records the peer, publishes the new count on the
//!   `clients` topic, then watches the peer's liveness lock. The watcher only
//!   gets the lock once the peer's session closes, at which point the peer is
//!   forgotten and the count is published again.
//! - `Go { duration }` publishes `EndTime = now + duration` on the `go` topic.
//!
//! # Example
//!
//! ```no_run
//! use contend_peer::Registry;
//! use std::time::Duration;
//!
//! # async fn example() -> contend_core::Result<()> {
//! let (bus, registry) = Registry::in_memory();
//! let mut go = bus.subscribe_go();
//! bus.request_go(Duration::from_secs(10))?;
//! let end = go.recv().await.expect("registry running");
//! println!("run ends at {end}, {} peers", registry.count().await);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use contend_core::{EndTime, PeerId};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Bus, RegistryMessage, RegistryPort, Topics};

#[derive(Debug, Default)]
struct RegistryState {
    peers: BTreeSet<PeerId>,
}

/// Counts connected peers and broadcasts run deadlines.
pub struct Registry {
    state: Arc<RwLock<RegistryState>>,
    task: JoinHandle<()>,
}

impl Registry {
    /// Start a registry reading `port` and publishing on `bus`'s topics.
    pub fn spawn(bus: &Bus, port: RegistryPort) -> Self {
        let state = Arc::new(RwLock::new(RegistryState::default()));
        let task = tokio::spawn(serve(Arc::clone(&state), bus.topics(), port));
        Self { state, task }
    }

    /// A fresh bus with a registry already serving it.
    pub fn in_memory() -> (Bus, Self) {
        let (bus, port) = Bus::new();
        let registry = Self::spawn(&bus, port);
        (bus, registry)
    }

    /// Registered peers that are still holding their liveness lock.
    pub async fn peers(&self) -> Vec<PeerId> {
        self.state.read().await.peers.iter().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.peers.len()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(state: Arc<RwLock<RegistryState>>, topics: Topics, mut port: RegistryPort) {
    while let Some(message) = port.recv().await {
        match message {
            RegistryMessage::Register { name } => {
                let (inserted, count) = {
                    let mut state = state.write().await;
                    let inserted = state.peers.insert(name.clone());
                    (inserted, state.peers.len())
                };
                if !inserted {
                    // One watcher per peer.
                    warn!(peer = %name, "Peer registered twice");
                    continue;
                }
                info!(peer = %name, count, "Peer registered");
                topics.publish_clients(count);
                tokio::spawn(watch(Arc::clone(&state), topics.clone(), name));
            }
            RegistryMessage::Go { duration } => {
                let end = EndTime::after(duration);
                info!(end_time = %end, duration_ms = duration.as_millis() as u64, "Broadcasting go");
                topics.publish_go(end);
            }
        }
    }
    debug!("Registry port closed");
}

/// Wait for `name`'s session to close, then drop the peer.
async fn watch(state: Arc<RwLock<RegistryState>>, topics: Topics, name: PeerId) {
    let session = match topics.locks.acquire(name.as_str()).await {
        Ok(session) => session,
        Err(e) => {
            warn!(peer = %name, error = %e, "Cannot watch peer liveness");
            return;
        }
    };

    let count = {
        let mut state = state.write().await;
        state.peers.remove(&name);
        state.peers.len()
    };
    info!(peer = %name, count, "Peer left");
    topics.publish_clients(count);
    session.close();
}
