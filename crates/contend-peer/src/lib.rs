//! Peer coordination for timed write-contention runs.
//!
//! - [`lock`]: named liveness locks and sessions
//! - [`bus`]: registry port and broadcast topics
//! - [`registry`]: peer counting and go broadcasts
//! - [`benchmark`]: the increment loop and reconciliation
//! - [`coordinator`]: the per-peer state machine tying it together

pub mod benchmark;
pub mod bus;
pub mod coordinator;
pub mod lock;
pub mod registry;

pub use benchmark::{reset_tables, BenchmarkLoop, LoopReport};
pub use bus::{Bus, RegistryMessage, RegistryPort};
pub use coordinator::{spawn_peer, PeerCoordinator, PeerEvent, PeerHandle, PeerState};
pub use lock::{LockManager, Session};
pub use registry::Registry;
