//! PeerCoordinator - one participant of a contention run.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────────┐ initialize() ┌────────────┐   go    ┌──────────────────┐
//! │ Initializing │─────────────▶│ Registered │────────▶│ Running(endTime) │
//! └──────┬───────┘              └────────────┘         └────────┬─────────┘
//!        │ open/clear failed          ▲  run failed             │ reconciled
//!        ▼                            └─────────────────────────┤
//!   ┌────────┐                                                  ▼
//!   │ Failed │                        ┌───────┐      go     ┌───────┐
//!   └────────┘                        │ Ready │◀───────────▶│  ...  │
//!                                     └───────┘             └───────┘
//! ```
//!
//! A peer opens one connection, takes the liveness lock named after its
//! [`PeerId`], registers with the registry and then waits on the `go` topic.
//! Every go broadcast runs one [`BenchmarkLoop`]. Status text is published as
//! [`PeerEvent::Log`] and mirrored to `tracing`.
//!
//! # Usage
//!
//! ```rust,ignore
//! let (bus, registry) = Registry::in_memory();
//! let peer = PeerCoordinator::new(bus);
//! let mut events = peer.subscribe();
//!
//! peer.initialize(&backend, false).await?;
//! peer.request_start(Duration::from_secs(10)).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         PeerEvent::Log(line) => println!("{line}"),
//!         PeerEvent::Ready => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use contend_core::{
    ConnectionFactory, ContendError, EndTime, LogLine, PeerId, QueryChannel, Result,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::benchmark::{reset_tables, BenchmarkLoop, LoopReport};
use crate::bus::Bus;
use crate::lock::Session;

/// Peer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Opening the connection
    Initializing,
    /// Registered and waiting for the first go
    Registered,
    /// Running the benchmark loop until the end time
    Running(EndTime),
    /// Finished a run, waiting for the next go
    Ready,
    /// Setup failed; the peer never registered
    Failed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Initializing => write!(f, "initializing"),
            PeerState::Registered => write!(f, "registered"),
            PeerState::Running(end) => write!(f, "running until {}", end),
            PeerState::Ready => write!(f, "ready"),
            PeerState::Failed => write!(f, "failed"),
        }
    }
}

/// Observable peer events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The peer can accept a start request
    Ready,
    /// A run started and ends at the given time
    Go(EndTime),
    /// Transcript entry
    Log(LogLine),
    /// Connected peer count, as published by the registry
    Clients(usize),
}

/// Event channel capacity
const EVENT_CAPACITY: usize = 256;

/// One peer of a contention run
pub struct PeerCoordinator {
    id: PeerId,
    bus: Bus,
    state: RwLock<PeerState>,
    events: broadcast::Sender<PeerEvent>,
    connection: RwLock<Option<Arc<dyn QueryChannel>>>,
    session: Mutex<Option<Session>>,
    /// Serializes runs; a go arriving mid-run waits for the current one.
    run_lock: AsyncMutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerCoordinator {
    /// Create a peer in `Initializing` with a fresh [`PeerId`].
    #[allow(clippy::new_ret_no_self)]
    pub fn new(bus: Bus) -> PeerHandle {
        Self::with_id(bus, PeerId::random())
    }

    pub fn with_id(bus: Bus, id: PeerId) -> PeerHandle {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        PeerHandle {
            peer: Arc::new(Self {
                id,
                bus,
                state: RwLock::new(PeerState::Initializing),
                events,
                connection: RwLock::new(None),
                session: Mutex::new(None),
                run_lock: AsyncMutex::new(()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Subscribe to peer events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Get current peer state
    pub async fn state(&self) -> PeerState {
        *self.state.read().await
    }

    /// Whether the liveness session is held and open.
    pub fn is_live(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|session| !session.is_closed())
    }

    fn emit(&self, event: PeerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Publish a transcript line.
    fn log(&self, text: impl Into<String>) {
        let line = LogLine::now(text);
        info!(peer = %self.id, "{}", line.text);
        self.emit(PeerEvent::Log(line));
    }

    /// Publish an error with its full cause chain.
    fn log_error(&self, err: &ContendError) {
        let line = LogLine::now(err.diagnostic());
        error!(peer = %self.id, error = %err, "{}", line.text);
        self.emit(PeerEvent::Log(line));
    }

    /// The peer's connection, provided it registered and has not failed.
    async fn connection(&self) -> Result<Arc<dyn QueryChannel>> {
        let state = self.state().await;
        let connection = match state {
            PeerState::Registered | PeerState::Ready | PeerState::Running(_) => {
                self.connection.read().await.clone()
            }
            PeerState::Initializing | PeerState::Failed => None,
        };
        connection.ok_or_else(|| {
            ContendError::Configuration(format!("peer {} is {}, it cannot run", self.id, state))
        })
    }

    /// Run one benchmark until `end` and reconcile.
    ///
    /// Errors are logged to the transcript and returned. After a failed run
    /// the peer is `Registered` again and does not emit `Ready`.
    pub async fn go(&self, end: EndTime) -> Result<LoopReport> {
        let _run = self.run_lock.lock().await;
        let connection = match self.connection().await {
            Ok(connection) => connection,
            Err(e) => {
                self.log_error(&e);
                return Err(e);
            }
        };

        *self.state.write().await = PeerState::Running(end);
        self.emit(PeerEvent::Go(end));
        self.log(format!("running until {}", end));

        match BenchmarkLoop::new(connection.as_ref(), &self.id).run(end).await {
            Ok(report) => {
                self.log(report.tally.summary());
                *self.state.write().await = PeerState::Ready;
                self.emit(PeerEvent::Ready);
                Ok(report)
            }
            Err(e) => {
                self.log_error(&e);
                *self.state.write().await = PeerState::Registered;
                Err(e)
            }
        }
    }

    /// Reset the shared tables and ask the registry to start a run.
    pub async fn request_start(&self, duration: Duration) -> Result<()> {
        let result = async {
            let connection = self.connection().await?;
            reset_tables(connection.as_ref()).await?;
            self.bus.request_go(duration)
        }
        .await;

        match result {
            Ok(()) => {
                debug!(peer = %self.id, duration_ms = duration.as_millis() as u64, "Start requested");
                Ok(())
            }
            Err(e) => {
                self.log_error(&e);
                Err(e)
            }
        }
    }

    /// Release the liveness session and stop listening. Idempotent.
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(session) = self.session.lock().take() {
            session.close();
            info!(peer = %self.id, "Peer closed");
        }
    }
}

/// Owning handle of a [`PeerCoordinator`].
///
/// Dropping the handle closes the peer: its liveness session is released and
/// the registry counts it out.
pub struct PeerHandle {
    peer: Arc<PeerCoordinator>,
}

impl Deref for PeerHandle {
    type Target = PeerCoordinator;

    fn deref(&self) -> &PeerCoordinator {
        &self.peer
    }
}

impl PeerHandle {
    /// Open the connection, take the liveness lock, register and start
    /// listening for go broadcasts.
    ///
    /// With `clear`, persisted state is wiped first. On failure the peer is
    /// left `Failed`; there is no retry.
    pub async fn initialize<F>(&self, factory: &F, clear: bool) -> Result<()>
    where
        F: ConnectionFactory,
    {
        let peer = &self.peer;
        {
            let state = peer.state().await;
            if state != PeerState::Initializing {
                return Err(ContendError::Configuration(format!(
                    "peer {} is already {}",
                    peer.id, state
                )));
            }
        }

        match self.setup(factory, clear).await {
            Ok(()) => {
                *peer.state.write().await = PeerState::Registered;
                peer.emit(PeerEvent::Ready);
                info!(peer = %peer.id, backend = factory.label(), "Peer registered");
                Ok(())
            }
            Err(e) => {
                peer.log_error(&e);
                *peer.state.write().await = PeerState::Failed;
                *peer.connection.write().await = None;
                peer.close();
                Err(e)
            }
        }
    }

    async fn setup<F>(&self, factory: &F, clear: bool) -> Result<()>
    where
        F: ConnectionFactory,
    {
        let peer = &self.peer;
        if clear {
            peer.log("clearing storage");
            factory.clear().await?;
        }

        let connection: Arc<dyn QueryChannel> = Arc::new(factory.open(0).await?);
        *peer.connection.write().await = Some(connection);

        let session = peer.bus.locks().acquire(peer.id.as_str()).await?;
        *peer.session.lock() = Some(session);

        // Subscribe before registering so no count or go is missed.
        let clients = peer.bus.subscribe_clients();
        let go = peer.bus.subscribe_go();
        peer.bus.register(peer.id.clone())?;

        let mut tasks = peer.tasks.lock();
        tasks.push(tokio::spawn(forward_clients(Arc::clone(peer), clients)));
        tasks.push(tokio::spawn(listen_go(Arc::clone(peer), go)));
        Ok(())
    }

    /// Close the peer; same as dropping the handle.
    pub fn close(self) {}
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.peer.close();
    }
}

/// Create a peer and initialize it in one step.
pub async fn spawn_peer<F>(factory: &F, bus: Bus, clear: bool) -> Result<PeerHandle>
where
    F: ConnectionFactory,
{
    let handle = PeerCoordinator::new(bus);
    handle.initialize(factory, clear).await?;
    Ok(handle)
}

/// Run every go broadcast; failures are already in the transcript.
async fn listen_go(peer: Arc<PeerCoordinator>, mut go: broadcast::Receiver<EndTime>) {
    loop {
        match go.recv().await {
            Ok(end) => {
                if let Err(e) = peer.go(end).await {
                    debug!(peer = %peer.id, error = %e, "Run failed, still listening");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(peer = %peer.id, skipped, "Missed go broadcasts");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn forward_clients(peer: Arc<PeerCoordinator>, mut clients: broadcast::Receiver<usize>) {
    loop {
        match clients.recv().await {
            Ok(count) => peer.emit(PeerEvent::Clients(count)),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
