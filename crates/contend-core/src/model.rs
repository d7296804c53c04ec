//! Shared data model: peer identity, run deadline, transcript lines, tallies.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Process-unique random identifier of one peer.
///
/// Generated once per peer lifetime. Names the peer's liveness lock and
/// partitions its rows in the contention log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Absolute end of a run, in Unix epoch milliseconds.
///
/// Chosen once per run and broadcast as an absolute value so every peer stops
/// at (approximately) the same real-world instant regardless of when it
/// received the broadcast. Cross-peer clock skew is not corrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndTime(i64);

impl EndTime {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// `now + duration` on the process wall clock.
    pub fn after(duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(now_millis().saturating_add(millis))
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Whether `millis` is strictly before this deadline.
    pub fn is_before(&self, millis: i64) -> bool {
        millis < self.0
    }

    /// Time left until the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        let left = self.0.saturating_sub(now_millis());
        Duration::from_millis(u64::try_from(left).unwrap_or(0))
    }
}

impl fmt::Display for EndTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Utc.timestamp_millis_opt(self.0).single() {
            Some(at) => write!(f, "{}", at.with_timezone(&Local).format("%H:%M:%S%.3f")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// Current wall-clock time in Unix epoch milliseconds.
///
/// The single time source used for deadlines and log timestamps.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// One transcript entry, timestamped when it was emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub text: String,
}

impl LogLine {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            text: text.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.timestamp.format("%H:%M:%S%.3f"), self.text)
    }
}

/// Reconciled outcome of one run, as seen by one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    /// Committed-before-deadline transactions per peer.
    pub by_peer: BTreeMap<PeerId, u64>,
    /// Shared counter value read after the trim.
    pub counter: u64,
}

impl Tally {
    /// Sum of the per-peer counts.
    pub fn total(&self) -> u64 {
        self.by_peer.values().sum()
    }

    pub fn count_for(&self, peer: &PeerId) -> u64 {
        self.by_peer.get(peer).copied().unwrap_or(0)
    }

    /// Transcript text: `transactions by peer [c1,c2] => sum`.
    pub fn summary(&self) -> String {
        let counts: Vec<String> = self.by_peer.values().map(u64::to_string).collect();
        format!("transactions by peer [{}] => {}", counts.join(","), self.total())
    }
}
