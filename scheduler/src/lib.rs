//! Schedule, deduplicate and retry low-level block fetches.
//!
//! A [Requester] that needs blocks creates one or more [SendableGet] requests and registers them
//! with the [Scheduler] responsible for their [Partition] (key type and real-time class, see
//! [Schedulers]). Dispatch workers pull [ChosenBlock]s from a scheduler with
//! [Scheduler::choose_request], attempt the fetch, and report the outcome back with
//! [Scheduler::succeeded] or [Scheduler::failed].
//!
//! # Selection
//!
//! Requests are served in strict [Priority] order. Within a priority class, parents are served
//! round-robin so that no requester starves its siblings. A token is never handed to two workers
//! at once, and a token that failed recently is excluded until its cooldown elapses.
//!
//! # Failures
//!
//! Low-level failures ([LowLevelGetError]) are classified as transient, terminal or internal.
//! Transient failures start a cooldown (computed with an exponential backoff) and are retried
//! until [FetchSettings::max_retries] is exceeded. Terminal and internal failures are translated
//! into a [FetchError] and reported to the parent immediately.
//!
//! # Persistence
//!
//! Persistent requests are written through to a [Persistence] handle on every change and are
//! restored with [Schedulers::restore] after a restart. A stored request that is not marked
//! persistent is considered broken: it is logged, deleted and never scheduled.
//!
//! # Locking
//!
//! Each partition has a single lock protecting its candidates, in-flight tokens, cooldowns and
//! accounting. Request progress has its own lock, which may be taken while a partition lock is
//! held but never the other way around. [Requester] callbacks are invoked with no lock held.

use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};
use thiserror::Error;

mod cooldown;
pub mod error;
pub use error::{Class, Code, FetchError, FetchKind, LowLevelGetError};
mod key;
pub use key::{ClientKey, KeyType, NodeKey, KEY_LENGTH};
mod metrics;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
pub mod persistence;
pub use persistence::{MemoryStore, Persistence, Snapshot};
pub mod request;
pub use request::{FetchSettings, Kind, SendableGet};
mod scheduler;
pub use scheduler::{ChosenBlock, Config, Scheduler, Schedulers};

/// Errors that can occur when scheduling requests.
#[derive(Debug, Error)]
pub enum Error {
    #[error("request already registered: {0}")]
    AlreadyRegistered(RequestId),
    #[error("request {request} belongs to {expected}, not {actual}")]
    WrongPartition {
        request: RequestId,
        expected: Partition,
        actual: Partition,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("request not activated: {0}")]
    NotActivated(RequestId),
    #[error("parent mismatch: expected {expected}, found {found}")]
    ParentMismatch { expected: ParentId, found: ParentId },
    #[error("no persistence available for request {0}")]
    PersistenceUnavailable(RequestId),
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("unsupported snapshot version: {0}")]
    UnsupportedVersion(u16),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Identifies a [SendableGet].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request-{}", self.0)
    }
}

/// Identifies the [Requester] that owns a group of requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParentId(pub u64);

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parent-{}", self.0)
    }
}

/// Identifies one concrete key within a (possibly multi-key) request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub u32);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority class of a request.
///
/// Lower classes are more urgent and are always served first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Maximum = 0,
    Interactive = 1,
    ImmediateSplitfile = 2,
    Update = 3,
    BulkSplitfile = 4,
    Prefetch = 5,
    Minimum = 6,
}

impl Priority {
    /// All priority classes, most urgent first.
    pub const ALL: [Priority; 7] = [
        Priority::Maximum,
        Priority::Interactive,
        Priority::ImmediateSplitfile,
        Priority::Update,
        Priority::BulkSplitfile,
        Priority::Prefetch,
        Priority::Minimum,
    ];
}

/// The scheduler a request belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Partition {
    pub key_type: KeyType,
    pub real_time: bool,
}

impl Partition {
    /// All partitions.
    pub const ALL: [Partition; 4] = [
        Partition::new(KeyType::Chk, false),
        Partition::new(KeyType::Chk, true),
        Partition::new(KeyType::Ssk, false),
        Partition::new(KeyType::Ssk, true),
    ];

    pub const fn new(key_type: KeyType, real_time: bool) -> Self {
        Self {
            key_type,
            real_time,
        }
    }

    /// Label used to prefix metrics.
    pub fn label(&self) -> &'static str {
        match (self.key_type, self.real_time) {
            (KeyType::Chk, false) => "chk_bulk",
            (KeyType::Chk, true) => "chk_rt",
            (KeyType::Ssk, false) => "ssk_bulk",
            (KeyType::Ssk, true) => "ssk_rt",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Supplies the current wall-clock time.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Returns the current time.
    fn current(&self) -> SystemTime;
}

/// A [Clock] backed by [SystemTime::now].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// The owner of a group of requests, notified when their tokens complete.
///
/// Callbacks are invoked without any scheduler lock held and may call back into the scheduler.
pub trait Requester: Send + Sync + 'static {
    /// Returns the identity of the requester.
    fn id(&self) -> ParentId;

    /// Returns whether requests created by this requester are persistent.
    fn persistent(&self) -> bool;

    /// A token of `request` was fetched.
    fn on_success(&self, request: RequestId, token: Token);

    /// A token of `request` failed terminally.
    ///
    /// `token` is `None` when the failure affected the whole request.
    fn on_failure(&self, request: RequestId, token: Option<Token>, error: FetchError);
}

/// Admission control, notified whenever a request enters or leaves a priority class.
pub trait Admission: Send + Sync + 'static {
    /// A request was added to `priority`.
    fn add_request(&self, request: RequestId, persistent: bool, priority: Priority);

    /// A request was removed from `priority`.
    fn remove_request(&self, request: RequestId, persistent: bool, priority: Priority);
}

impl Admission for () {
    fn add_request(&self, _: RequestId, _: bool, _: Priority) {}

    fn remove_request(&self, _: RequestId, _: bool, _: Priority) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Maximum < Priority::Interactive);
        assert!(Priority::Prefetch < Priority::Minimum);
        for (i, priority) in Priority::ALL.iter().enumerate() {
            assert_eq!(*priority as usize, i);
        }
    }

    #[test]
    fn test_partition_labels() {
        let labels: Vec<_> = Partition::ALL.iter().map(|p| p.to_string()).collect();
        assert_eq!(labels, ["chk_bulk", "chk_rt", "ssk_bulk", "ssk_rt"]);
    }
}
