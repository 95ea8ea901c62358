//! Mock implementations for testing.

use crate::{
    ClientKey, Clock, Error, FetchError, FetchSettings, KeyType, Kind, MemoryStore, ParentId,
    Persistence, Priority, RequestId, SendableGet, Snapshot, Token, KEY_LENGTH,
};
use futures::channel::mpsc;
use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

/// An event that indicates the notifications a [Requester] received
#[derive(Debug)]
pub enum Event {
    /// A token was fetched
    Success(RequestId, Token),

    /// A token (or the whole request, if `None`) failed
    Failure(RequestId, Option<Token>, FetchError),
}

/// A requester that forwards its notifications over a channel
pub struct Requester {
    id: ParentId,
    persistent: bool,
    sender: mpsc::UnboundedSender<Event>,
}

impl Requester {
    /// Create a new requester
    ///
    /// Returns the requester and a receiver that can be used to get the events
    pub fn new(id: u64, persistent: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded();
        (
            Arc::new(Self {
                id: ParentId(id),
                persistent,
                sender,
            }),
            receiver,
        )
    }
}

impl crate::Requester for Requester {
    fn id(&self) -> ParentId {
        self.id
    }

    fn persistent(&self) -> bool {
        self.persistent
    }

    fn on_success(&self, request: RequestId, token: Token) {
        let _ = self.sender.unbounded_send(Event::Success(request, token));
    }

    fn on_failure(&self, request: RequestId, token: Option<Token>, error: FetchError) {
        let _ = self
            .sender
            .unbounded_send(Event::Failure(request, token, error));
    }
}

/// A clock that only moves when told to
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl ManualClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Move the clock forward by `duration`
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += duration;
    }
}

impl Clock for ManualClock {
    fn current(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

/// A change reported to [RecordingAdmission]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admitted {
    Added(RequestId, Priority),
    Removed(RequestId, Priority),
}

/// Admission control that records every change
#[derive(Default)]
pub struct RecordingAdmission {
    changes: Mutex<Vec<Admitted>>,
}

impl RecordingAdmission {
    /// Returns and clears the recorded changes
    pub fn take(&self) -> Vec<Admitted> {
        std::mem::take(&mut *self.changes.lock().unwrap())
    }
}

impl crate::Admission for RecordingAdmission {
    fn add_request(&self, request: RequestId, _: bool, priority: Priority) {
        self.changes
            .lock()
            .unwrap()
            .push(Admitted::Added(request, priority));
    }

    fn remove_request(&self, request: RequestId, _: bool, priority: Priority) {
        self.changes
            .lock()
            .unwrap()
            .push(Admitted::Removed(request, priority));
    }
}

/// A store that refuses all writes
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
}

impl Persistence for FailingStore {
    fn store(&self, snapshot: &Snapshot) -> Result<(), Error> {
        Err(Error::Persistence(format!("store refused {}", snapshot.id)))
    }

    fn activate(&self, id: RequestId) -> Result<Option<Snapshot>, Error> {
        self.inner.activate(id)
    }

    fn deactivate(&self, snapshot: Snapshot) -> Result<(), Error> {
        Err(Error::Persistence(format!("store refused {}", snapshot.id)))
    }

    fn is_active(&self, id: RequestId) -> bool {
        self.inner.is_active(id)
    }

    fn delete(&self, id: RequestId) -> Result<(), Error> {
        self.inner.delete(id)
    }

    fn list(&self) -> Result<Vec<RequestId>, Error> {
        self.inner.list()
    }
}

/// Returns a content hash key derived from `seed`
pub fn chk(seed: u8) -> ClientKey {
    ClientKey::new(KeyType::Chk, [seed; KEY_LENGTH], [!seed; KEY_LENGTH])
}

/// Returns a signed subspace key derived from `seed`
pub fn ssk(seed: u8) -> ClientKey {
    ClientKey::new(KeyType::Ssk, [seed; KEY_LENGTH], [!seed; KEY_LENGTH])
}

/// Create a bulk, single-key request at [Priority::Interactive]
pub fn single(
    id: u64,
    parent: Arc<dyn crate::Requester>,
    key: ClientKey,
    settings: FetchSettings,
) -> Arc<SendableGet> {
    Arc::new(
        SendableGet::new(
            RequestId(id),
            parent,
            Kind::Single(key),
            Priority::Interactive,
            false,
            settings,
        )
        .unwrap(),
    )
}

/// Create a bulk segment request of `blocks` keys at [Priority::BulkSplitfile]
pub fn segment(
    id: u64,
    parent: Arc<dyn crate::Requester>,
    blocks: u8,
    required: u32,
) -> Arc<SendableGet> {
    let keys = (0..blocks).map(chk).collect();
    Arc::new(
        SendableGet::new(
            RequestId(id),
            parent,
            Kind::Segment { keys, required },
            Priority::BulkSplitfile,
            false,
            FetchSettings::default(),
        )
        .unwrap(),
    )
}
