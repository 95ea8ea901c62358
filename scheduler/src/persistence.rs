//! Durable storage of persistent requests.
//!
//! Persistent requests are stored as [Snapshot]s. A stored request must be activated before it
//! is used and is deactivated when it is written back. [MemoryStore] keeps snapshots encoded in
//! memory, which is enough to survive the loss of the in-memory schedulers.

use crate::{
    request::{FetchSettings, Item, Kind},
    Error, ParentId, Priority, RequestId,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex,
};

/// Version of the [Snapshot] format.
pub const SNAPSHOT_VERSION: u16 = 1;

/// The durable form of a [crate::SendableGet].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u16,
    pub id: RequestId,
    pub parent: ParentId,
    pub real_time: bool,
    pub persistent: bool,
    pub priority: Priority,
    pub kind: Kind,
    pub settings: FetchSettings,
    pub items: Vec<Item>,
}

/// Durable storage for request snapshots.
pub trait Persistence: Send + Sync + 'static {
    /// Write `snapshot`, replacing any previous version.
    fn store(&self, snapshot: &Snapshot) -> Result<(), Error>;

    /// Load the snapshot of `id` and mark it active.
    ///
    /// Returns `None` if nothing is stored for `id`.
    fn activate(&self, id: RequestId) -> Result<Option<Snapshot>, Error>;

    /// Write `snapshot` and mark it inactive.
    fn deactivate(&self, snapshot: Snapshot) -> Result<(), Error>;

    /// Returns true if `id` is stored and active.
    fn is_active(&self, id: RequestId) -> bool;

    /// Remove the snapshot of `id`. Removing an unknown request is not an error.
    fn delete(&self, id: RequestId) -> Result<(), Error>;

    /// Returns the identifiers of all stored requests, in order.
    fn list(&self) -> Result<Vec<RequestId>, Error>;
}

#[derive(Default)]
struct Inner {
    snapshots: BTreeMap<RequestId, Vec<u8>>,
    active: HashSet<RequestId>,
}

/// A [Persistence] that keeps encoded snapshots in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored snapshots.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Persistence for MemoryStore {
    fn store(&self, snapshot: &Snapshot) -> Result<(), Error> {
        let encoded = serde_json::to_vec(snapshot)?;
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .insert(snapshot.id, encoded);
        Ok(())
    }

    fn activate(&self, id: RequestId) -> Result<Option<Snapshot>, Error> {
        let mut inner = self.inner.lock().unwrap();
        let Some(encoded) = inner.snapshots.get(&id) else {
            return Ok(None);
        };
        let snapshot = serde_json::from_slice(encoded)?;
        inner.active.insert(id);
        Ok(Some(snapshot))
    }

    fn deactivate(&self, snapshot: Snapshot) -> Result<(), Error> {
        let encoded = serde_json::to_vec(&snapshot)?;
        let mut inner = self.inner.lock().unwrap();
        inner.active.remove(&snapshot.id);
        inner.snapshots.insert(snapshot.id, encoded);
        Ok(())
    }

    fn is_active(&self, id: RequestId) -> bool {
        self.inner.lock().unwrap().active.contains(&id)
    }

    fn delete(&self, id: RequestId) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.active.remove(&id);
        inner.snapshots.remove(&id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<RequestId>, Error> {
        Ok(self.inner.lock().unwrap().snapshots.keys().copied().collect())
    }
}
