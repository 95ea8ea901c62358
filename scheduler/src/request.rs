//! Low-level fetch requests that can be dispatched by a [crate::Scheduler].
//!
//! A [SendableGet] fetches one or more keys on behalf of a parent [Requester]. Each key is
//! addressed by a [Token]. The shape of the request is described by its [Kind]; every operation
//! of the request works on any kind.
//!
//! # Retries
//!
//! Each token tracks how often it failed transiently. After a transient failure, the token cools
//! down for [FetchSettings::cooldown] (doubling with every retry, up to
//! [FetchSettings::max_cooldown]) and is retried until [FetchSettings::max_retries] is exceeded.
//! Terminal and internal failures finish the token immediately. Whenever a token finishes
//! unsuccessfully, the parent is notified with the translated [crate::FetchError].

use crate::{
    error::{translate, Class},
    persistence::{Persistence, Snapshot, SNAPSHOT_VERSION},
    ClientKey, Clock, Error, FetchError, KeyType, LowLevelGetError, NodeKey, ParentId, Partition,
    Priority, Requester, RequestId, Scheduler, Schedulers, Token,
};
use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use std::{
    error::Error as StdError,
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use tracing::{debug, error, warn};

/// Fetch configuration of a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Number of transient failures tolerated per token before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Cooldown after the first transient failure of a token.
    pub first_cooldown: Duration,
    /// Upper bound of the cooldown, which doubles with every retry.
    pub max_cooldown: Duration,
    /// Maximum size of a fetched block, in bytes.
    pub max_output_length: u64,
    /// Whether to skip the local datastore.
    pub ignore_store: bool,
}

impl Default for FetchSettings {
    // Maximum cooldown is reached after 7 retries.
    fn default() -> Self {
        Self {
            max_retries: Some(10),
            first_cooldown: Duration::from_secs(20),
            max_cooldown: Duration::from_secs(30 * 60),
            max_output_length: 1 << 20,
            ignore_store: false,
        }
    }
}

impl FetchSettings {
    /// Returns the cooldown after the `retries`-th transient failure of a token.
    pub fn cooldown(&self, retries: u32) -> Duration {
        let Some(index) = (retries as usize).checked_sub(1) else {
            return Duration::ZERO;
        };
        ExponentialBuilder::default()
            .with_factor(2.0)
            .with_min_delay(self.first_cooldown)
            .with_max_delay(self.max_cooldown)
            .with_max_times(retries as usize)
            .build()
            .nth(index)
            .unwrap_or(self.max_cooldown)
    }
}

/// The shape of a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    /// A single key, addressed by token 0.
    Single(ClientKey),
    /// The blocks of one splitfile segment, addressed by their index.
    ///
    /// The segment completes once `required` blocks have been fetched; the remaining blocks are
    /// then cancelled.
    Segment { keys: Vec<ClientKey>, required: u32 },
}

impl Kind {
    fn validate(&self) -> Result<(), Error> {
        match self {
            Kind::Single(_) => Ok(()),
            Kind::Segment { keys, required } => {
                if keys.is_empty() {
                    return Err(Error::InvalidRequest("segment has no keys"));
                }
                if keys.iter().any(|key| key.key_type != KeyType::Chk) {
                    return Err(Error::InvalidRequest("segment keys must be content hash keys"));
                }
                if *required == 0 || *required as usize > keys.len() {
                    return Err(Error::InvalidRequest("segment requires an impossible block count"));
                }
                Ok(())
            }
        }
    }

    /// Returns the number of tokens.
    pub fn len(&self) -> usize {
        match self {
            Kind::Single(_) => 1,
            Kind::Segment { keys, .. } => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of tokens that must be fetched for the request to succeed.
    pub fn required(&self) -> usize {
        match self {
            Kind::Single(_) => 1,
            Kind::Segment { required, .. } => *required as usize,
        }
    }

    fn key(&self, token: Token) -> Option<&ClientKey> {
        match self {
            Kind::Single(key) => (token.0 == 0).then_some(key),
            Kind::Segment { keys, .. } => keys.get(token.0 as usize),
        }
    }

    fn key_type(&self) -> KeyType {
        match self {
            Kind::Single(key) => key.key_type,
            Kind::Segment { .. } => KeyType::Chk,
        }
    }
}

/// Progress of one token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    Pending,
    Fetched,
    Failed,
    Cancelled,
}

/// Durable progress of one token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub state: ItemState,
    pub retries: u32,
    pub last_failure: Option<SystemTime>,
}

impl Item {
    fn pending() -> Self {
        Self {
            state: ItemState::Pending,
            retries: 0,
            last_failure: None,
        }
    }
}

#[derive(Debug)]
struct Progress {
    priority: Priority,
    items: Vec<Item>,
}

impl Progress {
    fn count(&self, state: ItemState) -> usize {
        self.items.iter().filter(|item| item.state == state).count()
    }

    /// Cancel all pending items.
    fn cancel_pending(&mut self) {
        for item in self.items.iter_mut() {
            if item.state == ItemState::Pending {
                item.state = ItemState::Cancelled;
            }
        }
    }
}

/// A low-level fetch of one or more keys, which can be handed to a dispatch worker.
pub struct SendableGet {
    id: RequestId,
    parent: Arc<dyn Requester>,
    real_time: bool,
    persistent: bool,
    kind: Kind,
    settings: Arc<FetchSettings>,
    progress: Mutex<Progress>,
}

impl SendableGet {
    /// Create a new request on behalf of `parent`.
    ///
    /// The request is persistent if its parent is.
    pub fn new(
        id: RequestId,
        parent: Arc<dyn Requester>,
        kind: Kind,
        priority: Priority,
        real_time: bool,
        settings: FetchSettings,
    ) -> Result<Self, Error> {
        kind.validate()?;
        let items = vec![Item::pending(); kind.len()];
        Ok(Self {
            id,
            persistent: parent.persistent(),
            parent,
            real_time,
            kind,
            settings: Arc::new(settings),
            progress: Mutex::new(Progress { priority, items }),
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn parent(&self) -> &Arc<dyn Requester> {
        &self.parent
    }

    pub fn parent_id(&self) -> ParentId {
        self.parent.id()
    }

    pub fn real_time(&self) -> bool {
        self.real_time
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Fetch requests are never inserts.
    pub fn is_insert(&self) -> bool {
        false
    }

    /// Returns the partition (and thus the scheduler) this request belongs to.
    pub fn partition(&self) -> Partition {
        Partition::new(self.kind.key_type(), self.real_time)
    }

    pub fn priority(&self) -> Priority {
        self.progress.lock().unwrap().priority
    }

    /// Change the priority class, returning the previous one.
    ///
    /// A registered request must be moved with [Scheduler::reprioritize] instead.
    pub fn set_priority(&self, priority: Priority) -> Priority {
        std::mem::replace(&mut self.progress.lock().unwrap().priority, priority)
    }

    /// Returns all tokens of the request, whatever their state.
    pub fn tokens(&self) -> impl Iterator<Item = Token> {
        (0..self.kind.len() as u32).map(Token)
    }

    /// Returns the tokens that still need to be fetched.
    pub fn pending(&self) -> Vec<Token> {
        let progress = self.progress.lock().unwrap();
        progress
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.state == ItemState::Pending)
            .map(|(index, _)| Token(index as u32))
            .collect()
    }

    /// Returns the number of tokens that still need to be fetched.
    pub fn pending_count(&self) -> usize {
        self.progress.lock().unwrap().count(ItemState::Pending)
    }

    /// Returns true once no token needs to be fetched anymore.
    pub fn is_finished(&self) -> bool {
        self.pending_count() == 0
    }

    /// Returns the progress of `token`.
    pub fn item(&self, token: Token) -> Option<Item> {
        self.progress
            .lock()
            .unwrap()
            .items
            .get(token.0 as usize)
            .cloned()
    }

    /// Returns the key `token` refers to, or `None` if the token no longer needs to be fetched.
    pub fn resolve_key(&self, token: Token) -> Option<ClientKey> {
        let progress = self.progress.lock().unwrap();
        let item = progress.items.get(token.0 as usize)?;
        if item.state != ItemState::Pending {
            return None;
        }
        self.kind.key(token).copied()
    }

    /// Returns the routing key `token` refers to, or `None` if the token no longer needs to be
    /// fetched.
    pub fn node_key(&self, token: Token) -> Option<NodeKey> {
        self.resolve_key(token).map(|key| key.node_key())
    }

    /// Returns the routing keys of all tokens that still need to be fetched.
    ///
    /// Used to probe the local datastore in bulk.
    pub fn list_keys(&self) -> Vec<NodeKey> {
        self.pending()
            .into_iter()
            .filter_map(|token| self.kind.key(token))
            .map(ClientKey::node_key)
            .collect()
    }

    pub fn fetch_settings(&self) -> Arc<FetchSettings> {
        self.settings.clone()
    }

    /// Record that `token` was fetched and notify the parent.
    ///
    /// Returns `false` if the token was not pending.
    pub fn on_success(&self, token: Token) -> bool {
        {
            let mut progress = self.progress.lock().unwrap();
            let Some(item) = progress.items.get_mut(token.0 as usize) else {
                warn!(request = %self.id, %token, "success for unknown token");
                return false;
            };
            if item.state != ItemState::Pending {
                debug!(request = %self.id, %token, state = ?item.state, "success for finished token");
                return false;
            }
            item.state = ItemState::Fetched;

            // A segment does not need the remaining blocks once enough are fetched
            if progress.count(ItemState::Fetched) >= self.kind.required() {
                progress.cancel_pending();
            }
        }
        self.parent.on_success(self.id, token);
        true
    }

    /// Record a failed attempt to fetch `token` at `now`.
    ///
    /// If `token` is `None`, the whole request failed: every pending token is finished and the
    /// parent is notified once.
    pub fn on_failure(&self, error: &LowLevelGetError, token: Option<Token>, now: SystemTime) {
        let class = error.code().class();
        let mut reports = Vec::new();
        {
            let mut progress = self.progress.lock().unwrap();
            let Some(token) = token else {
                if progress.count(ItemState::Pending) == 0 {
                    debug!(request = %self.id, %error, "failure for finished request");
                    return;
                }
                for item in progress.items.iter_mut() {
                    if item.state == ItemState::Pending {
                        item.state = ItemState::Failed;
                        item.last_failure = Some(now);
                    }
                }
                drop(progress);
                self.parent.on_failure(self.id, None, translate(error));
                return;
            };

            let Some(item) = progress.items.get_mut(token.0 as usize) else {
                warn!(request = %self.id, %token, %error, "failure for unknown token");
                return;
            };
            if item.state != ItemState::Pending {
                debug!(request = %self.id, %token, state = ?item.state, "failure for finished token");
                return;
            }
            item.last_failure = Some(now);
            match class {
                Class::Transient => {
                    item.retries = item.retries.saturating_add(1);
                    if self
                        .settings
                        .max_retries
                        .is_some_and(|max| item.retries > max)
                    {
                        item.state = ItemState::Failed;
                    }
                }
                Class::Terminal => item.state = ItemState::Failed,
                Class::Internal => {
                    error!(request = %self.id, %token, %error, source = ?error.source(), "internal error");
                    item.state = ItemState::Failed;
                }
            }
            if item.state == ItemState::Failed {
                reports.push((Some(token), translate(error)));
            }

            // A segment that can no longer collect enough blocks fails as a whole
            let fetched = progress.count(ItemState::Fetched);
            let pending = progress.count(ItemState::Pending);
            if pending > 0 && fetched + pending < self.kind.required() {
                progress.cancel_pending();
                let detail = format!(
                    "segment cannot complete: {fetched} of {} blocks fetched",
                    self.kind.required()
                );
                reports.push((None, FetchError::with_detail(translate(error).kind(), detail)));
            }
        }
        for (token, error) in reports {
            self.parent.on_failure(self.id, token, error);
        }
    }

    /// Returns when `token` may be dispatched again after its most recent failure.
    ///
    /// Returns `None` if the token is not pending or never failed.
    pub fn cooldown_wakeup(&self, token: Token) -> Option<SystemTime> {
        let progress = self.progress.lock().unwrap();
        let item = progress.items.get(token.0 as usize)?;
        if item.state != ItemState::Pending || item.retries == 0 {
            return None;
        }
        let last_failure = item.last_failure?;
        last_failure.checked_add(self.settings.cooldown(item.retries))
    }

    /// Remove the request from its scheduler.
    ///
    /// Admission control is told the request left `previous`, or the current priority if `None`.
    pub fn unregister<C: Clock>(&self, schedulers: &Schedulers<C>, previous: Option<Priority>) {
        schedulers
            .scheduler(self.partition())
            .unregister(self.id, previous);
    }

    /// Report a fault affecting the whole request rather than any single token.
    ///
    /// The fault is reported as a synthetic [crate::Code::InternalError] through the normal
    /// failure path, so the parent is notified. If `scheduler` does not hold the request (it was
    /// never registered or is already unregistered), the failure is recorded on the request
    /// directly.
    pub fn internal_error<C: Clock>(
        &self,
        error: Arc<dyn StdError + Send + Sync>,
        scheduler: &Scheduler<C>,
        persistent: bool,
    ) {
        error!(request = %self.id, %error, persistent, "internal error");
        let error = LowLevelGetError::internal(error);
        if !scheduler.report_failure(self.id, None, error.clone()) {
            self.on_failure(&error, None, scheduler.current());
        }
    }

    /// Check a request loaded from `store` for consistency.
    ///
    /// The request must be active in `store`. Returns `true` (after logging) if the request is not
    /// persistent, in which case it must never have been stored and has to be removed.
    pub fn is_storage_broken(&self, store: &dyn Persistence) -> Result<bool, Error> {
        if !store.is_active(self.id) {
            return Err(Error::NotActivated(self.id));
        }
        if !self.persistent {
            error!(request = %self.id, "stored request is not persistent");
            return Ok(true);
        }
        Ok(false)
    }

    /// Returns the durable form of the request.
    pub fn snapshot(&self) -> Snapshot {
        let progress = self.progress.lock().unwrap();
        Snapshot {
            version: SNAPSHOT_VERSION,
            id: self.id,
            parent: self.parent.id(),
            real_time: self.real_time,
            persistent: self.persistent,
            priority: progress.priority,
            kind: self.kind.clone(),
            settings: (*self.settings).clone(),
            items: progress.items.clone(),
        }
    }

    /// Rebuild a request from its durable form.
    pub fn from_snapshot(snapshot: Snapshot, parent: Arc<dyn Requester>) -> Result<Self, Error> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::UnsupportedVersion(snapshot.version));
        }
        if parent.id() != snapshot.parent {
            return Err(Error::ParentMismatch {
                expected: snapshot.parent,
                found: parent.id(),
            });
        }
        snapshot.kind.validate()?;
        if snapshot.items.len() != snapshot.kind.len() {
            return Err(Error::InvalidRequest("item count does not match keys"));
        }
        Ok(Self {
            id: snapshot.id,
            parent,
            real_time: snapshot.real_time,
            persistent: snapshot.persistent,
            kind: snapshot.kind,
            settings: Arc::new(snapshot.settings),
            progress: Mutex::new(Progress {
                priority: snapshot.priority,
                items: snapshot.items,
            }),
        })
    }

    /// Load request `id` from `store`, marking it active.
    ///
    /// Returns `None` if the request is not stored.
    pub fn activate(
        store: &dyn Persistence,
        id: RequestId,
        parent: Arc<dyn Requester>,
    ) -> Result<Option<Self>, Error> {
        let Some(snapshot) = store.activate(id)? else {
            return Ok(None);
        };
        Self::from_snapshot(snapshot, parent).map(Some)
    }

    /// Write the request back to `store`, marking it inactive.
    pub fn deactivate(&self, store: &dyn Persistence) -> Result<(), Error> {
        store.deactivate(self.snapshot())
    }
}

impl fmt::Debug for SendableGet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendableGet")
            .field("id", &self.id)
            .field("parent", &self.parent.id())
            .field("real_time", &self.real_time)
            .field("persistent", &self.persistent)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
