use crate::{
    cooldown::{CooldownTracker, Item},
    metrics::{FailureLabel, Metrics},
    Admission, Class, ClientKey, Clock, Code, Error, FetchSettings, KeyType, LowLevelGetError,
    ParentId, Partition, Persistence, Priority, RequestId, Requester, SendableGet, Token,
};
use prometheus_client::registry::Registry;
use std::{
    collections::{hash_map::Entry, BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use tracing::{debug, error, warn};

/// Configuration for a [Scheduler].
#[derive(Clone)]
pub struct Config<C: Clock> {
    /// Source of the current time, used for cooldowns and dispatch deadlines.
    pub clock: C,

    /// Admission control, notified when requests enter or leave a priority class.
    pub admission: Arc<dyn Admission>,

    /// Durable storage for persistent requests.
    ///
    /// Registering a persistent request fails if this is `None`.
    pub persistence: Option<Arc<dyn Persistence>>,

    /// How long a worker may hold a real-time token before it is failed.
    pub real_time_timeout: Duration,

    /// How long a worker may hold a bulk token before it is failed.
    pub bulk_timeout: Duration,

    /// Whether to log per-token events (selection, cooldown expiry, stale reports).
    pub log_minor: bool,
}

/// A token handed to a dispatch worker.
///
/// The worker must report the outcome with [Scheduler::succeeded] or [Scheduler::failed] before
/// `deadline`, after which the token is failed with [Code::TransferFailed] and reports for it are
/// ignored.
#[derive(Clone, Debug)]
pub struct ChosenBlock {
    pub request: Arc<SendableGet>,
    pub parent: ParentId,
    pub token: Token,
    pub key: ClientKey,
    pub priority: Priority,
    pub real_time: bool,
    pub persistent: bool,
    pub settings: Arc<FetchSettings>,
    pub deadline: SystemTime,
}

/// Requests of one priority class, grouped by parent.
#[derive(Default)]
struct PriorityClass {
    parents: VecDeque<ParentId>,
    requests: HashMap<ParentId, VecDeque<RequestId>>,
}

impl PriorityClass {
    fn insert(&mut self, parent: ParentId, request: RequestId) {
        match self.requests.entry(parent) {
            Entry::Occupied(mut entry) => entry.get_mut().push_back(request),
            Entry::Vacant(entry) => {
                entry.insert(VecDeque::from([request]));
                self.parents.push_back(parent);
            }
        }
    }

    fn remove(&mut self, parent: ParentId, request: RequestId) -> bool {
        let Some(requests) = self.requests.get_mut(&parent) else {
            return false;
        };
        let Some(index) = requests.iter().position(|r| *r == request) else {
            return false;
        };
        requests.remove(index);
        if requests.is_empty() {
            self.requests.remove(&parent);
            self.parents.retain(|p| *p != parent);
        }
        true
    }

    fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

struct Registered {
    request: Arc<SendableGet>,
    priority: Priority,
}

#[derive(Default)]
struct State {
    requests: HashMap<RequestId, Registered>,
    classes: BTreeMap<Priority, PriorityClass>,

    // Tokens held by a worker. The deadline is taken once the outcome is being recorded, so
    // that the token is reported at most once and stays excluded until it is settled.
    in_flight: HashMap<Item, Option<SystemTime>>,
    cooldown: CooldownTracker,
}

impl State {
    /// Find the next eligible token, rotating parents and requests as they are visited.
    fn select(&mut self) -> Option<(Arc<SendableGet>, Token, ClientKey, Priority)> {
        let State {
            requests,
            classes,
            in_flight,
            cooldown,
        } = self;
        for (priority, class) in classes.iter_mut() {
            for _ in 0..class.parents.len() {
                let Some(parent) = class.parents.pop_front() else {
                    break;
                };
                class.parents.push_back(parent);
                let Some(queue) = class.requests.get_mut(&parent) else {
                    continue;
                };
                for _ in 0..queue.len() {
                    let Some(id) = queue.pop_front() else {
                        break;
                    };
                    queue.push_back(id);
                    let Some(registered) = requests.get(&id) else {
                        continue;
                    };
                    for token in registered.request.pending() {
                        let item = (id, token);
                        if in_flight.contains_key(&item) || cooldown.contains(&item) {
                            continue;
                        }
                        let Some(key) = registered.request.resolve_key(token) else {
                            continue;
                        };
                        return Some((registered.request.clone(), token, key, *priority));
                    }
                }
            }
        }
        None
    }
}

/// Schedules the requests of one [Partition].
pub struct Scheduler<C: Clock> {
    partition: Partition,
    config: Config<C>,
    metrics: Metrics,
    state: Mutex<State>,
}

impl<C: Clock> Scheduler<C> {
    /// Create a new scheduler for `partition`, registering its metrics with `registry`.
    pub fn new(partition: Partition, config: Config<C>, registry: &mut Registry) -> Self {
        Self {
            partition,
            config,
            metrics: Metrics::init(registry),
            state: Mutex::new(State::default()),
        }
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Returns the current time of the scheduler's clock.
    pub fn current(&self) -> SystemTime {
        self.config.clock.current()
    }

    fn timeout(&self) -> Duration {
        if self.partition.real_time {
            self.config.real_time_timeout
        } else {
            self.config.bulk_timeout
        }
    }

    /// Add `request` to the candidates for dispatch.
    ///
    /// Persistent requests are written to the configured store; if that fails, the registration
    /// is rolled back.
    pub fn register(&self, request: Arc<SendableGet>) -> Result<(), Error> {
        let id = request.id();
        if request.partition() != self.partition {
            return Err(Error::WrongPartition {
                request: id,
                expected: request.partition(),
                actual: self.partition,
            });
        }
        if request.is_finished() {
            return Err(Error::InvalidRequest("request has nothing to fetch"));
        }
        let persistent = request.persistent();
        if persistent && self.config.persistence.is_none() {
            return Err(Error::PersistenceUnavailable(id));
        }

        let priority = request.priority();
        {
            let mut state = self.state.lock().unwrap();
            if state.requests.contains_key(&id) {
                return Err(Error::AlreadyRegistered(id));
            }

            // Restored requests may still be cooling down
            for token in request.pending() {
                if let Some(wakeup) = request.cooldown_wakeup(token) {
                    state.cooldown.put((id, token), wakeup);
                }
            }
            state
                .classes
                .entry(priority)
                .or_default()
                .insert(request.parent_id(), id);
            state.requests.insert(
                id,
                Registered {
                    request: request.clone(),
                    priority,
                },
            );

            if let (true, Some(store)) = (persistent, &self.config.persistence) {
                if let Err(err) = store.store(&request.snapshot()) {
                    warn!(request = %id, ?err, "failed to persist request");
                    self.detach(&mut state, id);
                    self.observe(&state);
                    return Err(err);
                }
            }
            self.observe(&state);
        }
        self.config.admission.add_request(id, persistent, priority);
        debug!(request = %id, partition = %self.partition, ?priority, "registered request");
        Ok(())
    }

    /// Remove `request` from the scheduler, purging its in-flight tokens and cooldowns.
    ///
    /// Admission control is told the request left `previous`, or the class it was filed under if
    /// `None`. Unregistering an unknown request does nothing.
    pub fn unregister(
        &self,
        request: RequestId,
        previous: Option<Priority>,
    ) -> Option<Arc<SendableGet>> {
        let registered = {
            let mut state = self.state.lock().unwrap();
            let registered = self.detach(&mut state, request);
            self.observe(&state);
            registered
        }?;
        self.config.admission.remove_request(
            request,
            registered.request.persistent(),
            previous.unwrap_or(registered.priority),
        );
        debug!(%request, "unregistered request");
        Some(registered.request)
    }

    /// Unregister `request` and report [Code::Cancelled] to its parent.
    ///
    /// Outstanding reports for its tokens are ignored afterwards.
    pub fn cancel(&self, request: RequestId) -> bool {
        let Some(get) = self.unregister(request, None) else {
            return false;
        };
        get.on_failure(
            &LowLevelGetError::new(Code::Cancelled),
            None,
            self.config.clock.current(),
        );
        true
    }

    /// Move `request` to `priority`, returning the class it was filed under.
    pub fn reprioritize(&self, request: RequestId, priority: Priority) -> Option<Priority> {
        let (get, previous) = {
            let mut state = self.state.lock().unwrap();
            let State {
                requests, classes, ..
            } = &mut *state;
            let registered = requests.get_mut(&request)?;
            let previous = registered.priority;
            if previous == priority {
                return Some(previous);
            }

            let parent = registered.request.parent_id();
            if let Some(class) = classes.get_mut(&previous) {
                class.remove(parent, request);
                if class.is_empty() {
                    classes.remove(&previous);
                }
            }
            classes.entry(priority).or_default().insert(parent, request);
            registered.priority = priority;
            registered.request.set_priority(priority);
            self.persist(&registered.request);
            (registered.request.clone(), previous)
        };
        let persistent = get.persistent();
        self.config
            .admission
            .remove_request(request, persistent, previous);
        self.config
            .admission
            .add_request(request, persistent, priority);
        Some(previous)
    }

    /// Hand the most urgent eligible token to a dispatch worker.
    ///
    /// Tokens that missed their deadline are failed first. The returned token is in flight until
    /// it is reported or times out, and will not be returned again meanwhile.
    pub fn choose_request(&self) -> Option<ChosenBlock> {
        self.expire_in_flight();
        let now = self.config.clock.current();
        let chosen = {
            let mut state = self.state.lock().unwrap();
            let expired = state.cooldown.expire(now);
            if self.config.log_minor {
                for (request, token) in expired.iter() {
                    debug!(%request, %token, "cooldown expired");
                }
            }
            let chosen = state.select().map(|(request, token, key, priority)| {
                let deadline = now + self.timeout();
                state.in_flight.insert((request.id(), token), Some(deadline));
                ChosenBlock {
                    parent: request.parent_id(),
                    token,
                    key,
                    priority,
                    real_time: request.real_time(),
                    persistent: request.persistent(),
                    settings: request.fetch_settings(),
                    deadline,
                    request,
                }
            });
            self.observe(&state);
            chosen
        }?;
        self.metrics.chosen.inc();
        if self.config.log_minor {
            debug!(
                request = %chosen.request.id(),
                token = %chosen.token,
                priority = ?chosen.priority,
                "chose request"
            );
        }
        Some(chosen)
    }

    /// Fail all in-flight tokens whose deadline has passed with [Code::TransferFailed].
    ///
    /// Returns the number of expired tokens.
    pub fn expire_in_flight(&self) -> usize {
        let now = self.config.clock.current();
        let expired: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            let State {
                requests,
                in_flight,
                ..
            } = &mut *state;
            let mut orphaned = Vec::new();
            let expired: Vec<_> = in_flight
                .iter_mut()
                .filter_map(|(item, deadline)| {
                    if !deadline.is_some_and(|deadline| deadline <= now) {
                        return None;
                    }
                    *deadline = None;
                    match requests.get(&item.0) {
                        Some(registered) => Some((registered.request.clone(), item.1)),
                        None => {
                            orphaned.push(*item);
                            None
                        }
                    }
                })
                .collect();
            for item in orphaned.iter() {
                in_flight.remove(item);
            }
            expired
        };
        for (request, token) in expired.iter() {
            self.metrics.timeouts.inc();
            debug!(request = %request.id(), %token, "dispatch timed out");
            self.fail(
                request,
                Some(*token),
                LowLevelGetError::with_message(Code::TransferFailed, "dispatch timed out"),
            );
        }
        expired.len()
    }

    /// Record that the in-flight `token` of `request` was fetched.
    ///
    /// Returns `false` if the report is stale (the token is not in flight).
    pub fn succeeded(&self, request: RequestId, token: Token) -> bool {
        let Some(get) = self.claim(request, token) else {
            if self.config.log_minor {
                debug!(%request, %token, "ignoring stale success");
            }
            return false;
        };
        self.metrics.succeeded.inc();
        get.on_success(token);
        self.settle(&get, Some(token));
        true
    }

    /// Record that fetching the in-flight `token` of `request` failed.
    ///
    /// Returns `false` if the report is stale (the token is not in flight).
    pub fn failed(&self, request: RequestId, token: Token, error: LowLevelGetError) -> bool {
        self.report_failure(request, Some(token), error)
    }

    /// Record a failure of `token`, or of the whole request if `None`.
    ///
    /// Transient failures of a token put it in cooldown; a token or request that finished is
    /// reported to its parent.
    pub fn report_failure(
        &self,
        request: RequestId,
        token: Option<Token>,
        error: LowLevelGetError,
    ) -> bool {
        let get = match token {
            Some(token) => self.claim(request, token),
            None => self
                .state
                .lock()
                .unwrap()
                .requests
                .get(&request)
                .map(|registered| registered.request.clone()),
        };
        let Some(get) = get else {
            if self.config.log_minor {
                debug!(%request, ?token, %error, "ignoring stale failure");
            }
            return false;
        };
        self.fail(&get, token, error);
        true
    }

    /// Returns the earliest cooldown wake-up or dispatch deadline.
    pub fn next_wakeup(&self) -> Option<SystemTime> {
        let state = self.state.lock().unwrap();
        let deadline = state.in_flight.values().flatten().min().copied();
        match (state.cooldown.next_wakeup(), deadline) {
            (Some(wakeup), Some(deadline)) => Some(wakeup.min(deadline)),
            (wakeup, deadline) => wakeup.or(deadline),
        }
    }

    /// Returns the number of tokens still to fetch for requests filed under `priority`.
    pub fn outstanding(&self, priority: Priority) -> usize {
        let state = self.state.lock().unwrap();
        state
            .requests
            .values()
            .filter(|registered| registered.priority == priority)
            .map(|registered| registered.request.pending_count())
            .sum()
    }

    /// Returns the class `request` is filed under and its number of tokens still to fetch.
    pub fn accounted(&self, request: RequestId) -> Option<(Priority, usize)> {
        let state = self.state.lock().unwrap();
        let registered = state.requests.get(&request)?;
        Some((registered.priority, registered.request.pending_count()))
    }

    /// Returns the requests registered by `parent`.
    pub fn requests_of(&self, parent: ParentId) -> Vec<RequestId> {
        let state = self.state.lock().unwrap();
        let mut requests: Vec<_> = state
            .requests
            .iter()
            .filter(|(_, registered)| registered.request.parent_id() == parent)
            .map(|(id, _)| *id)
            .collect();
        requests.sort();
        requests
    }

    /// Returns the number of registered requests.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of tokens held by workers.
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }

    /// Returns the number of tokens cooling down.
    pub fn cooling(&self) -> usize {
        self.state.lock().unwrap().cooldown.len()
    }

    /// Take responsibility for reporting the in-flight `token` of `request`.
    fn claim(&self, request: RequestId, token: Token) -> Option<Arc<SendableGet>> {
        let mut state = self.state.lock().unwrap();
        let deadline = state.in_flight.get_mut(&(request, token))?;
        deadline.take()?;
        state
            .requests
            .get(&request)
            .map(|registered| registered.request.clone())
    }

    fn fail(&self, request: &Arc<SendableGet>, token: Option<Token>, error: LowLevelGetError) {
        self.metrics
            .failed
            .get_or_create(&FailureLabel::from(error.code()))
            .inc();
        if self.config.log_minor || error.code().class() != Class::Transient {
            debug!(request = %request.id(), ?token, %error, "fetch failed");
        }
        request.on_failure(&error, token, self.config.clock.current());
        self.settle(request, token);
    }

    /// Update scheduler state after the outcome of `token` (or of the whole request) was
    /// recorded on `request`.
    fn settle(&self, request: &Arc<SendableGet>, token: Option<Token>) {
        let id = request.id();
        let removed = {
            let mut state = self.state.lock().unwrap();
            if !state.requests.contains_key(&id) {
                return;
            }
            match token {
                Some(token) => {
                    let item = (id, token);
                    state.in_flight.remove(&item);
                    match request.cooldown_wakeup(token) {
                        Some(wakeup) => state.cooldown.put(item, wakeup),
                        None => {
                            state.cooldown.remove(&item);
                        }
                    }
                }
                None => {
                    state.in_flight.retain(|(r, _), _| *r != id);
                    state.cooldown.remove_request(id);
                }
            }
            let removed = if request.is_finished() {
                self.detach(&mut state, id)
            } else {
                self.persist(request);
                None
            };
            self.observe(&state);
            removed
        };
        if let Some(removed) = removed {
            self.config
                .admission
                .remove_request(id, request.persistent(), removed.priority);
            debug!(request = %id, "request finished");
        }
    }

    /// Remove every trace of `request` from `state` and the store.
    fn detach(&self, state: &mut State, request: RequestId) -> Option<Registered> {
        let registered = state.requests.remove(&request)?;
        if let Some(class) = state.classes.get_mut(&registered.priority) {
            class.remove(registered.request.parent_id(), request);
            if class.is_empty() {
                state.classes.remove(&registered.priority);
            }
        }
        state.in_flight.retain(|(r, _), _| *r != request);
        state.cooldown.remove_request(request);
        if let (true, Some(store)) = (
            registered.request.persistent(),
            &self.config.persistence,
        ) {
            if let Err(err) = store.delete(request) {
                error!(%request, ?err, "failed to delete request");
            }
        }
        Some(registered)
    }

    /// Write `request` through to the store if it is persistent.
    fn persist(&self, request: &SendableGet) {
        if !request.persistent() {
            return;
        }
        let Some(store) = &self.config.persistence else {
            return;
        };
        if let Err(err) = store.store(&request.snapshot()) {
            error!(request = %request.id(), ?err, "failed to persist request");
        }
    }

    fn observe(&self, state: &State) {
        self.metrics.requests.set(state.requests.len() as i64);
        self.metrics.in_flight.set(state.in_flight.len() as i64);
        self.metrics.cooling.set(state.cooldown.len() as i64);
    }
}

/// The schedulers of all [Partition]s.
pub struct Schedulers<C: Clock> {
    schedulers: [Scheduler<C>; 4],
    persistence: Option<Arc<dyn Persistence>>,
}

impl<C: Clock> Schedulers<C> {
    /// Create a scheduler per partition, registering the metrics of each under its label.
    pub fn new(config: Config<C>, registry: &mut Registry) -> Self {
        let persistence = config.persistence.clone();
        let schedulers = Partition::ALL.map(|partition| {
            Scheduler::new(
                partition,
                config.clone(),
                registry.sub_registry_with_prefix(partition.label()),
            )
        });
        Self {
            schedulers,
            persistence,
        }
    }

    fn index(partition: Partition) -> usize {
        let base = match partition.key_type {
            KeyType::Chk => 0,
            KeyType::Ssk => 2,
        };
        base + partition.real_time as usize
    }

    pub fn scheduler(&self, partition: Partition) -> &Scheduler<C> {
        &self.schedulers[Self::index(partition)]
    }

    /// Returns the scheduler responsible for `request`.
    pub fn scheduler_for(&self, request: &SendableGet) -> &Scheduler<C> {
        self.scheduler(request.partition())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scheduler<C>> {
        self.schedulers.iter()
    }

    /// Register `request` with the scheduler responsible for it.
    pub fn register(&self, request: Arc<SendableGet>) -> Result<(), Error> {
        self.scheduler_for(&request).register(request)
    }

    /// Reload and register every stored request after a restart.
    ///
    /// Requests whose parent is not in `parents`, that cannot be decoded, or that are broken
    /// (stored but not persistent) are deleted. Broken requests are reported to their parent as
    /// [Code::InternalError]. A failure affecting one entry is logged and does not stop the
    /// others from being restored.
    ///
    /// Restored requests stay active in the store while they are registered; they are deleted
    /// once they finish or are cancelled. Returns the number of restored requests.
    pub fn restore(&self, parents: &HashMap<ParentId, Arc<dyn Requester>>) -> Result<usize, Error> {
        let Some(store) = &self.persistence else {
            return Ok(0);
        };
        let discard = |id: RequestId| {
            if let Err(err) = store.delete(id) {
                error!(request = %id, ?err, "failed to delete request");
            }
        };
        let mut restored = 0;
        for id in store.list()? {
            let snapshot = match store.activate(id) {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(err) => {
                    error!(request = %id, ?err, "failed to load request");
                    continue;
                }
            };
            let Some(parent) = parents.get(&snapshot.parent) else {
                warn!(request = %id, parent = %snapshot.parent, "dropping orphaned request");
                discard(id);
                continue;
            };
            let request = match SendableGet::from_snapshot(snapshot, parent.clone()) {
                Ok(request) => request,
                Err(err) => {
                    error!(request = %id, ?err, "dropping invalid request");
                    discard(id);
                    continue;
                }
            };
            match request.is_storage_broken(store.as_ref()) {
                Ok(false) => {}
                Ok(true) => {
                    discard(id);
                    request.on_failure(
                        &LowLevelGetError::with_message(Code::InternalError, "storage broken"),
                        None,
                        self.scheduler_for(&request).current(),
                    );
                    continue;
                }
                Err(err) => {
                    error!(request = %id, ?err, "skipping request");
                    continue;
                }
            }
            if request.is_finished() {
                discard(id);
                continue;
            }
            if let Err(err) = self.register(Arc::new(request)) {
                error!(request = %id, ?err, "failed to restore request");
                continue;
            }
            restored += 1;
        }
        debug!(restored, "restored requests");
        Ok(restored)
    }

    /// Cancel every request of `parent`, returning the number of cancelled requests.
    pub fn cancel_parent(&self, parent: ParentId) -> usize {
        let mut cancelled = 0;
        for scheduler in self.schedulers.iter() {
            for request in scheduler.requests_of(parent) {
                if scheduler.cancel(request) {
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    /// Returns the earliest wake-up across all partitions.
    pub fn next_wakeup(&self) -> Option<SystemTime> {
        self.schedulers
            .iter()
            .filter_map(|scheduler| scheduler.next_wakeup())
            .min()
    }
}
