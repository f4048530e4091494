use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::api::ApplicationsApi;
use crate::cache::{CacheStore, CacheValue, QueryKey, StoreEvent, Subscription};
use crate::error::{ApiError, ApiResult};
use crate::models::{Application, CompleteApplication};

// --- Retry policy ---

/// Shared by every query so all entity types retry the same way.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retry_if: fn(&ApiError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            retry_if: ApiError::is_retryable,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn should_retry(&self, err: &ApiError, attempt: u32) -> bool {
        attempt < self.max_attempts && (self.retry_if)(err)
    }

    /// Exponential backoff after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if delay.is_zero() {
            return delay;
        }
        delay.mul_f64(rand::thread_rng().gen_range(0.8..=1.2))
    }
}

// --- Query state ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Nothing requested, or the key has no usable identifier.
    Idle,
    /// First fetch in progress, no data yet.
    Loading,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub status: QueryStatus,
    pub data: Option<CacheValue>,
    pub error: Option<ApiError>,
    pub is_fetching: bool,
    pub is_stale: bool,
    pub failure_count: u32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl QueryState {
    pub fn idle() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            is_fetching: false,
            is_stale: false,
            failure_count: 0,
            updated_at: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn applications(&self) -> Option<&[Application]> {
        self.data.as_ref().and_then(CacheValue::as_applications)
    }

    pub fn application(&self) -> Option<&CompleteApplication> {
        self.data.as_ref().and_then(CacheValue::as_application)
    }
}

// --- Coordinator ---

type SharedFetch = Shared<BoxFuture<'static, ApiResult<CacheValue>>>;
type StateListener = Arc<dyn Fn(&QueryState) + Send + Sync>;

struct Slot {
    status: QueryStatus,
    error: Option<ApiError>,
    failure_count: u32,
    /// Latest fetch; callers join this one.
    in_flight: Option<(u64, SharedFetch)>,
    /// Requests not yet completed, including ones a forced refetch superseded.
    outstanding: usize,
    listeners: Vec<(u64, StateListener)>,
    store_subscription: Option<Subscription>,
}

impl Slot {
    fn new() -> Self {
        Self {
            status: QueryStatus::Idle,
            error: None,
            failure_count: 0,
            in_flight: None,
            outstanding: 0,
            listeners: Vec::new(),
            store_subscription: None,
        }
    }

    fn listeners(&self) -> Vec<StateListener> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

struct Inner {
    store: CacheStore,
    api: Arc<dyn ApplicationsApi>,
    policy: RetryPolicy,
    slots: Mutex<HashMap<QueryKey, Slot>>,
    next_id: AtomicU64,
}

/// Resolves query keys against the API, de-duplicating concurrent requests.
#[derive(Clone)]
pub struct QueryCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for QueryCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCoordinator")
            .field("store", &self.inner.store)
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl QueryCoordinator {
    pub fn new(store: CacheStore, api: Arc<dyn ApplicationsApi>, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                api,
                policy,
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    /// Current best-known state for `key`, without triggering anything.
    pub fn state(&self, key: &QueryKey) -> QueryState {
        self.inner.snapshot(key)
    }

    /// Returns the state for `key`, fetching first when nothing is cached.
    ///
    /// A stale value is returned immediately while a background refetch runs.
    pub async fn query(&self, key: &QueryKey) -> QueryState {
        if !key.is_addressable() {
            return QueryState::idle();
        }
        match self.inner.store.read(key) {
            Some(entry) if !entry.stale => {}
            Some(_) => {
                let _ = self.start_fetch(key, false);
            }
            None => {
                let (fetch, _) = self.start_fetch(key, false);
                let _ = fetch.await;
            }
        }
        self.inner.snapshot(key)
    }

    /// Fresh value for `key`: served from cache when fresh, otherwise joined
    /// to (or issued as) the single in-flight request.
    pub async fn fetch(&self, key: &QueryKey) -> ApiResult<CacheValue> {
        if !key.is_addressable() {
            return Err(ApiError::InvalidInput(format!("Cannot fetch '{}' without an id", key)));
        }
        if let Some(entry) = self.inner.store.read(key) {
            if !entry.stale {
                return Ok(entry.value);
            }
        }
        let (fetch, _) = self.start_fetch(key, false);
        fetch.await
    }

    /// Forces a new request even if one is already in flight. The response
    /// that completes last is the one left in the cache.
    pub async fn refetch(&self, key: &QueryKey) -> ApiResult<CacheValue> {
        if !key.is_addressable() {
            return Err(ApiError::InvalidInput(format!("Cannot fetch '{}' without an id", key)));
        }
        let (fetch, _) = self.start_fetch(key, true);
        fetch.await
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.inner
            .slots
            .lock()
            .get(key)
            .is_some_and(|slot| slot.outstanding > 0)
    }

    /// Registers an observer for `key`. The callback receives the current
    /// state right away and after every transition. The first observer of a
    /// key with no fresh value triggers a fetch.
    pub fn subscribe<F>(&self, key: &QueryKey, callback: F) -> Subscription
    where
        F: Fn(&QueryState) + Send + Sync + 'static,
    {
        if !key.is_addressable() {
            callback(&QueryState::idle());
            return Subscription::new(|| {});
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: StateListener = Arc::new(callback);
        {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
            slot.listeners.push((id, Arc::clone(&callback)));
            if slot.store_subscription.is_none() {
                slot.store_subscription = Some(self.watch_store(key));
            }
        }

        let needs_fetch = self.inner.store.read(key).is_none_or(|entry| entry.stale);
        let started = needs_fetch && self.start_fetch(key, false).1;
        if !started {
            // Joining an existing fetch or fresh data: the new observer still
            // needs its initial state.
            callback(&self.inner.snapshot(key));
        }

        let weak = Arc::downgrade(&self.inner);
        let key = key.clone();
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_listener(&key, id);
            }
        })
    }

    /// Observable handle for `key`, suitable for a presentation layer.
    pub fn watch(&self, key: &QueryKey) -> QueryHandle {
        let (tx, rx) = watch::channel(self.inner.snapshot(key));
        let subscription = self.subscribe(key, move |state| {
            tx.send_replace(state.clone());
        });
        QueryHandle {
            key: key.clone(),
            rx,
            _subscription: subscription,
        }
    }

    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.inner
            .slots
            .lock()
            .get(key)
            .map_or(0, |slot| slot.listeners.len())
    }

    /// Reacts to invalidations of `key` while it has observers.
    fn watch_store(&self, key: &QueryKey) -> Subscription {
        let weak = Arc::downgrade(&self.inner);
        self.inner.store.subscribe(key, move |key, event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let coordinator = QueryCoordinator { inner };
            match event {
                StoreEvent::Written => coordinator.inner.notify(key),
                StoreEvent::Invalidated => {
                    if coordinator.is_fetching(key) {
                        // The in-flight request predates the invalidation; its
                        // completion re-marks the value stale and refetches.
                        coordinator.inner.notify(key);
                    } else {
                        let _ = coordinator.start_fetch(key, false);
                    }
                }
            }
        })
    }

    /// Returns the in-flight fetch for `key`, issuing one if needed (or
    /// always, with `force`). The flag is true when a new request started.
    fn start_fetch(&self, key: &QueryKey, force: bool) -> (SharedFetch, bool) {
        let fetch = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
            if !force {
                if let Some((_, fetch)) = &slot.in_flight {
                    debug!(%key, "joining in-flight fetch");
                    return (fetch.clone(), false);
                }
            }

            let generation = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let epoch = self.inner.store.epoch(key);
            let fetch = run_fetch(Arc::clone(&self.inner), key.clone(), generation, epoch)
                .boxed()
                .shared();
            slot.in_flight = Some((generation, fetch.clone()));
            slot.outstanding += 1;
            if !self.inner.store.contains(key) {
                slot.status = QueryStatus::Loading;
                slot.error = None;
            }
            fetch
        };

        debug!(%key, force, "fetch started");
        self.inner.notify(key);

        // Drive the request to completion even if every observer goes away,
        // so the cache is populated for whoever comes back.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(fetch.clone());
            }
            Err(_) => warn!(%key, "no async runtime; fetch runs only when awaited"),
        }
        (fetch, true)
    }
}

impl Inner {
    fn snapshot(&self, key: &QueryKey) -> QueryState {
        if !key.is_addressable() {
            return QueryState::idle();
        }
        let (status, error, failure_count, is_fetching) = {
            let slots = self.slots.lock();
            match slots.get(key) {
                Some(slot) => (
                    slot.status,
                    slot.error.clone(),
                    slot.failure_count,
                    slot.outstanding > 0,
                ),
                None => (QueryStatus::Idle, None, 0, false),
            }
        };
        let entry = self.store.read(key);
        let status = match (&entry, status) {
            // Data written by someone else counts as a success.
            (Some(_), QueryStatus::Idle | QueryStatus::Loading) => QueryStatus::Success,
            (_, status) => status,
        };
        QueryState {
            status,
            error,
            is_fetching,
            failure_count,
            is_stale: entry.as_ref().is_some_and(|e| e.stale),
            updated_at: entry.as_ref().map(|e| e.updated_at),
            data: entry.map(|e| e.value),
        }
    }

    fn notify(&self, key: &QueryKey) {
        let listeners = match self.slots.lock().get(key) {
            Some(slot) => slot.listeners(),
            None => return,
        };
        if listeners.is_empty() {
            return;
        }
        let state = self.snapshot(key);
        for listener in listeners {
            listener(&state);
        }
    }

    fn remove_listener(&self, key: &QueryKey, id: u64) {
        let subscription = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(key) else {
                return;
            };
            slot.listeners.retain(|(listener_id, _)| *listener_id != id);
            if slot.listeners.is_empty() {
                slot.store_subscription.take()
            } else {
                None
            }
        };
        // Unsubscribing locks the store; do it outside the slot lock.
        drop(subscription);
    }

    /// Records the outcome of fetch `generation` and publishes it.
    fn complete(&self, key: &QueryKey, generation: u64, epoch: u64, result: &ApiResult<CacheValue>, attempts: u32) {
        let listeners = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
            if slot.in_flight.as_ref().is_some_and(|(current, _)| *current == generation) {
                slot.in_flight = None;
            }
            slot.outstanding = slot.outstanding.saturating_sub(1);
            match result {
                Ok(_) => {
                    slot.status = QueryStatus::Success;
                    slot.error = None;
                    slot.failure_count = 0;
                }
                Err(err) => {
                    slot.status = QueryStatus::Error;
                    slot.error = Some(err.clone());
                    slot.failure_count = attempts;
                }
            }
            slot.listeners()
        };

        match result {
            Ok(value) => {
                // Observers hear about the write through the store.
                self.store.write(key, value.clone());
                if self.store.epoch(key) != epoch {
                    debug!(%key, "invalidated while in flight; refetching");
                    self.store.invalidate(key);
                }
            }
            Err(_) => {
                let state = self.snapshot(key);
                for listener in listeners {
                    listener(&state);
                }
            }
        }
    }
}

async fn run_fetch(inner: Arc<Inner>, key: QueryKey, generation: u64, epoch: u64) -> ApiResult<CacheValue> {
    let policy = inner.policy;
    let mut attempt = 0;
    let result = loop {
        attempt += 1;
        match fetch_key(inner.api.as_ref(), &key).await {
            Ok(value) => break Ok(value),
            Err(err) => {
                if !policy.should_retry(&err, attempt) {
                    warn!(%key, attempt, status = err.status(), error = %err, "fetch failed");
                    break Err(err);
                }
                let delay = policy.jittered_backoff(attempt);
                debug!(%key, attempt, status = err.status(), ?delay, "fetch failed; retrying");
                tokio::time::sleep(delay).await;
            }
        }
    };
    inner.complete(&key, generation, epoch, &result, attempt);
    result
}

async fn fetch_key(api: &dyn ApplicationsApi, key: &QueryKey) -> ApiResult<CacheValue> {
    match key {
        QueryKey::Applications => api.list_applications().await.map(CacheValue::Applications),
        QueryKey::Application(id) => api
            .get_application(id)
            .await
            .map(|detail| CacheValue::Application(Box::new(detail))),
    }
}

// --- Observable handle ---

/// A live view of one key: current data, loading flag and error.
/// Dropping the handle ends the observation.
pub struct QueryHandle {
    key: QueryKey,
    rx: watch::Receiver<QueryState>,
    _subscription: Subscription,
}

impl QueryHandle {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn state(&self) -> QueryState {
        self.rx.borrow().clone()
    }

    pub fn data(&self) -> Option<CacheValue> {
        self.rx.borrow().data.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.rx.borrow().is_loading()
    }

    pub fn is_fetching(&self) -> bool {
        self.rx.borrow().is_fetching
    }

    pub fn error(&self) -> Option<ApiError> {
        self.rx.borrow().error.clone()
    }

    /// Waits for the next state transition. Returns the new state.
    pub async fn changed(&mut self) -> QueryState {
        // The sender lives as long as the subscription we own.
        let _ = self.rx.changed().await;
        self.rx.borrow_and_update().clone()
    }

    /// Waits until no fetch is running for the key.
    pub async fn settled(&mut self) -> QueryState {
        if let Ok(state) = self.rx.wait_for(|state| !state.is_fetching).await {
            return state.clone();
        }
        self.state()
    }
}

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("key", &self.key)
            .field("state", &*self.rx.borrow())
            .finish()
    }
}
