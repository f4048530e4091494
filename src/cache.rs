use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::models::{Application, CompleteApplication};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    /// The un-keyed collection listing.
    Applications,
    /// Detail aggregate for one application id.
    Application(String),
}

impl QueryKey {
    pub fn application(id: impl Into<String>) -> Self {
        QueryKey::Application(id.into())
    }

    /// False when the key names a detail record with no usable id.
    pub fn is_addressable(&self) -> bool {
        match self {
            QueryKey::Applications => true,
            QueryKey::Application(id) => !id.trim().is_empty(),
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::Applications => f.write_str("applications"),
            QueryKey::Application(id) => write!(f, "applications/{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Applications(Vec<Application>),
    Application(Box<CompleteApplication>),
}

impl CacheValue {
    pub fn as_applications(&self) -> Option<&[Application]> {
        match self {
            CacheValue::Applications(apps) => Some(apps),
            CacheValue::Application(_) => None,
        }
    }

    pub fn as_application(&self) -> Option<&CompleteApplication> {
        match self {
            CacheValue::Application(detail) => Some(detail),
            CacheValue::Applications(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: CacheValue,
    pub stale: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// A fresh value was written.
    Written,
    /// The value (if any) was marked stale and should be refetched.
    Invalidated,
}

type Listener = Arc<dyn Fn(&QueryKey, StoreEvent) + Send + Sync>;

#[derive(Default)]
struct StoreInner {
    entries: HashMap<QueryKey, CacheEntry>,
    listeners: HashMap<QueryKey, Vec<(u64, Listener)>>,
    /// Bumped on every invalidation, whether or not a value is cached.
    epochs: HashMap<QueryKey, u64>,
    next_listener: u64,
}

#[derive(Clone, Default)]
pub struct CacheStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CacheStore")
            .field("entries", &inner.entries.len())
            .field("listeners", &inner.listeners.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current entry for `key`, stale or fresh. Never blocks on a fetch.
    pub fn read(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub fn value(&self, key: &QueryKey) -> Option<CacheValue> {
        self.read(key).map(|entry| entry.value)
    }

    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.inner.lock().entries.get(key).is_some_and(|entry| entry.stale)
    }

    /// Invalidation counter for `key`. A fetch that observes a different
    /// epoch on completion than at its start raced an invalidation.
    pub fn epoch(&self, key: &QueryKey) -> u64 {
        self.inner.lock().epochs.get(key).copied().unwrap_or(0)
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Replaces the value for `key` and marks it fresh.
    pub fn write(&self, key: &QueryKey, value: CacheValue) {
        let listeners = {
            let mut inner = self.inner.lock();
            inner.entries.insert(
                key.clone(),
                CacheEntry {
                    value,
                    stale: false,
                    updated_at: Utc::now(),
                },
            );
            inner.listeners_for(key)
        };
        trace!(%key, "cache write");
        notify(key, StoreEvent::Written, &listeners);
    }

    /// Marks `key` stale without dropping its value.
    pub fn invalidate(&self, key: &QueryKey) {
        self.invalidate_many(std::slice::from_ref(key));
    }

    /// Marks every key stale first, then notifies, so listeners observe one
    /// consistent round of invalidations.
    pub fn invalidate_many(&self, keys: &[QueryKey]) {
        let pending: Vec<(QueryKey, Vec<Listener>)> = {
            let mut inner = self.inner.lock();
            let mut pending = Vec::with_capacity(keys.len());
            for key in keys {
                if pending.iter().any(|(seen, _)| seen == key) {
                    continue;
                }
                if let Some(entry) = inner.entries.get_mut(key) {
                    entry.stale = true;
                }
                *inner.epochs.entry(key.clone()).or_insert(0) += 1;
                pending.push((key.clone(), inner.listeners_for(key)));
            }
            pending
        };

        debug!(keys = ?pending.iter().map(|(k, _)| k.to_string()).collect::<Vec<_>>(), "cache invalidate");
        for (key, listeners) in &pending {
            notify(key, StoreEvent::Invalidated, listeners);
        }
    }

    /// Registers `callback` for changes to `key`. Dropping the returned
    /// [`Subscription`] unsubscribes.
    pub fn subscribe<F>(&self, key: &QueryKey, callback: F) -> Subscription
    where
        F: Fn(&QueryKey, StoreEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner
            .listeners
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        let store = Arc::downgrade(&self.inner);
        let key = key.clone();
        Subscription::new(move || {
            if let Some(store) = store.upgrade() {
                remove_listener(&store, &key, id);
            }
        })
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.inner.lock().listeners.get(key).map_or(0, Vec::len)
    }
}

impl StoreInner {
    fn listeners_for(&self, key: &QueryKey) -> Vec<Listener> {
        self.listeners
            .get(key)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }
}

fn remove_listener(store: &Mutex<StoreInner>, key: &QueryKey, id: u64) {
    let mut inner = store.lock();
    if let Some(list) = inner.listeners.get_mut(key) {
        list.retain(|(listener_id, _)| *listener_id != id);
        if list.is_empty() {
            inner.listeners.remove(key);
        }
    }
}

fn notify(key: &QueryKey, event: StoreEvent, listeners: &[Listener]) {
    for listener in listeners {
        listener(key, event);
    }
}

// --- Subscription handle ---

/// Unsubscribes when dropped or when [`Subscription::unsubscribe`] is called.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
