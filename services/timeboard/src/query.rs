//! Keyed query cache with deduplicated background fetches
//!
//! Every key owns a small state machine: `idle -> fetching -> (success | error)`.
//! Fetch tasks never touch the entry map. They report progress as
//! [`CacheEvent`]s over an mpsc channel and a single driver task applies the
//! transitions, then publishes the new entry through the key's `watch`
//! channel. Each fetch carries an id; the driver drops events whose id is
//! not the key's current in-flight fetch, so a cancelled fetch can never
//! write to the cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Identifies one cache entry (the API path)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(String);

impl QueryKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueryKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for QueryKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Outcome-level status of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    Error,
    Success,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Pending => write!(f, "pending"),
            QueryStatus::Error => write!(f, "error"),
            QueryStatus::Success => write!(f, "success"),
        }
    }
}

/// Whether a fetch for the entry is currently running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Idle,
    Fetching,
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchStatus::Idle => write!(f, "idle"),
            FetchStatus::Fetching => write!(f, "fetching"),
        }
    }
}

/// Cached state for one key
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEntry<T> {
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    /// Last successful payload; kept when a later fetch fails
    pub data: Option<T>,
    pub error_message: Option<String>,
    pub data_updated_at: Option<Instant>,
    pub error_updated_at: Option<Instant>,
    /// Failed attempts of the current or last fetch
    pub failure_count: u32,
    /// Fetches started for this key
    pub fetch_count: u64,
    pub is_invalidated: bool,
}

impl<T> QueryEntry<T> {
    fn new() -> Self {
        Self {
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            data: None,
            error_message: None,
            data_updated_at: None,
            error_updated_at: None,
            failure_count: 0,
            fetch_count: 0,
            is_invalidated: false,
        }
    }

    /// Nothing to show yet
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Pending && self.data.is_none()
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    pub fn is_stale(&self, stale_time: Duration, now: Instant) -> bool {
        if self.is_invalidated {
            return true;
        }
        match self.data_updated_at {
            None => true,
            Some(updated_at) => now.saturating_duration_since(updated_at) >= stale_time,
        }
    }
}

/// Exponential backoff between fetch attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first failure
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn never() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Delay after the `failure_index`-th failure (0-based)
    pub fn delay_for(&self, failure_index: u32) -> Duration {
        2u32.checked_pow(failure_index)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Cache-wide behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// How long data counts as fresh after a successful fetch
    pub stale_time: Duration,
    pub retry: RetryPolicy,
}

/// Produces the data for a key
#[async_trait]
pub trait QueryFn<T>: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> crate::Result<T>;
}

/// Devtools view of one entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub key: QueryKey,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub observers: usize,
    pub failure_count: u32,
    pub fetch_count: u64,
    pub data_age_ms: Option<u64>,
    pub stale: bool,
    pub error: Option<String>,
}

/// Progress reported by fetch tasks to the driver
#[derive(Debug)]
enum CacheEvent<T> {
    Retrying {
        key: QueryKey,
        fetch_id: u64,
        failure_count: u32,
    },
    Settled {
        key: QueryKey,
        fetch_id: u64,
        failure_count: u32,
        result: std::result::Result<T, String>,
    },
}

struct InFlight {
    id: u64,
    cancel: CancellationToken,
}

struct Slot<T> {
    sender: watch::Sender<QueryEntry<T>>,
    observers: usize,
    in_flight: Option<InFlight>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        let (sender, _) = watch::channel(QueryEntry::new());
        Self {
            sender,
            observers: 0,
            in_flight: None,
        }
    }

    fn is_current(&self, fetch_id: u64) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.id == fetch_id)
    }
}

struct Inner<T> {
    slots: Mutex<HashMap<QueryKey, Slot<T>>>,
    query_fn: Arc<dyn QueryFn<T>>,
    options: QueryOptions,
    events: mpsc::UnboundedSender<CacheEvent<T>>,
    next_fetch_id: AtomicU64,
    /// Bumped on every entry change, across all keys
    revision: watch::Sender<u64>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    // The map is never locked across an await, and observer drops need it synchronously.
    fn slots(&self) -> MutexGuard<'_, HashMap<QueryKey, Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, slot: &Slot<T>, update: impl FnOnce(&mut QueryEntry<T>)) {
        slot.sender.send_modify(update);
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn start_fetch(&self, key: &QueryKey, slot: &mut Slot<T>) -> bool {
        if self.cancel.is_cancelled() {
            tracing::debug!("Cache is shut down, not fetching '{}'", key);
            return false;
        }
        if let Some(in_flight) = &slot.in_flight {
            tracing::debug!("Fetch #{} for '{}' already in flight", in_flight.id, key);
            return false;
        }

        let fetch_id = self.next_fetch_id.fetch_add(1, Ordering::SeqCst);
        let cancel = self.cancel.child_token();
        slot.in_flight = Some(InFlight {
            id: fetch_id,
            cancel: cancel.clone(),
        });
        self.publish(slot, |entry| {
            entry.fetch_status = FetchStatus::Fetching;
            entry.fetch_count += 1;
        });

        tracing::debug!("Starting fetch #{} for '{}'", fetch_id, key);
        tokio::spawn(run_fetch(FetchTask {
            key: key.clone(),
            fetch_id,
            query_fn: Arc::clone(&self.query_fn),
            retry: self.options.retry.clone(),
            events: self.events.clone(),
            cancel,
        }));
        true
    }

    fn apply(&self, event: CacheEvent<T>) {
        let mut slots = self.slots();
        match event {
            CacheEvent::Retrying {
                key,
                fetch_id,
                failure_count,
            } => {
                let Some(slot) = slots.get_mut(&key) else {
                    return;
                };
                if !slot.is_current(fetch_id) {
                    tracing::debug!("Ignoring retry of stale fetch #{} for '{}'", fetch_id, key);
                    return;
                }
                self.publish(slot, |entry| entry.failure_count = failure_count);
            }
            CacheEvent::Settled {
                key,
                fetch_id,
                failure_count,
                result,
            } => {
                let Some(slot) = slots.get_mut(&key) else {
                    return;
                };
                if !slot.is_current(fetch_id) {
                    tracing::debug!(
                        "Discarding result of cancelled fetch #{} for '{}'",
                        fetch_id,
                        key
                    );
                    return;
                }
                slot.in_flight = None;

                let now = Instant::now();
                tracing::debug!(
                    "Fetch #{} for '{}' settled: {}",
                    fetch_id,
                    key,
                    if result.is_ok() { "success" } else { "error" }
                );
                self.publish(slot, |entry| {
                    entry.fetch_status = FetchStatus::Idle;
                    match result {
                        Ok(data) => {
                            entry.status = QueryStatus::Success;
                            entry.data = Some(data);
                            entry.data_updated_at = Some(now);
                            entry.error_message = None;
                            entry.failure_count = 0;
                            entry.is_invalidated = false;
                        }
                        Err(message) => {
                            entry.status = QueryStatus::Error;
                            entry.error_message = Some(message);
                            entry.error_updated_at = Some(now);
                            entry.failure_count = failure_count;
                        }
                    }
                });
            }
        }
    }

    fn release_observer(&self, key: &QueryKey) {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        slot.observers = slot.observers.saturating_sub(1);
        tracing::debug!("Observer left '{}' ({} active)", key, slot.observers);

        if slot.observers == 0 {
            if let Some(in_flight) = slot.in_flight.take() {
                tracing::debug!(
                    "Last observer of '{}' left, cancelling fetch #{}",
                    key,
                    in_flight.id
                );
                in_flight.cancel.cancel();
                self.publish(slot, |entry| entry.fetch_status = FetchStatus::Idle);
            }
        }
    }
}

struct FetchTask<T> {
    key: QueryKey,
    fetch_id: u64,
    query_fn: Arc<dyn QueryFn<T>>,
    retry: RetryPolicy,
    events: mpsc::UnboundedSender<CacheEvent<T>>,
    cancel: CancellationToken,
}

async fn run_fetch<T: Send + 'static>(task: FetchTask<T>) {
    let mut failures = 0u32;
    loop {
        let attempt = tokio::select! {
            result = task.query_fn.fetch(&task.key) => result,
            _ = task.cancel.cancelled() => {
                tracing::debug!("Fetch #{} for '{}' cancelled", task.fetch_id, task.key);
                return;
            }
        };

        let event = match attempt {
            Ok(data) => CacheEvent::Settled {
                key: task.key.clone(),
                fetch_id: task.fetch_id,
                failure_count: failures,
                result: Ok(data),
            },
            Err(e) => {
                failures += 1;
                if failures > task.retry.retries {
                    tracing::warn!(
                        "Fetch for '{}' failed after {} attempt(s): {}",
                        task.key,
                        failures,
                        e
                    );
                    CacheEvent::Settled {
                        key: task.key.clone(),
                        fetch_id: task.fetch_id,
                        failure_count: failures,
                        result: Err(e.to_string()),
                    }
                } else {
                    let delay = task.retry.delay_for(failures - 1);
                    tracing::debug!(
                        "Fetch for '{}' failed ({}), retrying in {:?}",
                        task.key,
                        e,
                        delay
                    );
                    let retrying = CacheEvent::Retrying {
                        key: task.key.clone(),
                        fetch_id: task.fetch_id,
                        failure_count: failures,
                    };
                    if task.events.send(retrying).is_err() {
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = task.cancel.cancelled() => {
                            tracing::debug!("Retry for '{}' cancelled", task.key);
                            return;
                        }
                    }
                }
            }
        };

        if task.events.send(event).is_err() {
            tracing::debug!("Cache gone, dropping result for '{}'", task.key);
        }
        return;
    }
}

async fn drive<T: Clone + Send + Sync + 'static>(
    inner: Weak<Inner<T>>,
    mut events: mpsc::UnboundedReceiver<CacheEvent<T>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        let Some(cache) = inner.upgrade() else {
            break;
        };
        cache.apply(event);
    }
    tracing::debug!("Query cache driver stopped");
}

/// Process-wide store of query entries
///
/// Cloning is cheap and yields a handle to the same store. The store lives
/// until [`QueryCache::shutdown`] is called or the last handle is dropped.
pub struct QueryCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for QueryCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> QueryCache<T> {
    /// Create the store and spawn its event driver. Must run inside a tokio runtime.
    pub fn new(query_fn: Arc<dyn QueryFn<T>>, options: QueryOptions) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let inner = Arc::new(Inner {
            slots: Mutex::new(HashMap::new()),
            query_fn,
            options,
            events,
            next_fetch_id: AtomicU64::new(1),
            revision: watch::channel(0).0,
            cancel: cancel.clone(),
            driver: Mutex::new(None),
        });

        let handle = tokio::spawn(drive(Arc::downgrade(&inner), receiver, cancel));
        *inner.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::debug!("Query cache created ({:?})", inner.options);
        Self { inner }
    }

    pub fn options(&self) -> &QueryOptions {
        &self.inner.options
    }

    /// Receiver that changes whenever any entry changes
    pub fn watch_revisions(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Register an observer for `key`, fetching if the entry is stale
    pub fn subscribe(&self, key: impl Into<QueryKey>) -> QueryObserver<T> {
        let key = key.into();
        let mut slots = self.inner.slots();
        let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
        slot.observers += 1;
        let receiver = slot.sender.subscribe();
        tracing::debug!("Observer joined '{}' ({} active)", key, slot.observers);

        let stale = slot
            .sender
            .borrow()
            .is_stale(self.inner.options.stale_time, Instant::now());
        if stale {
            self.inner.start_fetch(&key, slot);
        }
        drop(slots);

        QueryObserver {
            key,
            receiver,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Start a fetch unless one is already running. Returns whether one started.
    pub fn fetch(&self, key: impl Into<QueryKey>) -> bool {
        let key = key.into();
        let mut slots = self.inner.slots();
        let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
        self.inner.start_fetch(&key, slot)
    }

    /// Refetch every observed, stale entry. Returns the number of fetches started.
    pub fn refetch_active(&self) -> usize {
        let now = Instant::now();
        let stale_time = self.inner.options.stale_time;
        let mut slots = self.inner.slots();
        let mut started = 0;
        for (key, slot) in slots.iter_mut() {
            if slot.observers == 0 {
                continue;
            }
            let stale = slot.sender.borrow().is_stale(stale_time, now);
            if stale && self.inner.start_fetch(key, slot) {
                started += 1;
            }
        }
        started
    }

    /// Mark the entry stale and refetch it if anyone is watching
    ///
    /// A fetch already in flight is cancelled and replaced by a new one.
    pub fn invalidate(&self, key: impl Into<QueryKey>) -> bool {
        let key = key.into();
        let mut slots = self.inner.slots();
        let Some(slot) = slots.get_mut(&key) else {
            return false;
        };
        self.inner.publish(slot, |entry| entry.is_invalidated = true);
        if slot.observers == 0 {
            return false;
        }
        if let Some(in_flight) = slot.in_flight.take() {
            tracing::debug!("Invalidating '{}' cancels fetch #{}", key, in_flight.id);
            in_flight.cancel.cancel();
        }
        self.inner.start_fetch(&key, slot)
    }

    /// Write data for `key` directly, as if a fetch had just succeeded
    pub fn set_data(&self, key: impl Into<QueryKey>, data: T) {
        let key = key.into();
        let mut slots = self.inner.slots();
        let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
        let now = Instant::now();
        self.inner.publish(slot, |entry| {
            entry.status = QueryStatus::Success;
            entry.data = Some(data);
            entry.data_updated_at = Some(now);
            entry.error_message = None;
            entry.failure_count = 0;
            entry.is_invalidated = false;
        });
        tracing::debug!("Data for '{}' set directly", key);
    }

    pub fn get(&self, key: &QueryKey) -> Option<QueryEntry<T>> {
        self.inner
            .slots()
            .get(key)
            .map(|slot| slot.sender.borrow().clone())
    }

    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.inner
            .slots()
            .get(key)
            .map(|slot| slot.observers)
            .unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self.inner.slots().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let now = Instant::now();
        let stale_time = self.inner.options.stale_time;
        let slots = self.inner.slots();
        let mut snapshot: Vec<EntrySnapshot> = slots
            .iter()
            .map(|(key, slot)| {
                let entry = slot.sender.borrow();
                EntrySnapshot {
                    key: key.clone(),
                    status: entry.status,
                    fetch_status: entry.fetch_status,
                    observers: slot.observers,
                    failure_count: entry.failure_count,
                    fetch_count: entry.fetch_count,
                    data_age_ms: entry
                        .data_updated_at
                        .map(|at| now.saturating_duration_since(at).as_millis() as u64),
                    stale: entry.is_stale(stale_time, now),
                    error: entry.error_message.clone(),
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Cancel every in-flight fetch and stop the driver
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        {
            let mut slots = self.inner.slots();
            for slot in slots.values_mut() {
                if let Some(in_flight) = slot.in_flight.take() {
                    in_flight.cancel.cancel();
                    self.inner.publish(slot, |entry| entry.fetch_status = FetchStatus::Idle);
                }
            }
        }

        let handle = {
            let mut driver = self
                .inner
                .driver
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            driver.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::debug!("Query cache shut down");
    }
}

/// A live subscription to one key
///
/// Dropping the last observer of a key cancels its in-flight fetch.
pub struct QueryObserver<T: Clone + Send + Sync + 'static> {
    key: QueryKey,
    receiver: watch::Receiver<QueryEntry<T>>,
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Send + Sync + 'static> QueryObserver<T> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Current entry state
    pub fn current(&self) -> QueryEntry<T> {
        self.receiver.borrow().clone()
    }

    /// Wait for the entry to change. Returns false once the cache is gone.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for QueryObserver<T> {
    fn drop(&mut self) {
        self.inner.release_observer(&self.key);
    }
}
