//! Work queue and worker pool
//!
//! Keys, not objects, flow through the queue. A key waiting in the queue is
//! held at most once, a key being processed is never handed to a second
//! worker, and a key pushed while it is being processed is delivered again
//! once the current pass calls [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Debug};
use std::future::Future;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// `namespace/name` key of a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self::new(
            meta.namespace.as_deref().unwrap_or("default"),
            meta.name.as_deref().unwrap_or_default(),
        )
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(Error::validation(format!(
                "invalid object key '{}', expected namespace/name",
                s
            ))),
        }
    }
}

/// What a reconcile pass asks of the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing more to do until the object changes
    AwaitChange,
    /// Reconcile again after the delay
    Requeue(Duration),
}

impl Action {
    pub fn await_change() -> Self {
        Action::AwaitChange
    }

    pub fn requeue(after: Duration) -> Self {
        Action::Requeue(after)
    }
}

/// Exponential backoff applied by [`WorkQueue::retry`]
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(300),
            max_retries: 5,
        }
    }
}

struct State<K> {
    pending: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Shared<K> {
    name: &'static str,
    state: Mutex<State<K>>,
    notify: Notify,
    retry: RetryPolicy,
}

/// Coalescing, per-key exclusive queue of reconcile keys. Cheap to clone.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(name: &'static str, retry: RetryPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                retry,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Enqueue a key. Duplicates of a pending key coalesce; a key currently
    /// being processed is parked until its pass finishes.
    pub async fn push(&self, key: K) {
        let mut state = self.shared.state.lock().await;
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.pending.push_back(key);
        self.record_depth(state.pending.len());
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Enqueue a key once `delay` has elapsed
    pub fn push_after(&self, key: K, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(key).await;
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn pop(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.pending.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.record_depth(state.pending.len());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark the pass over `key` as finished
    pub async fn done(&self, key: &K) {
        let mut state = self.shared.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.pending.push_back(key.clone());
            self.record_depth(state.pending.len());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    fn record_depth(&self, pending: usize) {
        metrics::QUEUE_DEPTH
            .with_label_values(&[self.shared.name])
            .set(pending as f64);
    }

    /// Schedule a retry with exponential backoff. Returns `false` when the
    /// key has exhausted its retries and was dropped.
    pub async fn retry(&self, key: K) -> bool {
        let attempt = {
            let mut state = self.shared.state.lock().await;
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            let attempt = *failures;
            if attempt > self.shared.retry.max_retries {
                state.failures.remove(&key);
                return false;
            }
            attempt
        };

        let delay = self.shared.retry.delay(attempt);
        debug!(queue = self.shared.name, key = ?key, attempt, delay = ?delay, "Scheduling retry");
        metrics::RETRIES.with_label_values(&[self.shared.name]).inc();
        self.push_after(key, delay);
        true
    }

    /// Reset the failure count of `key`
    pub async fn forget(&self, key: &K) {
        self.shared.state.lock().await.failures.remove(key);
    }

    /// Number of keys waiting to be handed out
    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop handing out keys and wake every waiting worker
    pub async fn shutdown(&self) {
        let mut state = self.shared.state.lock().await;
        state.shutting_down = true;
        state.pending.clear();
        state.dirty.clear();
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

/// Run `workers` concurrent workers draining `queue` through `reconcile`.
///
/// Returns once the queue is shut down and every in-flight pass has
/// finished.
pub async fn run_workers<K, F, Fut>(queue: WorkQueue<K>, workers: usize, reconcile: F)
where
    K: Clone + Eq + Hash + Debug + fmt::Display + Send + Sync + 'static,
    F: Fn(K) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Action>> + Send + 'static,
{
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers.max(1) {
        let queue = queue.clone();
        let reconcile = reconcile.clone();
        handles.push(tokio::spawn(async move {
            while let Some(key) = queue.pop().await {
                let outcome = reconcile(key.clone()).await;
                handle_outcome(&queue, &key, outcome).await;
                queue.done(&key).await;
            }
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!(queue = queue.name(), error = %e, "Worker task failed");
        }
    }
}

async fn handle_outcome<K>(queue: &WorkQueue<K>, key: &K, outcome: Result<Action>)
where
    K: Clone + Eq + Hash + Debug + fmt::Display + Send + Sync + 'static,
{
    match outcome {
        Ok(Action::AwaitChange) => queue.forget(key).await,
        Ok(Action::Requeue(after)) => {
            queue.forget(key).await;
            queue.push_after(key.clone(), after);
        }
        Err(e) if e.is_retryable() => {
            metrics::RECONCILIATION_ERRORS
                .with_label_values(&[queue.name()])
                .inc();
            if queue.retry(key.clone()).await {
                warn!(queue = queue.name(), key = %key, error = %e, "Reconciliation failed, scheduling retry");
            } else {
                error!(queue = queue.name(), key = %key, error = %e, "Reconciliation failed, retries exhausted");
            }
        }
        Err(e) => {
            metrics::RECONCILIATION_ERRORS
                .with_label_values(&[queue.name()])
                .inc();
            warn!(queue = queue.name(), key = %key, error = %e, "Reconciliation failed, not retrying");
            queue.forget(key).await;
        }
    }
}
