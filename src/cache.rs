//! Watch cache
//!
//! An eventually consistent local mirror of one or more resource kinds.
//! Each kind is written by exactly one [`Informer`] task consuming a watch
//! stream; reconcile workers read concurrently.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Resource};
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::BackupPolicy;
use crate::metrics;
use crate::queue::{ObjectKey, WorkQueue};
use crate::workload::{Workload, WorkloadRef};

/// Objects that can live in a [`Cache`]
pub trait Cached: Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    fn cache_key(&self) -> Self::Key;
}

impl Cached for BackupPolicy {
    type Key = ObjectKey;

    fn cache_key(&self) -> ObjectKey {
        ObjectKey::from_meta(&self.metadata)
    }
}

impl Cached for Workload {
    type Key = WorkloadRef;

    fn cache_key(&self) -> WorkloadRef {
        self.reference()
    }
}

/// Concurrent map of cached objects, cheap to clone
pub struct Cache<T: Cached> {
    entries: Arc<DashMap<T::Key, Arc<T>>>,
}

impl<T: Cached> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T: Cached> Default for Cache<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }
}

impl<T: Cached> Cache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &T::Key) -> Option<Arc<T>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Insert or replace, returning the previous object
    pub fn insert(&self, obj: T) -> Option<Arc<T>> {
        self.entries.insert(obj.cache_key(), Arc::new(obj))
    }

    pub fn remove(&self, key: &T::Key) -> Option<Arc<T>> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    /// Snapshot of all cached objects satisfying `filter`
    pub fn list(&self, filter: impl Fn(&T) -> bool) -> Vec<Arc<T>> {
        self.entries
            .iter()
            .filter(|e| filter(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace every object in `scope` with `fresh`, as after a full relist.
    ///
    /// Returns `(old, new)` pairs for every object that was added, replaced
    /// or removed so callers can run change detection over them.
    pub fn replace_scope(
        &self,
        scope: impl Fn(&T) -> bool,
        fresh: Vec<T>,
    ) -> Vec<(Option<Arc<T>>, Option<Arc<T>>)> {
        let mut changes = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for obj in fresh {
            let key = obj.cache_key();
            seen.insert(key.clone());
            let new = Arc::new(obj);
            let old = self.entries.insert(key, new.clone());
            changes.push((old, Some(new)));
        }

        let stale: Vec<T::Key> = self
            .entries
            .iter()
            .filter(|e| scope(e.value()) && !seen.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            if let Some((_, old)) = self.entries.remove(&key) {
                changes.push((Some(old), None));
            }
        }

        changes
    }
}

/// Pure change detector: given the previous and current view of an object,
/// decide which queue key (if any) needs reconciling
pub type ChangeDetector<T, Q> = fn(Option<&T>, Option<&T>) -> Option<Q>;

/// Keeps one resource kind of a [`Cache`] current and feeds a [`WorkQueue`]
pub struct Informer<K, T: Cached, Q> {
    api: Api<K>,
    label: &'static str,
    cache: Cache<T>,
    scope: fn(&T) -> bool,
    detect: ChangeDetector<T, Q>,
    queue: WorkQueue<Q>,
}

impl<K, T, Q> Informer<K, T, Q>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + 'static,
    T: Cached + From<K>,
    Q: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(
        api: Api<K>,
        label: &'static str,
        cache: Cache<T>,
        scope: fn(&T) -> bool,
        detect: ChangeDetector<T, Q>,
        queue: WorkQueue<Q>,
    ) -> Self {
        Self {
            api,
            label,
            cache,
            scope,
            detect,
            queue,
        }
    }

    /// Consume the watch stream until `shutdown` fires.
    ///
    /// `synced` flips to `true` after the first complete listing. Stream
    /// errors are retried with backoff by the watcher and any desync is
    /// recovered by a full relist.
    pub async fn run(self, synced: watch::Sender<bool>, shutdown: CancellationToken) {
        info!(kind = self.label, "Starting informer");

        let stream = watcher::watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .map_err(|e| {
                warn!(kind = self.label, error = %e, "Watch stream error");
                e
            });
        futures::pin_mut!(stream);

        let mut relist: Vec<T> = Vec::new();

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(_)) => continue,
                None => break,
            };

            match event {
                Event::Apply(obj) => {
                    let new = T::from(obj);
                    let key = new.cache_key();
                    let old = self.cache.insert(new);
                    let new = self.cache.get(&key);
                    self.observe(old.as_deref(), new.as_deref()).await;
                }
                Event::Delete(obj) => {
                    let gone = T::from(obj);
                    let old = self.cache.remove(&gone.cache_key());
                    self.observe(old.as_deref().or(Some(&gone)), None).await;
                }
                Event::Init => {
                    debug!(kind = self.label, "Relist started");
                    relist.clear();
                }
                Event::InitApply(obj) => relist.push(T::from(obj)),
                Event::InitDone => {
                    let fresh = std::mem::take(&mut relist);
                    let count = fresh.len();
                    for (old, new) in self.cache.replace_scope(self.scope, fresh) {
                        self.observe(old.as_deref(), new.as_deref()).await;
                    }
                    debug!(kind = self.label, objects = count, "Relist complete");
                    metrics::MANAGED_RESOURCES
                        .with_label_values(&[self.label])
                        .set(count as f64);
                    synced.send_replace(true);
                }
            }
        }

        info!(kind = self.label, "Informer stopped");
    }

    async fn observe(&self, old: Option<&T>, new: Option<&T>) {
        if let Some(key) = (self.detect)(old, new) {
            self.queue.push(key).await;
        }
    }
}

/// Policy changes worth a reconcile: creation, deletion, and spec edits.
/// Status and metadata churn is ignored.
pub fn policy_event_key(old: Option<&BackupPolicy>, new: Option<&BackupPolicy>) -> Option<ObjectKey> {
    match (old, new) {
        (None, Some(p)) | (Some(p), None) => Some(p.cache_key()),
        (Some(o), Some(n)) if o.spec != n.spec => Some(n.cache_key()),
        _ => None,
    }
}

/// Workload changes worth a reconcile: creation, and edits to labels,
/// annotations or the pod template. Deletions need no action.
pub fn workload_event_key(old: Option<&Workload>, new: Option<&Workload>) -> Option<WorkloadRef> {
    match (old, new) {
        (None, Some(w)) => Some(w.reference()),
        (Some(o), Some(n))
            if o.labels() != n.labels()
                || o.metadata().annotations != n.metadata().annotations
                || o.pod_template() != n.pod_template() =>
        {
            Some(n.reference())
        }
        _ => None,
    }
}
