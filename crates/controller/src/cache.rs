//! Watch-fed local cache ("informer") with secondary indexes.
//!
//! An [`Informer`] lists its collection once, then follows a watch from the
//! list's resourceVersion. Every applied event updates the items and the
//! indexes under one write lock, after which registered [`EventHandler`]s are
//! called with the old and new objects. A failed or expired watch triggers a
//! relist whose differences are replayed to handlers as ordinary events.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::ResourceExt;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{object_key, ObjectStore, ResourceKind, StoreError, StoreObject, WatchEvent};

const DEFAULT_RELIST_BACKOFF: Duration = Duration::from_secs(1);

/// Callbacks invoked after the cache has applied a change.
///
/// Handlers run on the informer task and must not block.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, _obj: &Arc<K>) {}
    fn on_update(&self, _old: &Arc<K>, _new: &Arc<K>) {}
    fn on_delete(&self, _obj: &Arc<K>) {}
}

/// Anything that can report whether its initial list has been applied.
pub trait Synced: Send + Sync {
    fn has_synced(&self) -> bool;
    fn name(&self) -> &str;
}

struct State<K> {
    items: BTreeMap<String, Arc<K>>,
    /// index name -> index value -> object keys
    indices: HashMap<String, HashMap<String, BTreeSet<String>>>,
}

enum Change<K> {
    Added(Arc<K>),
    Updated(Arc<K>, Arc<K>),
    Deleted(Arc<K>),
}

struct Inner<K> {
    store: Arc<dyn ObjectStore<K>>,
    kind: ResourceKind<K>,
    namespace: Option<String>,
    selector: Option<String>,
    state: RwLock<State<K>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<K>>>>,
    synced: AtomicBool,
    relist_backoff: Duration,
}

/// Shared handle to one kind's cache. Clones share state.
pub struct Informer<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for Informer<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: StoreObject> Informer<K> {
    /// Cache over `store`. `namespace` qualifies bare-name lookups for namespaced kinds.
    pub fn new(store: Arc<dyn ObjectStore<K>>, kind: ResourceKind<K>, namespace: &str) -> Self {
        let namespace = kind.namespaced.then(|| namespace.to_string());
        let indices = kind
            .indexers
            .iter()
            .map(|(name, _)| (name.clone(), HashMap::new()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                store,
                kind,
                namespace,
                selector: None,
                state: RwLock::new(State {
                    items: BTreeMap::new(),
                    indices,
                }),
                handlers: RwLock::new(Vec::new()),
                synced: AtomicBool::new(false),
                relist_backoff: DEFAULT_RELIST_BACKOFF,
            }),
        }
    }

    /// Only cache objects matching a label selector. Must be called before `run`.
    #[must_use]
    pub fn with_selector(self, selector: &str) -> Self {
        self.rebuild(|inner| inner.selector = Some(selector.to_string()))
    }

    #[must_use]
    pub fn with_relist_backoff(self, backoff: Duration) -> Self {
        self.rebuild(|inner| inner.relist_backoff = backoff)
    }

    fn rebuild(self, f: impl FnOnce(&mut Inner<K>)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                f(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            // Already shared; configuration is fixed at this point.
            Err(inner) => Self { inner },
        }
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind.kind
    }

    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        self.inner.handlers.write().push(handler);
    }

    pub fn has_synced(&self) -> bool {
        self.inner.synced.load(Ordering::Acquire)
    }

    fn qualify(&self, key: &str) -> String {
        match &self.inner.namespace {
            Some(ns) if !key.contains('/') => format!("{ns}/{key}"),
            _ => key.to_string(),
        }
    }

    /// Look up by `namespace/name` or by bare name.
    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        let key = self.qualify(key);
        self.inner.state.read().items.get(&key).cloned()
    }

    /// Every cached object, ordered by key.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.inner.state.read().items.values().cloned().collect()
    }

    /// Objects whose indexer `index` produced `value`.
    pub fn by_index(&self, index: &str, value: &str) -> Vec<Arc<K>> {
        let state = self.inner.state.read();
        let Some(keys) = state.indices.get(index).and_then(|idx| idx.get(value)) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|k| state.items.get(k).cloned())
            .collect()
    }

    /// List and watch until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let inner = &self.inner;
        let selector = inner.selector.as_deref();
        info!(kind = %inner.kind.kind, "Starting informer");

        'relist: loop {
            let listed = tokio::select! {
                biased;
                () = shutdown.cancelled() => break 'relist,
                listed = inner.store.list(selector) => listed,
            };
            let mut version = match listed {
                Ok(list) => {
                    debug!(
                        kind = %inner.kind.kind,
                        count = list.items.len(),
                        version = %list.resource_version,
                        "Listed objects"
                    );
                    self.replace(list.items);
                    if !inner.synced.swap(true, Ordering::AcqRel) {
                        info!(kind = %inner.kind.kind, "Informer synced");
                    }
                    list.resource_version
                }
                Err(e) => {
                    warn!(kind = %inner.kind.kind, error = %e, "List failed, retrying");
                    if self.backoff(&shutdown).await {
                        break 'relist;
                    }
                    continue 'relist;
                }
            };

            loop {
                let mut stream = match inner.store.watch(selector, &version).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(kind = %inner.kind.kind, error = %e, "Watch failed, relisting");
                        if self.backoff(&shutdown).await {
                            break 'relist;
                        }
                        continue 'relist;
                    }
                };

                loop {
                    let next = tokio::select! {
                        biased;
                        () = shutdown.cancelled() => break 'relist,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            if let Some(v) = self.apply(event) {
                                version = v;
                            }
                        }
                        Some(Err(StoreError::Gone(msg))) => {
                            debug!(kind = %inner.kind.kind, reason = %msg, "Watch expired, relisting");
                            continue 'relist;
                        }
                        Some(Err(e)) => {
                            warn!(kind = %inner.kind.kind, error = %e, "Watch error, relisting");
                            continue 'relist;
                        }
                        // Server closed the stream; resume from the last seen version.
                        None => break,
                    }
                }
            }
        }
        info!(kind = %inner.kind.kind, "Informer stopped");
    }

    /// Sleep for the relist backoff. Returns true if shutdown fired meanwhile.
    async fn backoff(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            () = shutdown.cancelled() => true,
            () = tokio::time::sleep(self.inner.relist_backoff) => false,
        }
    }

    /// Apply one watch event. Returns the event's resourceVersion.
    fn apply(&self, event: WatchEvent<K>) -> Option<String> {
        let (change, version) = {
            let mut state = self.inner.state.write();
            match event {
                WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                    let version = obj.resource_version();
                    let new = Arc::new(obj);
                    let change = match self.insert(&mut state, new.clone()) {
                        Some(old) => Change::Updated(old, new),
                        None => Change::Added(new),
                    };
                    (Some(change), version)
                }
                WatchEvent::Deleted(obj) => {
                    let version = obj.resource_version();
                    let removed = self.remove(&mut state, &object_key(&obj));
                    // A delete for something never seen still reports the final state.
                    let old = removed.unwrap_or_else(|| Arc::new(obj));
                    (Some(Change::Deleted(old)), version)
                }
                WatchEvent::Bookmark(version) => (None, Some(version)),
            }
        };
        if let Some(change) = change {
            self.dispatch(change);
        }
        version
    }

    /// Replace the whole cache with a fresh list, replaying differences.
    fn replace(&self, items: Vec<K>) {
        let mut changes = Vec::new();
        {
            let mut state = self.inner.state.write();
            let fresh: BTreeMap<String, Arc<K>> = items
                .into_iter()
                .map(|o| (object_key(&o), Arc::new(o)))
                .collect();

            let stale: Vec<String> = state
                .items
                .keys()
                .filter(|k| !fresh.contains_key(*k))
                .cloned()
                .collect();
            for key in stale {
                if let Some(old) = self.remove(&mut state, &key) {
                    changes.push(Change::Deleted(old));
                }
            }

            for (key, new) in fresh {
                let unchanged = state
                    .items
                    .get(&key)
                    .is_some_and(|old| old.resource_version() == new.resource_version());
                if unchanged {
                    continue;
                }
                match self.insert(&mut state, new.clone()) {
                    Some(old) => changes.push(Change::Updated(old, new)),
                    None => changes.push(Change::Added(new)),
                }
            }
        }
        for change in changes {
            self.dispatch(change);
        }
    }

    fn insert(&self, state: &mut State<K>, obj: Arc<K>) -> Option<Arc<K>> {
        let key = object_key(obj.as_ref());
        let old = self.remove(state, &key);
        for (name, indexer) in &self.inner.kind.indexers {
            let index = state.indices.entry(name.clone()).or_default();
            for value in indexer(obj.as_ref()) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
        state.items.insert(key, obj);
        old
    }

    fn remove(&self, state: &mut State<K>, key: &str) -> Option<Arc<K>> {
        let old = state.items.remove(key)?;
        for (name, indexer) in &self.inner.kind.indexers {
            let Some(index) = state.indices.get_mut(name) else {
                continue;
            };
            for value in indexer(old.as_ref()) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
        Some(old)
    }

    fn dispatch(&self, change: Change<K>) {
        let handlers = self.inner.handlers.read().clone();
        for handler in handlers {
            match &change {
                Change::Added(obj) => handler.on_add(obj),
                Change::Updated(old, new) => handler.on_update(old, new),
                Change::Deleted(obj) => handler.on_delete(obj),
            }
        }
    }
}

impl<K: StoreObject> Synced for Informer<K> {
    fn has_synced(&self) -> bool {
        Informer::has_synced(self)
    }

    fn name(&self) -> &str {
        &self.inner.kind.plural
    }
}

/// Adapts closures into an [`EventHandler`].
pub struct HandlerFns<K> {
    pub on_add: Option<Box<dyn Fn(&Arc<K>) + Send + Sync>>,
    pub on_update: Option<Box<dyn Fn(&Arc<K>, &Arc<K>) + Send + Sync>>,
    pub on_delete: Option<Box<dyn Fn(&Arc<K>) + Send + Sync>>,
}

impl<K> Default for HandlerFns<K> {
    fn default() -> Self {
        Self {
            on_add: None,
            on_update: None,
            on_delete: None,
        }
    }
}

impl<K> HandlerFns<K> {
    /// Same callback for every event, given the newest object.
    pub fn any(f: impl Fn(&Arc<K>) + Send + Sync + Clone + 'static) -> Self {
        let on_update = f.clone();
        let on_delete = f.clone();
        Self {
            on_add: Some(Box::new(f)),
            on_update: Some(Box::new(move |_, new| on_update(new))),
            on_delete: Some(Box::new(on_delete)),
        }
    }
}

impl<K: Send + Sync> EventHandler<K> for HandlerFns<K> {
    fn on_add(&self, obj: &Arc<K>) {
        if let Some(f) = &self.on_add {
            f(obj);
        }
    }

    fn on_update(&self, old: &Arc<K>, new: &Arc<K>) {
        if let Some(f) = &self.on_update {
            f(old, new);
        }
    }

    fn on_delete(&self, obj: &Arc<K>) {
        if let Some(f) = &self.on_delete {
            f(obj);
        }
    }
}
