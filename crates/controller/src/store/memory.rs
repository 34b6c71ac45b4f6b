//! In-process [`ObjectStore`] with resourceVersion semantics, label
//! selectors, watch replay and fault injection.
//!
//! Used as the object-store double for every reconciler test.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{ObjectList, ObjectStore, StoreError, StoreObject, WatchEvent, WatchStream};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct Inner<K> {
    namespace: Option<String>,
    objects: BTreeMap<String, K>,
    next_rv: u64,
    /// Events with the resourceVersion they were recorded at.
    log: Vec<(u64, WatchEvent<K>)>,
    /// Watches asking for versions below this are answered with `Gone`.
    compacted_below: u64,
    events: broadcast::Sender<(u64, WatchEvent<K>)>,
    injected: VecDeque<(Op, StoreError)>,
}

/// Operations that faults can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

/// Shared in-memory collection. Clones share state.
pub struct MemoryStore<K> {
    inner: Arc<Mutex<Inner<K>>>,
    writes: Arc<AtomicUsize>,
}

impl<K> Clone for MemoryStore<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            writes: self.writes.clone(),
        }
    }
}

impl<K: StoreObject> MemoryStore<K> {
    /// Store whose objects live in `namespace`.
    pub fn namespaced(namespace: &str) -> Self {
        Self::new(Some(namespace.to_string()))
    }

    /// Store for a cluster-scoped kind.
    pub fn cluster() -> Self {
        Self::new(None)
    }

    fn new(namespace: Option<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                namespace,
                objects: BTreeMap::new(),
                next_rv: 1,
                log: Vec::new(),
                compacted_below: 0,
                events,
                injected: VecDeque::new(),
            })),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of successful create/update/update_status/delete calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Snapshot of every stored object.
    pub fn objects(&self) -> Vec<K> {
        self.inner.lock().objects.values().cloned().collect()
    }

    /// Make the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: Op, err: StoreError) {
        self.inner.lock().injected.push_back((op, err));
    }

    /// End every open watch stream. Subsequent watches replay from the log.
    pub fn close_watches(&self) {
        let mut inner = self.inner.lock();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        inner.events = events;
    }

    /// Forget the event log so older versions can only be recovered by relisting.
    pub fn compact(&self) {
        let mut inner = self.inner.lock();
        inner.log.clear();
        inner.compacted_below = inner.next_rv;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        inner.events = events;
    }

    fn take_fault(inner: &mut Inner<K>, op: Op) -> Result<(), StoreError> {
        if let Some(pos) = inner.injected.iter().position(|(o, _)| *o == op) {
            if let Some((_, err)) = inner.injected.remove(pos) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn record(inner: &mut Inner<K>, rv: u64, event: WatchEvent<K>) {
        inner.log.push((rv, event.clone()));
        // No receivers is fine.
        let _ = inner.events.send((rv, event));
    }

    fn bump(inner: &mut Inner<K>, obj: &mut K) -> u64 {
        let rv = inner.next_rv;
        inner.next_rv += 1;
        obj.meta_mut().resource_version = Some(rv.to_string());
        rv
    }

    /// Compare the caller's resourceVersion against the stored object.
    fn check_version(stored: &K, obj: &K) -> Result<(), StoreError> {
        match obj.resource_version() {
            None => Err(StoreError::Invalid(format!(
                "{} written without resourceVersion",
                obj.name_any()
            ))),
            Some(rv) if Some(&rv) != stored.resource_version().as_ref() => Err(
                StoreError::Conflict(format!("{} has been modified", obj.name_any())),
            ),
            Some(_) => Ok(()),
        }
    }

    /// Copy `field` of `from` over `onto`, mirroring the status subresource split.
    fn splice(onto: &K, from: &K, field: &str) -> Result<K, StoreError> {
        let mut target = serde_json::to_value(onto)?;
        let source = serde_json::to_value(from)?;
        if let Value::Object(map) = &mut target {
            match source.get(field) {
                Some(v) => {
                    map.insert(field.to_string(), v.clone());
                }
                None => {
                    map.remove(field);
                }
            }
        }
        Ok(serde_json::from_value(target)?)
    }

    fn write(&self, obj: &K, op: Op) -> Result<K, StoreError> {
        let mut inner = self.inner.lock();
        Self::take_fault(&mut inner, op)?;
        let name = obj.name_any();
        let stored = inner
            .objects
            .get(&name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        Self::check_version(&stored, obj)?;

        let mut next = match op {
            // Status is owned by the status subresource.
            Op::Update => Self::splice(obj, &stored, "status")?,
            _ => Self::splice(&stored, obj, "status")?,
        };
        {
            let meta = next.meta_mut();
            meta.uid = stored.meta().uid.clone();
            meta.namespace = stored.meta().namespace.clone();
        }
        let rv = Self::bump(&mut inner, &mut next);
        inner.objects.insert(name, next.clone());
        Self::record(&mut inner, rv, WatchEvent::Modified(next.clone()));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(next)
    }
}

/// Parse a `k=v,k2,k3!=v3` selector and test it against `labels`.
pub fn selector_matches(selector: Option<&str>, labels: &BTreeMap<String, String>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                labels.get(k.trim()).map(String::as_str) != Some(v.trim())
            } else if let Some((k, v)) = term.split_once('=') {
                let v = v.trim_start_matches('=');
                labels.get(k.trim()).map(String::as_str) == Some(v.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

fn event_object<K>(event: &WatchEvent<K>) -> Option<&K> {
    match event {
        WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
        WatchEvent::Bookmark(_) => None,
    }
}

#[async_trait]
impl<K: StoreObject> ObjectStore<K> for MemoryStore<K> {
    async fn list(&self, selector: Option<&str>) -> Result<ObjectList<K>, StoreError> {
        let mut inner = self.inner.lock();
        Self::take_fault(&mut inner, Op::List)?;
        let items = inner
            .objects
            .values()
            .filter(|o| selector_matches(selector, o.labels()))
            .cloned()
            .collect();
        Ok(ObjectList {
            items,
            resource_version: (inner.next_rv - 1).to_string(),
        })
    }

    async fn watch(
        &self,
        selector: Option<&str>,
        since: &str,
    ) -> Result<WatchStream<K>, StoreError> {
        let since: u64 = since
            .parse()
            .map_err(|_| StoreError::Invalid(format!("bad resourceVersion {since:?}")))?;
        let selector = selector.map(str::to_string);

        let inner = self.inner.lock();
        if since + 1 < inner.compacted_below {
            return Err(StoreError::Gone(format!("version {since} compacted")));
        }
        let replay: Vec<Result<WatchEvent<K>, StoreError>> = inner
            .log
            .iter()
            .filter(|(rv, ev)| {
                *rv > since
                    && event_object(ev)
                        .is_some_and(|o| selector_matches(selector.as_deref(), o.labels()))
            })
            .map(|(_, ev)| Ok(ev.clone()))
            .collect();
        let rx = inner.events.subscribe();
        drop(inner);

        let live = stream::unfold(rx, move |mut rx| {
            let selector = selector.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((_, ev)) => {
                            let wanted = event_object(&ev)
                                .is_some_and(|o| selector_matches(selector.as_deref(), o.labels()));
                            if wanted {
                                return Some((Ok(ev), rx));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((
                                Err(StoreError::Watch(format!("watch lagged by {n} events"))),
                                rx,
                            ));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(replay).chain(live).boxed())
    }

    async fn get(&self, name: &str) -> Result<K, StoreError> {
        self.inner
            .lock()
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let mut inner = self.inner.lock();
        Self::take_fault(&mut inner, Op::Create)?;
        let mut obj = obj.clone();
        let name = match (obj.meta().name.clone(), obj.meta().generate_name.clone()) {
            (Some(name), _) if !name.is_empty() => name,
            (_, Some(prefix)) => {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("{prefix}{}", &suffix[..5])
            }
            _ => return Err(StoreError::Invalid("object has no name".into())),
        };
        if inner.objects.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }
        {
            let namespace = inner.namespace.clone();
            let meta = obj.meta_mut();
            meta.name = Some(name.clone());
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
            if namespace.is_some() {
                meta.namespace = namespace;
            }
        }
        let rv = Self::bump(&mut inner, &mut obj);
        inner.objects.insert(name, obj.clone());
        Self::record(&mut inner, rv, WatchEvent::Added(obj.clone()));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(obj)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        self.write(obj, Op::Update)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        self.write(obj, Op::UpdateStatus)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        Self::take_fault(&mut inner, Op::Delete)?;
        let Some(mut obj) = inner.objects.remove(name) else {
            return Err(StoreError::NotFound(name.to_string()));
        };
        let rv = Self::bump(&mut inner, &mut obj);
        Self::record(&mut inner, rv, WatchEvent::Deleted(obj));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn cm(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryStore::<ConfigMap>::namespaced("ns");
        let created = store.create(&cm("a", &[])).await.unwrap();
        let mut first = created.clone();
        first.data = Some([("k".to_string(), "1".to_string())].into());
        store.update(&first).await.unwrap();

        let mut stale = created;
        stale.data = Some([("k".to_string(), "2".to_string())].into());
        let err = store.update(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let store = MemoryStore::<ConfigMap>::namespaced("ns");
        let created = store.create(&cm("a", &[])).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.namespace.as_deref(), Some("ns"));
        assert!(matches!(
            store.create(&cm("a", &[])).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_by_selector() {
        let store = MemoryStore::<ConfigMap>::namespaced("ns");
        store.create(&cm("a", &[("sitepod", "x")])).await.unwrap();
        store.create(&cm("b", &[("sitepod", "y")])).await.unwrap();
        store
            .create(&cm("c", &[("sitepod", "x"), ("configtype", "appcomponent")]))
            .await
            .unwrap();

        let list = store.list(Some("sitepod=x")).await.unwrap();
        assert_eq!(list.items.len(), 2);
        let list = store
            .list(Some("sitepod=x,configtype=appcomponent"))
            .await
            .unwrap();
        assert_eq!(list.items.len(), 1);
    }

    #[tokio::test]
    async fn test_update_keeps_status_and_update_status_keeps_spec() {
        let store = MemoryStore::<Deployment>::namespaced("ns");
        let created = store
            .create(&Deployment {
                metadata: ObjectMeta {
                    name: Some("d".into()),
                    ..Default::default()
                },
                spec: Some(DeploymentSpec {
                    replicas: Some(3),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut with_status = created.clone();
        with_status.status = Some(DeploymentStatus {
            replicas: Some(3),
            ..Default::default()
        });
        with_status.spec.as_mut().unwrap().replicas = Some(7);
        let after = store.update_status(&with_status).await.unwrap();
        assert_eq!(after.spec.unwrap().replicas, Some(3));
        assert_eq!(after.status.as_ref().unwrap().replicas, Some(3));

        let mut scaled = store.get("d").await.unwrap();
        scaled.spec.as_mut().unwrap().replicas = Some(0);
        scaled.status = None;
        let after = store.update(&scaled).await.unwrap();
        assert_eq!(after.spec.unwrap().replicas, Some(0));
        assert_eq!(after.status.unwrap().replicas, Some(3));
    }

    #[tokio::test]
    async fn test_watch_replays_after_version() {
        let store = MemoryStore::<ConfigMap>::namespaced("ns");
        store.create(&cm("a", &[])).await.unwrap();
        let list = store.list(None).await.unwrap();
        store.create(&cm("b", &[])).await.unwrap();
        store.delete("a").await.unwrap();

        let events: Vec<_> = store
            .watch(None, &list.resource_version)
            .await
            .unwrap()
            .take(2)
            .collect()
            .await;
        assert!(matches!(&events[0], Ok(WatchEvent::Added(o)) if o.name_any() == "b"));
        assert!(matches!(&events[1], Ok(WatchEvent::Deleted(o)) if o.name_any() == "a"));
    }

    #[tokio::test]
    async fn test_compacted_watch_is_gone() {
        let store = MemoryStore::<ConfigMap>::namespaced("ns");
        store.create(&cm("a", &[])).await.unwrap();
        store.create(&cm("b", &[])).await.unwrap();
        store.compact();
        assert!(matches!(
            store.watch(None, "0").await.err(),
            Some(StoreError::Gone(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let store = MemoryStore::<ConfigMap>::namespaced("ns");
        let created = store.create(&cm("a", &[])).await.unwrap();
        store.fail_next(Op::Update, StoreError::Conflict("injected".into()));
        assert!(store.update(&created).await.is_err());
        assert!(store.update(&created).await.is_ok());
    }

    #[test]
    fn test_selector_terms() {
        let labels: BTreeMap<String, String> =
            [("a".to_string(), "1".to_string())].into_iter().collect();
        assert!(selector_matches(None, &labels));
        assert!(selector_matches(Some("a=1"), &labels));
        assert!(selector_matches(Some("a==1"), &labels));
        assert!(selector_matches(Some("a"), &labels));
        assert!(selector_matches(Some("b!=2"), &labels));
        assert!(!selector_matches(Some("a!=1"), &labels));
        assert!(!selector_matches(Some("b"), &labels));
    }
}
