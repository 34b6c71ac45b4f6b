//! Object store access.
//!
//! [`ObjectStore`] is the single typed CRUD + list/watch seam every cache and
//! reconciler goes through. [`KubeStore`] talks to the API server and
//! [`MemoryStore`] keeps everything in-process for tests.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub mod kind;
pub mod kube_store;
pub mod memory;

pub use kind::{IndexFn, ResourceKind, SITEPOD_INDEX, UID_INDEX};
pub use kube_store::KubeStore;
pub use memory::MemoryStore;

/// Errors surfaced by an [`ObjectStore`].
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The write carried a stale resourceVersion.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The requested watch version is no longer available; relist.
    #[error("resource version too old: {0}")]
    Gone(String),

    #[error("kubernetes API error: {0}")]
    Kube(String),

    #[error("watch stream error: {0}")]
    Watch(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(ae.message)
            }
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
            kube::Error::Api(ae) if ae.code == 410 => StoreError::Gone(ae.message),
            other => StoreError::Kube(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Everything a cached, stored object must be able to do.
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// One change notification from a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker carrying only a newer resourceVersion.
    Bookmark(String),
}

/// A full list result plus the version to start watching from.
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, StoreError>>;

/// Typed access to one collection (one kind, one namespace or cluster scope).
#[async_trait]
pub trait ObjectStore<K: StoreObject>: Send + Sync {
    /// List objects, optionally filtered by a `k=v,k2=v2` label selector.
    async fn list(&self, selector: Option<&str>) -> Result<ObjectList<K>, StoreError>;

    /// Watch changes after `since` (a resourceVersion from a previous list or event).
    async fn watch(&self, selector: Option<&str>, since: &str)
        -> Result<WatchStream<K>, StoreError>;

    async fn get(&self, name: &str) -> Result<K, StoreError>;

    /// Create; the store assigns uid and resourceVersion.
    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace spec and metadata. Must carry the last observed resourceVersion.
    async fn update(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace status. Must carry the last observed resourceVersion.
    async fn update_status(&self, obj: &K) -> Result<K, StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

/// Cache key of an object: `namespace/name`, or `name` for cluster-scoped kinds.
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{ns}/{}", obj.name_any()),
        _ => obj.name_any(),
    }
}

/// The name part of a cache key.
#[must_use]
pub fn key_name(key: &str) -> &str {
    key.rsplit_once('/').map_or(key, |(_, name)| name)
}

/// Delete, treating an already-deleted object as success.
pub async fn delete_ignore_missing<K: StoreObject>(
    store: &dyn ObjectStore<K>,
    name: &str,
) -> Result<(), StoreError> {
    match store.delete(name).await {
        Err(StoreError::NotFound(_)) | Ok(()) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Render a label map as an equality selector.
pub fn selector_from_labels<'a>(labels: impl IntoIterator<Item = (&'a String, &'a String)>) -> String {
    labels
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
