//! [`ObjectStore`] backed by the Kubernetes API server.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchParams};
use kube::core::WatchEvent as KubeWatchEvent;
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

use super::{ObjectList, ObjectStore, StoreError, StoreObject, WatchEvent, WatchStream};

/// Store over a `kube::Api`, namespaced or cluster-wide depending on how the
/// `Api` was built.
#[derive(Clone)]
pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K> KubeStore<K> {
    pub fn new(api: Api<K>) -> Self {
        Self { api }
    }
}

fn list_params(selector: Option<&str>) -> ListParams {
    match selector {
        Some(s) if !s.is_empty() => ListParams::default().labels(s),
        _ => ListParams::default(),
    }
}

fn watch_params(selector: Option<&str>) -> WatchParams {
    match selector {
        Some(s) if !s.is_empty() => WatchParams::default().labels(s),
        _ => WatchParams::default(),
    }
}

#[async_trait]
impl<K: StoreObject> ObjectStore<K> for KubeStore<K> {
    async fn list(&self, selector: Option<&str>) -> Result<ObjectList<K>, StoreError> {
        let list = self.api.list(&list_params(selector)).await?;
        Ok(ObjectList {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch(
        &self,
        selector: Option<&str>,
        since: &str,
    ) -> Result<WatchStream<K>, StoreError> {
        let stream = self.api.watch(&watch_params(selector), since).await?;
        let mapped = stream.map_err(StoreError::from).and_then(|event| async move {
            match event {
                KubeWatchEvent::Added(obj) => Ok(WatchEvent::Added(obj)),
                KubeWatchEvent::Modified(obj) => Ok(WatchEvent::Modified(obj)),
                KubeWatchEvent::Deleted(obj) => Ok(WatchEvent::Deleted(obj)),
                KubeWatchEvent::Bookmark(bm) => {
                    Ok(WatchEvent::Bookmark(bm.metadata.resource_version))
                }
                KubeWatchEvent::Error(e) if e.code == 410 => Err(StoreError::Gone(e.message)),
                KubeWatchEvent::Error(e) => Err(StoreError::Watch(e.message)),
            }
        });
        Ok(mapped.boxed())
    }

    async fn get(&self, name: &str) -> Result<K, StoreError> {
        Ok(self.api.get(name).await?)
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        if obj.resource_version().is_none() {
            return Err(StoreError::Invalid(format!(
                "update of {} without resourceVersion",
                obj.name_any()
            )));
        }
        Ok(self
            .api
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let name = obj.name_any();
        let Some(rv) = obj.resource_version() else {
            return Err(StoreError::Invalid(format!(
                "status update of {name} without resourceVersion"
            )));
        };
        let body = serde_json::to_value(obj)?;
        let status_patch = json!({
            "metadata": { "resourceVersion": rv },
            "status": body.get("status").cloned().unwrap_or_default(),
        });
        Ok(self
            .api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status_patch))
            .await?)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        debug!(name = %name, "Deleting object");
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
