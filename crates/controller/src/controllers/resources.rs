//! Helpers shared by reconcilers: readiness checks, PodTask dedup and
//! create-or-update of generated objects.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use super::{Context, MANAGER_CONTAINER};
use crate::crds::labels::{sitepod_selector, SITEPOD_LABEL};
use crate::crds::{PodTask, PodTaskSpec};
use crate::error::{Error, Result};
use crate::store::{ObjectStore, StoreError, StoreObject, SITEPOD_INDEX};

/// Whether the pod reports `Ready=True`.
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// The Sitepod's running, ready pod.
pub fn ready_pod(ctx: &Context, sitepod_uid: &str) -> Result<Arc<Pod>> {
    ctx.informers
        .pods
        .by_index(SITEPOD_INDEX, sitepod_uid)
        .into_iter()
        .find(|p| p.metadata.deletion_timestamp.is_none() && pod_is_ready(p))
        .ok_or_else(|| Error::waiting(format!("no ready pod for sitepod {sitepod_uid}")))
}

/// What [`ensure_pod_task`] found.
#[derive(Debug)]
pub enum TaskState {
    Created(PodTask),
    /// Still running, or ran but has not signaled its behalf-of target yet.
    Pending(PodTask),
    Completed(PodTask),
    /// Ran out of attempts without succeeding.
    Failed(PodTask),
}

/// Make sure exactly one PodTask exists for `(command, pod)` under this Sitepod.
///
/// Existing tasks are looked up in the store rather than the cache so a task
/// created by the previous pass is always seen.
pub async fn ensure_pod_task(
    ctx: &Context,
    sitepod_uid: &str,
    name_prefix: &str,
    pod: &Pod,
    command: Vec<String>,
    behalf: (&str, &str, &str),
) -> Result<TaskState> {
    let pod_name = pod.name_any();
    let existing = ctx
        .stores
        .podtasks
        .list(Some(&sitepod_selector(sitepod_uid)))
        .await?
        .items
        .into_iter()
        .find(|t| t.spec.command == command && t.spec.pod_name == pod_name);

    if let Some(task) = existing {
        let state = if task.completed() && task.is_finished() {
            TaskState::Completed(task)
        } else if task.completed() {
            TaskState::Pending(task)
        } else if task.is_finished() {
            TaskState::Failed(task)
        } else {
            TaskState::Pending(task)
        };
        debug!(task = ?state, "Found existing pod task");
        return Ok(state);
    }

    let (behalf_type, behalf_of, behalf_condition) = behalf;
    let mut task = PodTask::new(
        "",
        PodTaskSpec {
            pod_name,
            container_name: MANAGER_CONTAINER.to_string(),
            command,
            max_attempts: ctx.config.pod_task.max_attempts,
            behalf_type: behalf_type.to_string(),
            behalf_of: behalf_of.to_string(),
            behalf_condition: behalf_condition.to_string(),
        },
    );
    task.metadata = ObjectMeta {
        generate_name: Some(format!("{name_prefix}-")),
        labels: Some(BTreeMap::from([(
            SITEPOD_LABEL.to_string(),
            sitepod_uid.to_string(),
        )])),
        ..Default::default()
    };
    let created = ctx.stores.podtasks.create(&task).await?;
    info!(task = %created.name_any(), behalf_of = %behalf_of, "Created pod task");
    Ok(TaskState::Created(created))
}

/// Create `desired`, or update `current` to match it when they differ.
///
/// `merge` copies the desired fields onto a fresh copy of the stored object.
/// Returns true when a write happened.
pub async fn upsert<K, F>(
    store: &dyn ObjectStore<K>,
    current: Option<&K>,
    desired: &K,
    merge: F,
) -> Result<bool>
where
    K: StoreObject + PartialEq,
    F: Fn(&K, &K) -> K,
{
    let current = match current {
        Some(c) => c.clone(),
        None => match store.create(desired).await {
            Ok(created) => {
                debug!(name = %created.name_any(), "Created object");
                return Ok(true);
            }
            // Created behind the cache's back; fall through and reconcile it.
            Err(StoreError::AlreadyExists(_)) => store.get(&desired.name_any()).await?,
            Err(e) => return Err(e.into()),
        },
    };
    let merged = merge(&current, desired);
    if merged == current {
        return Ok(false);
    }
    store.update(&merged).await?;
    debug!(name = %merged.name_any(), "Updated object");
    Ok(true)
}

/// Merge for ConfigMaps: labels and annotations are added, data is replaced.
pub fn merge_config_map(current: &ConfigMap, desired: &ConfigMap) -> ConfigMap {
    let mut merged = current.clone();
    merged
        .labels_mut()
        .extend(desired.labels().iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
        .annotations_mut()
        .extend(desired.annotations().iter().map(|(k, v)| (k.clone(), v.clone())));
    merged.data.clone_from(&desired.data);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn cm(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cfg".into()),
                labels: Some(BTreeMap::from([("a".to_string(), "b".to_string())])),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_ready_condition() {
        let mut pod = Pod::default();
        assert!(!pod_is_ready(&pod));
        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(pod_is_ready(&pod));
    }

    #[tokio::test]
    async fn test_upsert_writes_only_on_change() {
        let store = MemoryStore::<ConfigMap>::namespaced("ns");
        let desired = cm(&[("k", "v")]);
        assert!(upsert(&store, None, &desired, merge_config_map).await.unwrap());

        let current = store.get("cfg").await.unwrap();
        assert!(!upsert(&store, Some(&current), &desired, merge_config_map)
            .await
            .unwrap());
        assert_eq!(store.write_count(), 1);

        let changed = cm(&[("k", "v2")]);
        assert!(upsert(&store, Some(&current), &changed, merge_config_map)
            .await
            .unwrap());
        assert_eq!(
            store.get("cfg").await.unwrap().data.unwrap()["k"],
            "v2".to_string()
        );
    }

    #[tokio::test]
    async fn test_upsert_recovers_from_stale_cache_miss() {
        let store = MemoryStore::<ConfigMap>::namespaced("ns");
        store.create(&cm(&[("k", "old")])).await.unwrap();
        // The cache has not seen it yet.
        assert!(upsert(&store, None, &cm(&[("k", "new")]), merge_config_map)
            .await
            .unwrap());
        assert_eq!(
            store.get("cfg").await.unwrap().data.unwrap()["k"],
            "new".to_string()
        );
    }
}
