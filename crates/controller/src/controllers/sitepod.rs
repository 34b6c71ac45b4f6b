//! Sitepod provisioning and cascading deletion.
//!
//! A Sitepod owns one Deployment (selected by `sitepod=<uid>`) carrying the
//! manager container and the home volume. Everything else labeled with the
//! uid is removed when the Sitepod goes away.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource,
    Pod, PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::resources::{ensure_pod_task, ready_pod, TaskState};
use super::{Context, HOME_VOLUME, MANAGER_CONTAINER};
use crate::cache::{HandlerFns, Informer};
use crate::config::ControllerConfig;
use crate::crds::labels::{sitepod_selector, PINNED_HOST_ANNOTATION, SITEPOD_LABEL};
use crate::crds::{Sitepod, STORAGE_READY_CONDITION};
use crate::error::{Error, Result};
use crate::queue::WorkQueue;
use crate::runtime::{Controller, Reconciler, Request};
use crate::store::{
    delete_ignore_missing, selector_from_labels, ObjectStore, StoreError, StoreObject,
    SITEPOD_INDEX, UID_INDEX,
};

pub struct SitepodReconciler {
    ctx: Arc<Context>,
}

impl SitepodReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Node the volume is pinned to, when it is host-local.
    fn pinned_host(pv: &PersistentVolume) -> Result<Option<String>> {
        let host_local = pv
            .spec
            .as_ref()
            .is_some_and(|s| s.host_path.is_some() || s.local.is_some());
        if !host_local {
            return Ok(None);
        }
        pv.annotations()
            .get(PINNED_HOST_ANNOTATION)
            .filter(|h| !h.is_empty())
            .map(|h| Some(h.clone()))
            .ok_or_else(|| {
                Error::invalid(format!(
                    "host-local volume {} has no {PINNED_HOST_ANNOTATION} annotation",
                    pv.name_any()
                ))
            })
    }

    async fn provision_storage(&self, sitepod: &Sitepod, uid: &str) -> Result<()> {
        let name = sitepod.name_any();
        let pod = ready_pod(&self.ctx, uid)?;
        let command = vec![
            "mkdir".to_string(),
            "-p".to_string(),
            format!("{}/home", self.ctx.config.manager.mount_path),
        ];
        let state = ensure_pod_task(
            &self.ctx,
            uid,
            &format!("{name}-storage"),
            &pod,
            command,
            ("Sitepod", &name, STORAGE_READY_CONDITION),
        )
        .await?;
        match state {
            TaskState::Created(_) | TaskState::Pending(_) => {
                Err(Error::waiting(format!("storage setup for {name} in progress")))
            }
            // The task signals the Sitepod; its status update brings us back.
            TaskState::Completed(_) => Ok(()),
            TaskState::Failed(task) => Err(Error::invalid(format!(
                "storage setup task {} ran out of attempts",
                task.name_any()
            ))),
        }
    }

    async fn delete_labeled<K: StoreObject>(
        store: &dyn ObjectStore<K>,
        objects: Vec<Arc<K>>,
    ) -> Result<()> {
        for obj in objects {
            delete_ignore_missing(store, &obj.name_any()).await?;
        }
        Ok(())
    }
}

/// Deployment for `sitepod`, built on top of `current` so containers added
/// by AppComponents survive.
pub fn desired_deployment(
    config: &ControllerConfig,
    sitepod: &Sitepod,
    uid: &str,
    claim: &str,
    pinned_host: Option<&str>,
    current: Option<&Deployment>,
) -> Deployment {
    let labels = BTreeMap::from([(SITEPOD_LABEL.to_string(), uid.to_string())]);
    let mut deployment = current.cloned().unwrap_or_else(|| Deployment {
        metadata: ObjectMeta {
            name: Some(sitepod.name_any()),
            ..Default::default()
        },
        ..Default::default()
    });
    deployment.labels_mut().extend(labels.clone());

    let spec = deployment.spec.get_or_insert_with(DeploymentSpec::default);
    spec.replicas = Some(1);
    spec.selector = LabelSelector {
        match_labels: Some(labels.clone()),
        ..Default::default()
    };
    spec.template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels);

    let pod = spec.template.spec.get_or_insert_with(PodSpec::default);
    pod.node_name = pinned_host.map(str::to_string);

    if !pod.containers.iter().any(|c| c.name == MANAGER_CONTAINER) {
        pod.containers.push(Container {
            name: MANAGER_CONTAINER.to_string(),
            image: Some(config.manager.image.reference()),
            volume_mounts: Some(vec![VolumeMount {
                name: HOME_VOLUME.to_string(),
                mount_path: config.manager.mount_path.clone(),
                ..Default::default()
            }]),
            ..Default::default()
        });
    }

    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    let home = PersistentVolumeClaimVolumeSource {
        claim_name: claim.to_string(),
        read_only: None,
    };
    match volumes.iter_mut().find(|v| v.name == HOME_VOLUME) {
        Some(v) => v.persistent_volume_claim = Some(home),
        None => volumes.push(Volume {
            name: HOME_VOLUME.to_string(),
            persistent_volume_claim: Some(home),
            ..Default::default()
        }),
    }
    deployment
}

#[async_trait]
impl Reconciler for SitepodReconciler {
    #[instrument(skip(self), fields(controller = "sitepod"))]
    async fn sync(&self, uid: &str) -> Result<()> {
        let ctx = &self.ctx;
        let Some(sitepod) = ctx.sitepod_by_uid(uid) else {
            debug!("Sitepod no longer exists");
            return Ok(());
        };
        let name = sitepod.name_any();

        let claim = sitepod
            .root_claim()
            .ok_or_else(|| Error::invalid(format!("sitepod {name} has no volume claims")))?;
        let pvc = ctx
            .informers
            .pvcs
            .get(claim)
            .ok_or_else(|| Error::not_ready(format!("claim {claim}")))?;
        let pv_name = pvc
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::not_ready(format!("claim {claim} is not bound")))?;
        let pv = ctx
            .informers
            .pvs
            .get(&pv_name)
            .ok_or_else(|| Error::not_ready(format!("volume {pv_name}")))?;
        let pinned = Self::pinned_host(&pv)?;

        let current = ctx
            .informers
            .deployments
            .by_index(SITEPOD_INDEX, uid)
            .into_iter()
            .next();
        let desired = desired_deployment(
            &ctx.config,
            &sitepod,
            uid,
            claim,
            pinned.as_deref(),
            current.as_deref(),
        );
        match current {
            None => match ctx.stores.deployments.create(&desired).await {
                Ok(created) => info!(deployment = %created.name_any(), "Created deployment"),
                Err(StoreError::AlreadyExists(_)) => {
                    return Err(Error::waiting(format!("deployment for {name} not cached yet")))
                }
                Err(e) => return Err(e.into()),
            },
            Some(current) if *current != desired => {
                ctx.stores.deployments.update(&desired).await?;
                info!(deployment = %desired.name_any(), "Updated deployment");
            }
            Some(_) => debug!("Deployment up to date"),
        }

        if !sitepod.storage_setup() {
            self.provision_storage(&sitepod, uid).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(controller = "sitepod"))]
    async fn delete(&self, uid: &str) -> Result<()> {
        let ctx = &self.ctx;
        if ctx.sitepod_by_uid(uid).is_some() {
            info!("Sitepod is live, not deleting");
            return Ok(());
        }

        for deployment in ctx.informers.deployments.by_index(SITEPOD_INDEX, uid) {
            let name = deployment.name_any();
            let spec_replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            if spec_replicas != 0 {
                let mut scaled = (*deployment).clone();
                scaled.spec.get_or_insert_with(Default::default).replicas = Some(0);
                ctx.stores.deployments.update(&scaled).await?;
                info!(deployment = %name, "Scaling deployment to zero");
                return Err(Error::waiting(format!("scaling down {name}")));
            }
            let running = deployment
                .status
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(0);
            if running != 0 {
                return Err(Error::waiting(format!("{name} still has {running} replicas")));
            }

            delete_ignore_missing(ctx.stores.deployments.as_ref(), &name).await?;
            let selector = deployment
                .spec
                .as_ref()
                .and_then(|s| s.selector.match_labels.as_ref())
                .filter(|labels| !labels.is_empty())
                .map(|labels| selector_from_labels(labels))
                .unwrap_or_else(|| sitepod_selector(uid));
            for rs in ctx.stores.replicasets.list(Some(&selector)).await?.items {
                delete_ignore_missing(ctx.stores.replicasets.as_ref(), &rs.name_any()).await?;
            }
            info!(deployment = %name, "Deleted deployment");
        }

        let informers = &ctx.informers;
        let stores = &ctx.stores;
        Self::delete_labeled(
            stores.podtasks.as_ref(),
            informers.podtasks.by_index(SITEPOD_INDEX, uid),
        )
        .await?;
        Self::delete_labeled(
            stores.systemusers.as_ref(),
            informers.systemusers.by_index(SITEPOD_INDEX, uid),
        )
        .await?;
        Self::delete_labeled(
            stores.appcomponents.as_ref(),
            informers.appcomponents.by_index(SITEPOD_INDEX, uid),
        )
        .await?;
        Self::delete_labeled(
            stores.websites.as_ref(),
            informers.websites.by_index(SITEPOD_INDEX, uid),
        )
        .await?;
        Self::delete_labeled(
            stores.configmaps.as_ref(),
            informers.configmaps.by_index(SITEPOD_INDEX, uid),
        )
        .await?;
        for service in stores.services.list(Some(&sitepod_selector(uid))).await?.items {
            delete_ignore_missing(stores.services.as_ref(), &service.name_any()).await?;
        }
        info!("Sitepod resources deleted");
        Ok(())
    }
}

/// Uids of Sitepods whose root claim is `claim`.
fn sitepods_for_claim(sitepods: &Informer<Sitepod>, claim: &str) -> Vec<String> {
    sitepods
        .list()
        .iter()
        .filter(|sp| sp.root_claim() == Some(claim))
        .filter_map(|sp| sp.uid())
        .collect()
}

pub fn controller(ctx: &Arc<Context>) -> Controller {
    let queue: WorkQueue<Request> = WorkQueue::new();
    let informers = &ctx.informers;

    let on_add = queue.clone();
    let on_update = queue.clone();
    let on_delete = queue.clone();
    informers.sitepods.add_event_handler(Arc::new(HandlerFns::<Sitepod> {
        on_add: Some(Box::new(move |sp| {
            if let Some(uid) = sp.uid() {
                on_add.add(Request::Sync(uid));
            }
        })),
        on_update: Some(Box::new(move |_, sp| {
            if let Some(uid) = sp.uid() {
                on_update.add(Request::Sync(uid));
            }
        })),
        on_delete: Some(Box::new(move |sp| {
            if let Some(uid) = sp.uid() {
                on_delete.add(Request::Delete(uid));
            }
        })),
    }));

    let (q, sitepods) = (queue.clone(), informers.sitepods.clone());
    informers
        .pvcs
        .add_event_handler(Arc::new(HandlerFns::any(move |pvc: &Arc<PersistentVolumeClaim>| {
            for uid in sitepods_for_claim(&sitepods, &pvc.name_any()) {
                q.add(Request::Sync(uid));
            }
        })));

    let (q, sitepods) = (queue.clone(), informers.sitepods.clone());
    informers
        .pvs
        .add_event_handler(Arc::new(HandlerFns::any(move |pv: &Arc<PersistentVolume>| {
            let claim = pv
                .spec
                .as_ref()
                .and_then(|s| s.claim_ref.as_ref())
                .and_then(|r| r.name.as_deref());
            if let Some(claim) = claim {
                for uid in sitepods_for_claim(&sitepods, claim) {
                    q.add(Request::Sync(uid));
                }
            }
        })));

    let q = queue.clone();
    informers.pods.add_event_handler(Arc::new(HandlerFns::any(move |pod: &Arc<Pod>| {
        if let Some(uid) = pod.labels().get(SITEPOD_LABEL) {
            q.add(Request::Sync(uid.clone()));
        }
    })));

    let (q, sitepods) = (queue.clone(), informers.sitepods.clone());
    let grace = ctx.config.orphan_grace();
    informers
        .deployments
        .add_event_handler(Arc::new(HandlerFns::any(move |d: &Arc<Deployment>| {
            let Some(uid) = d.labels().get(SITEPOD_LABEL) else {
                return;
            };
            if sitepods.by_index(UID_INDEX, uid).is_empty() {
                q.add_after(Request::Delete(uid.clone()), grace);
            } else {
                q.add(Request::Sync(uid.clone()));
            }
        })));

    let reconciler = Arc::new(SitepodReconciler::new(ctx.clone()));
    ctx.controller("sitepod", reconciler, queue)
        .with_dependency(Arc::new(informers.sitepods.clone()))
        .with_dependency(Arc::new(informers.deployments.clone()))
        .with_dependency(Arc::new(informers.pods.clone()))
        .with_dependency(Arc::new(informers.pvcs.clone()))
        .with_dependency(Arc::new(informers.pvs.clone()))
        .with_dependency(Arc::new(informers.podtasks.clone()))
        .with_dependency(Arc::new(informers.systemusers.clone()))
        .with_dependency(Arc::new(informers.appcomponents.clone()))
        .with_dependency(Arc::new(informers.websites.clone()))
        .with_dependency(Arc::new(informers.configmaps.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::testing;
    use crate::crds::{PodTask, PodTaskStatus, SystemUser, SystemUserSpec};
    use crate::store::memory::Op;
    use k8s_openapi::api::apps::v1::{DeploymentStatus, ReplicaSet};

    async fn deployment_for(ctx: &Context, uid: &str) -> Deployment {
        let uid = uid.to_string();
        testing::eventually(|| !ctx.informers.deployments.by_index(SITEPOD_INDEX, &uid).is_empty())
            .await;
        (*ctx.informers.deployments.by_index(SITEPOD_INDEX, &uid)[0]).clone()
    }

    #[tokio::test]
    async fn test_provisions_pinned_deployment_once() {
        let mem = testing::stores();
        let sp = testing::sitepod(&mem, "alpha", Some("node-1")).await;
        let uid = sp.uid().unwrap();
        let ctx = testing::context(&mem, testing::no_exec());
        let _token = testing::start(&ctx).await;
        let r = SitepodReconciler::new(ctx.clone());

        // No pod yet, so storage setup waits.
        let err = r.sync(&uid).await.unwrap_err();
        assert!(matches!(err, Error::ConditionsNotReady(_)));

        let d = deployment_for(&ctx, &uid).await;
        let spec = d.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.selector.match_labels.as_ref().unwrap()[SITEPOD_LABEL],
            uid
        );
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.node_name.as_deref(), Some("node-1"));
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].name, MANAGER_CONTAINER);
        let volumes = pod.volumes.as_ref().unwrap();
        assert_eq!(
            volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
            "alpha-home"
        );

        // Converged: another pass writes nothing.
        let writes = mem.deployments.write_count();
        let _ = r.sync(&uid).await;
        assert_eq!(mem.deployments.write_count(), writes);
    }

    #[tokio::test]
    async fn test_keeps_containers_added_by_others() {
        let mem = testing::stores();
        let sp = testing::sitepod(&mem, "alpha", None).await;
        let uid = sp.uid().unwrap();
        let ctx = testing::context(&mem, testing::no_exec());
        let _token = testing::start(&ctx).await;
        let r = SitepodReconciler::new(ctx.clone());
        let _ = r.sync(&uid).await;

        let mut d = deployment_for(&ctx, &uid).await;
        if let Some(pod) = d.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
            pod.containers.push(Container {
                name: "web".into(),
                ..Default::default()
            });
        }
        let d = mem.deployments.update(&d).await.unwrap();
        let rv = d.resource_version();
        testing::eventually(|| {
            ctx.informers.deployments.by_index(SITEPOD_INDEX, &uid)[0].resource_version() == rv
        })
        .await;

        let _ = r.sync(&uid).await;
        let stored = mem.deployments.get("alpha").await.unwrap();
        let containers = stored.spec.unwrap().template.spec.unwrap().containers;
        let names: Vec<_> = containers.into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec![MANAGER_CONTAINER.to_string(), "web".to_string()]);
    }

    #[tokio::test]
    async fn test_input_errors() {
        let mem = testing::stores();
        let unpinned = testing::sitepod(&mem, "local", Some("")).await;
        let unclaimed = mem
            .sitepods
            .create(&Sitepod::new("bare", Default::default()))
            .await
            .unwrap();
        let mut missing = Sitepod::new("missing", Default::default());
        missing.spec.volume_claims = vec!["nowhere".into()];
        let missing = mem.sitepods.create(&missing).await.unwrap();

        let ctx = testing::context(&mem, testing::no_exec());
        let _token = testing::start(&ctx).await;
        let r = SitepodReconciler::new(ctx);

        let err = r.sync(&unpinned.uid().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::DependentConfigNotValid(_)));
        let err = r.sync(&unclaimed.uid().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::DependentConfigNotValid(_)));
        let err = r.sync(&missing.uid().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::DependentResourcesNotReady(_)));
        assert_eq!(mem.deployments.write_count(), 0);
    }

    #[tokio::test]
    async fn test_storage_task_created_once() {
        let mem = testing::stores();
        let sp = testing::sitepod(&mem, "alpha", None).await;
        let uid = sp.uid().unwrap();
        testing::ready_pod(&mem, &uid, "alpha-pod").await;
        let ctx = testing::context(&mem, testing::no_exec());
        let _token = testing::start(&ctx).await;
        let r = SitepodReconciler::new(ctx);

        for _ in 0..3 {
            let err = r.sync(&uid).await.unwrap_err();
            assert!(matches!(err, Error::ConditionsNotReady(_)));
        }
        let tasks = mem.podtasks.objects();
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.spec.pod_name, "alpha-pod");
        assert_eq!(task.spec.container_name, MANAGER_CONTAINER);
        assert_eq!(task.spec.command, vec!["mkdir", "-p", "/sitepod/home"]);
        assert_eq!(task.spec.behalf_type, "Sitepod");
        assert_eq!(task.spec.behalf_of, "alpha");
        assert_eq!(task.spec.behalf_condition, STORAGE_READY_CONDITION);
        assert_eq!(task.labels()[SITEPOD_LABEL], uid);
    }

    #[tokio::test]
    async fn test_storage_waits_for_task_signal() {
        let mem = testing::stores();
        let sp = testing::sitepod(&mem, "alpha", None).await;
        let uid = sp.uid().unwrap();
        testing::ready_pod(&mem, &uid, "alpha-pod").await;
        let ctx = testing::context(&mem, testing::no_exec());
        let _token = testing::start(&ctx).await;
        let r = SitepodReconciler::new(ctx);
        for _ in 0..2 {
            let _ = r.sync(&uid).await;
        }

        // Ran, but the Sitepod was never told.
        let mut task = mem.podtasks.objects().remove(0);
        task.status = Some(PodTaskStatus {
            completed: true,
            attempts: 1,
            ..Default::default()
        });
        mem.podtasks.update_status(&task).await.unwrap();

        let err = r.sync(&uid).await.unwrap_err();
        assert!(matches!(err, Error::ConditionsNotReady(_)));
        assert_eq!(mem.podtasks.objects().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_waits_for_running_replicas() {
        let mem = testing::stores();
        let sp = testing::sitepod(&mem, "alpha", None).await;
        let uid = sp.uid().unwrap();
        mem.replicasets
            .create(&ReplicaSet {
                metadata: ObjectMeta {
                    name: Some("alpha-rs".into()),
                    labels: Some(BTreeMap::from([(SITEPOD_LABEL.to_string(), uid.clone())])),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        let ctx = testing::context(&mem, testing::no_exec());
        let _token = testing::start(&ctx).await;
        let r = SitepodReconciler::new(ctx.clone());
        let _ = r.sync(&uid).await;
        deployment_for(&ctx, &uid).await;

        let mut d = mem.deployments.get("alpha").await.unwrap();
        d.spec.get_or_insert_with(Default::default).replicas = Some(3);
        let mut d = mem.deployments.update(&d).await.unwrap();
        d.status = Some(DeploymentStatus {
            replicas: Some(3),
            ..Default::default()
        });
        let d = mem.deployments.update_status(&d).await.unwrap();
        let rv = d.resource_version();
        testing::eventually(|| {
            ctx.informers.deployments.by_index(SITEPOD_INDEX, &uid)[0].resource_version() == rv
        })
        .await;

        mem.sitepods.delete("alpha").await.unwrap();
        testing::eventually(|| ctx.sitepod_by_uid(&uid).is_none()).await;

        // First pass only scales down.
        let err = r.delete(&uid).await.unwrap_err();
        assert!(matches!(err, Error::ConditionsNotReady(_)));
        assert_eq!(mem.deployments.objects().len(), 1);
        testing::eventually(|| {
            ctx.informers.deployments.by_index(SITEPOD_INDEX, &uid)[0]
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                == Some(0)
        })
        .await;

        // Scaled to zero but pods are still running.
        let err = r.delete(&uid).await.unwrap_err();
        assert!(matches!(err, Error::ConditionsNotReady(_)));
        assert_eq!(mem.deployments.objects().len(), 1);

        let mut d = mem.deployments.get("alpha").await.unwrap();
        d.status = Some(DeploymentStatus {
            replicas: Some(0),
            ..Default::default()
        });
        let d = mem.deployments.update_status(&d).await.unwrap();
        let rv = d.resource_version();
        testing::eventually(|| {
            ctx.informers.deployments.by_index(SITEPOD_INDEX, &uid)[0].resource_version() == rv
        })
        .await;

        // A ReplicaSet that vanished underneath us is not an error.
        mem.replicasets
            .fail_next(Op::Delete, StoreError::NotFound("alpha-rs".into()));
        r.delete(&uid).await.unwrap();
        assert!(mem.deployments.objects().is_empty());
    }

    #[tokio::test]
    async fn test_delete_scales_down_then_removes_everything() {
        let mem = testing::stores();
        let sp = testing::sitepod(&mem, "alpha", None).await;
        let uid = sp.uid().unwrap();
        let labels = BTreeMap::from([(SITEPOD_LABEL.to_string(), uid.clone())]);
        mem.replicasets
            .create(&ReplicaSet {
                metadata: ObjectMeta {
                    name: Some("alpha-rs".into()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        let mut user = SystemUser::new("systemuser-bob", SystemUserSpec::default());
        user.metadata.labels = Some(labels.clone());
        mem.systemusers.create(&user).await.unwrap();
        let mut task = PodTask::new("alpha-task", Default::default());
        task.metadata.labels = Some(labels);
        mem.podtasks.create(&task).await.unwrap();

        let ctx = testing::context(&mem, testing::no_exec());
        let _token = testing::start(&ctx).await;
        let r = SitepodReconciler::new(ctx.clone());
        let _ = r.sync(&uid).await;
        deployment_for(&ctx, &uid).await;

        mem.sitepods.delete("alpha").await.unwrap();
        testing::eventually(|| ctx.sitepod_by_uid(&uid).is_none()).await;

        let err = r.delete(&uid).await.unwrap_err();
        assert!(matches!(err, Error::ConditionsNotReady(_)));
        let scaled = mem.deployments.get("alpha").await.unwrap();
        assert_eq!(scaled.spec.unwrap().replicas, Some(0));
        testing::eventually(|| {
            ctx.informers.deployments.by_index(SITEPOD_INDEX, &uid)[0]
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                == Some(0)
        })
        .await;

        r.delete(&uid).await.unwrap();
        assert!(mem.deployments.objects().is_empty());
        assert!(mem.replicasets.objects().is_empty());
        assert!(mem.systemusers.objects().is_empty());
        assert!(mem.podtasks.objects().is_empty());
        // The PVC is not ours to delete.
        assert_eq!(mem.pvcs.objects().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_skips_live_sitepod() {
        let mem = testing::stores();
        let sp = testing::sitepod(&mem, "alpha", None).await;
        let uid = sp.uid().unwrap();
        let ctx = testing::context(&mem, testing::no_exec());
        let _token = testing::start(&ctx).await;
        let r = SitepodReconciler::new(ctx.clone());
        let _ = r.sync(&uid).await;
        deployment_for(&ctx, &uid).await;

        r.delete(&uid).await.unwrap();
        assert_eq!(mem.deployments.objects().len(), 1);
    }
}
