//! SystemUser file uid allocation and home directory provisioning.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::etc::SITEPOD_GID;
use super::resources::{ensure_pod_task, ready_pod, TaskState};
use super::Context;
use crate::cache::HandlerFns;
use crate::crds::labels::SITEPOD_LABEL;
use crate::crds::{Defaultable, SystemUser, CLUSTER_NAME, HOME_PROVISIONED_CONDITION};
use crate::error::{Error, Result};
use crate::queue::WorkQueue;
use crate::runtime::{Controller, Reconciler, Request};
use crate::store::{key_name, object_key, ObjectStore, StoreError, SITEPOD_INDEX};

/// Compare-and-swap attempts on the Cluster counter before giving up.
const ALLOCATE_ATTEMPTS: usize = 5;

/// Take the next file uid from the Cluster counter.
///
/// The Cluster is persisted before the value is returned, so a uid is never
/// handed out twice even if the caller fails to record it.
pub async fn allocate_file_uid(ctx: &Context) -> Result<i64> {
    let clusters = &ctx.stores.clusters;
    for attempt in 1..=ALLOCATE_ATTEMPTS {
        let mut cluster = match clusters.get(CLUSTER_NAME).await {
            Ok(c) => c,
            Err(StoreError::NotFound(_)) => {
                return Err(Error::not_ready(format!("cluster {CLUSTER_NAME}")))
            }
            Err(e) => return Err(e.into()),
        };
        let uid = cluster.next_file_uid();
        match clusters.update(&cluster).await {
            Ok(_) => return Ok(uid),
            Err(StoreError::Conflict(msg)) => {
                debug!(attempt, error = %msg, "File uid counter moved, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(StoreError::Conflict(format!(
        "file uid counter still contended after {ALLOCATE_ATTEMPTS} attempts"
    ))
    .into())
}

pub struct SystemUserReconciler {
    ctx: Arc<Context>,
}

impl SystemUserReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn provision_home(&self, user: &SystemUser, sitepod_uid: &str) -> Result<()> {
        let pod = ready_pod(&self.ctx, sitepod_uid)?;
        let name = user.name_any();
        let file_uid = user.assigned_file_uid().to_string();
        let home = format!(
            "{}/home/{}",
            self.ctx.config.manager.mount_path,
            user.username()
        );
        let command = vec![
            "install".to_string(),
            "-d".to_string(),
            "-o".to_string(),
            file_uid,
            "-g".to_string(),
            SITEPOD_GID.to_string(),
            "-m".to_string(),
            "0750".to_string(),
            home,
        ];
        let state = ensure_pod_task(
            &self.ctx,
            sitepod_uid,
            &format!("{name}-home"),
            &pod,
            command,
            ("SystemUser", &name, HOME_PROVISIONED_CONDITION),
        )
        .await?;
        match state {
            TaskState::Created(_) | TaskState::Pending(_) => {
                Err(Error::waiting(format!("home directory of {name}")))
            }
            TaskState::Completed(_) => Ok(()),
            TaskState::Failed(task) => Err(Error::invalid(format!(
                "home task {} for {name} failed",
                task.name_any()
            ))),
        }
    }
}

#[async_trait]
impl Reconciler for SystemUserReconciler {
    #[instrument(skip(self), fields(controller = "systemuser"))]
    async fn sync(&self, key: &str) -> Result<()> {
        let ctx = &self.ctx;
        let Some(cached) = ctx.informers.systemusers.get(key) else {
            debug!("SystemUser no longer exists");
            return Ok(());
        };
        let Some(sitepod_uid) = cached.labels().get(SITEPOD_LABEL).cloned() else {
            return Err(Error::invalid(format!(
                "{} has no {SITEPOD_LABEL} label",
                cached.name_any()
            )));
        };
        if ctx.sitepod_by_uid(&sitepod_uid).is_none() {
            info!(sitepod = %sitepod_uid, "Sitepod no longer exists, skipping");
            return Ok(());
        }

        let mut defaulted = (*cached).clone();
        defaulted.apply_defaults();
        if defaulted.spec != cached.spec || defaulted.annotations() != cached.annotations() {
            ctx.stores.systemusers.update(&defaulted).await?;
            info!("Applied SystemUser defaults");
            return Ok(());
        }

        let mut user = if cached.assigned_file_uid() > 0 {
            (*cached).clone()
        } else {
            // The uid must land on the newest version of the user.
            let mut user = ctx.stores.systemusers.get(key_name(key)).await?;
            if user.assigned_file_uid() == 0 {
                let file_uid = allocate_file_uid(ctx).await?;
                user.status.get_or_insert_with(Default::default).assigned_file_uid = file_uid;
                user = ctx.stores.systemusers.update_status(&user).await?;
                info!(username = %user.username(), file_uid, "Assigned file uid");
            }
            user
        };

        if !user.home_provisioned() {
            self.provision_home(&user, &sitepod_uid).await?;
            user = ctx.stores.systemusers.get(key_name(key)).await?;
            if !user.home_provisioned() {
                warn!(username = %user.username(), "Home task finished but condition not set yet");
                return Err(Error::waiting("home provisioned condition"));
            }
        }
        debug!(username = %user.username(), "SystemUser provisioned");
        Ok(())
    }
}

pub fn controller(ctx: &Arc<Context>) -> Controller {
    let queue = WorkQueue::new();
    let informers = &ctx.informers;

    let on_add = queue.clone();
    let on_update = queue.clone();
    informers
        .systemusers
        .add_event_handler(Arc::new(HandlerFns::<SystemUser> {
            on_add: Some(Box::new(move |u| on_add.add(Request::Sync(object_key(u.as_ref()))))),
            on_update: Some(Box::new(move |_, u| {
                on_update.add(Request::Sync(object_key(u.as_ref())));
            })),
            on_delete: None,
        }));

    // A pod turning ready unblocks home provisioning.
    let (q, users) = (queue.clone(), informers.systemusers.clone());
    informers
        .pods
        .add_event_handler(Arc::new(HandlerFns::any(move |pod: &Arc<Pod>| {
            let Some(uid) = pod.labels().get(SITEPOD_LABEL) else {
                return;
            };
            for user in users.by_index(SITEPOD_INDEX, uid) {
                if !user.home_provisioned() {
                    q.add(Request::Sync(object_key(user.as_ref())));
                }
            }
        })));

    ctx.controller("systemuser", Arc::new(SystemUserReconciler::new(ctx.clone())), queue)
        .with_dependency(Arc::new(informers.systemusers.clone()))
        .with_dependency(Arc::new(informers.sitepods.clone()))
        .with_dependency(Arc::new(informers.pods.clone()))
}
