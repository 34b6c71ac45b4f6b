//! Renders every SystemUser into one shared passwd/shadow/group ConfigMap.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::resources::{merge_config_map, upsert};
use super::Context;
use crate::cache::HandlerFns;
use crate::config::EtcConfig;
use crate::crds::labels::{ETC_CONFIG_LABEL, ETC_CONFIG_VALUE, MOUNT_PATH_ANNOTATION};
use crate::crds::SystemUser;
use crate::error::Result;
use crate::queue::WorkQueue;
use crate::runtime::{Controller, Reconciler, Request};

/// Primary group of every system user.
pub const SITEPOD_GID: i64 = 2000;
pub const SITEPOD_GROUP: &str = "sitepod";
/// The single work item; every change re-renders the whole set.
pub const ETC_KEY: &str = "users";

/// `passwd`, `shadow` and `group` contents for users that have a file uid,
/// in the order given (cache key order when called from the reconciler).
pub fn render_etc_files(users: &[Arc<SystemUser>]) -> BTreeMap<String, String> {
    let users = users.iter().filter(|u| u.assigned_file_uid() > 0);

    let mut passwd = String::new();
    let mut shadow = String::new();
    let mut members = Vec::new();
    for user in users {
        let username = user.username();
        let _ = writeln!(
            passwd,
            "{username}:x:{}:{SITEPOD_GID}::{}:{}",
            user.assigned_file_uid(),
            user.home_directory(),
            user.shell()
        );
        if let Some(hash) = user.spec.hashed_password.crypt_string() {
            let _ = writeln!(shadow, "{username}:{hash}:::::::");
        }
        members.push(username);
    }
    let group = format!("{SITEPOD_GROUP}:x:{SITEPOD_GID}:{}\n", members.join(","));

    BTreeMap::from([
        ("passwd".to_string(), passwd),
        ("shadow".to_string(), shadow),
        ("group".to_string(), group),
    ])
}

pub fn desired_config_map(config: &EtcConfig, users: &[Arc<SystemUser>]) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config.config_map_name.clone()),
            labels: Some(BTreeMap::from([(
                ETC_CONFIG_LABEL.to_string(),
                ETC_CONFIG_VALUE.to_string(),
            )])),
            annotations: Some(BTreeMap::from([(
                MOUNT_PATH_ANNOTATION.to_string(),
                config.mount_path.clone(),
            )])),
            ..Default::default()
        },
        data: Some(render_etc_files(users)),
        ..Default::default()
    }
}

pub struct EtcReconciler {
    ctx: Arc<Context>,
}

impl EtcReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for EtcReconciler {
    #[instrument(skip(self), fields(controller = "etc"))]
    async fn sync(&self, _key: &str) -> Result<()> {
        let ctx = &self.ctx;
        let users = ctx.informers.systemusers.list();
        let desired = desired_config_map(&ctx.config.etc, &users);
        let current = ctx.informers.configmaps.get(&ctx.config.etc.config_map_name);
        let written = upsert(
            ctx.stores.configmaps.as_ref(),
            current.as_deref(),
            &desired,
            merge_config_map,
        )
        .await?;
        if written {
            info!(configmap = %desired.name_any(), users = users.len(), "Wrote user etc files");
        } else {
            debug!("User etc files unchanged");
        }
        Ok(())
    }
}

pub fn controller(ctx: &Arc<Context>) -> Controller {
    let queue = WorkQueue::new();
    let informers = &ctx.informers;

    let on_add = queue.clone();
    let on_update = queue.clone();
    let on_delete = queue.clone();
    informers
        .systemusers
        .add_event_handler(Arc::new(HandlerFns::<SystemUser> {
            // Users without a file uid are left out of the files anyway.
            on_add: Some(Box::new(move |u| {
                if u.assigned_file_uid() > 0 {
                    on_add.add(Request::Sync(ETC_KEY.to_string()));
                }
            })),
            on_update: Some(Box::new(move |_, u| {
                if u.assigned_file_uid() > 0 {
                    on_update.add(Request::Sync(ETC_KEY.to_string()));
                }
            })),
            on_delete: Some(Box::new(move |_| {
                on_delete.add(Request::Sync(ETC_KEY.to_string()));
            })),
        }));

    // Recreate the ConfigMap if someone removes it.
    let name = ctx.config.etc.config_map_name.clone();
    let on_cm_delete = queue.clone();
    informers
        .configmaps
        .add_event_handler(Arc::new(HandlerFns::<ConfigMap> {
            on_delete: Some(Box::new(move |cm| {
                if cm.name_any() == name {
                    on_cm_delete.add(Request::Sync(ETC_KEY.to_string()));
                }
            })),
            ..Default::default()
        }));

    ctx.controller("etc", Arc::new(EtcReconciler::new(ctx.clone())), queue)
        .with_dependency(Arc::new(informers.systemusers.clone()))
        .with_dependency(Arc::new(informers.configmaps.clone()))
}
