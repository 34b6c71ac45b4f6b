//! Merges AppComponents into their Sitepod's Deployment as containers, with
//! their config files, shared volumes and an optional Service.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, KeyToPath, PodSpec,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::resources::{merge_config_map, upsert};
use super::specgen::SpecGenRegistry;
use super::{Context, HOME_VOLUME, MANAGER_CONTAINER};
use crate::cache::HandlerFns;
use crate::crds::labels::{
    APPCOMPONENT_LABEL, CONFIGTYPE_APPCOMPONENT, CONFIGTYPE_LABEL, ETC_CONFIG_LABEL,
    ETC_CONFIG_VALUE, MOUNT_PATH_ANNOTATION, SITEPOD_LABEL, SPECGEN_ANNOTATION,
};
use crate::crds::{AppComponent, Cluster, ConfigFile, CLUSTER_NAME};
use crate::error::{Error, Result};
use crate::queue::WorkQueue;
use crate::runtime::{Controller, Reconciler, Request};
use crate::store::{delete_ignore_missing, key_name, object_key, ObjectStore, SITEPOD_INDEX};

pub const TEMP_VOLUME: &str = "temp-storage";

/// A ConfigMap to mount into the component's container.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigMount {
    pub name: String,
    pub path: String,
    /// Key to file name/mode projections; `None` projects every key as is.
    pub items: Option<Vec<KeyToPath>>,
    /// Tolerate the ConfigMap disappearing.
    pub optional: bool,
}

/// Stable ConfigMap name for one directory of a component's files.
pub fn config_map_name(component: &str, directory: &str) -> String {
    let slug: String = directory
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        format!("{component}-root")
    } else {
        format!("{component}-{slug}")
    }
}

fn ensure_mount(container: &mut Container, mount: VolumeMount) {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    if !mounts.iter().any(|m| m.name == mount.name) {
        mounts.push(mount);
    }
}

fn ensure_volume(pod: &mut PodSpec, volume: Volume, replace: bool) {
    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    match volumes.iter_mut().find(|v| v.name == volume.name) {
        Some(existing) if replace => *existing = volume,
        Some(_) => {}
        None => volumes.push(volume),
    }
}

/// Write the component's container, mounts and volumes into `pod`.
pub fn apply_to_pod(pod: &mut PodSpec, component: &AppComponent, mounts: &[ConfigMount]) {
    let name = component.name_any();
    let idx = match pod.containers.iter().position(|c| c.name == name) {
        Some(idx) => idx,
        None => {
            pod.containers.push(Container {
                name: name.clone(),
                ..Default::default()
            });
            pod.containers.len() - 1
        }
    };

    let mut volumes = Vec::new();
    {
        let container = &mut pod.containers[idx];
        container.image = Some(component.spec.image_ref());
        container.image_pull_policy = Some("Always".to_string());

        for mount in mounts {
            ensure_mount(
                container,
                VolumeMount {
                    name: mount.name.clone(),
                    mount_path: mount.path.clone(),
                    ..Default::default()
                },
            );
            volumes.push(Volume {
                name: mount.name.clone(),
                config_map: Some(ConfigMapVolumeSource {
                    name: mount.name.clone(),
                    items: mount.items.clone(),
                    optional: mount.optional.then_some(true),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        if component.spec.mount_temp {
            ensure_mount(
                container,
                VolumeMount {
                    name: TEMP_VOLUME.to_string(),
                    mount_path: "/tmp".to_string(),
                    ..Default::default()
                },
            );
        }
        if component.spec.mount_home {
            ensure_mount(
                container,
                VolumeMount {
                    name: HOME_VOLUME.to_string(),
                    mount_path: "/home".to_string(),
                    sub_path: Some("home".to_string()),
                    ..Default::default()
                },
            );
        }
    }

    for volume in volumes {
        ensure_volume(pod, volume, true);
    }
    if component.spec.mount_temp {
        ensure_volume(
            pod,
            Volume {
                name: TEMP_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource {
                    medium: Some("Memory".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            false,
        );
    }
}

/// Service type for an exposed component.
pub fn service_type(cluster: &Cluster, component: &AppComponent) -> &'static str {
    if cluster.spec.use_load_balancer {
        "LoadBalancer"
    } else if component.spec.expose_externally {
        "NodePort"
    } else {
        "ClusterIP"
    }
}

/// Copy selector, type and ports onto the stored Service, keeping node ports
/// the server already assigned.
pub fn merge_service(current: &Service, desired: &Service) -> Service {
    let mut merged = current.clone();
    merged
        .labels_mut()
        .extend(desired.labels().iter().map(|(k, v)| (k.clone(), v.clone())));
    let Some(want) = desired.spec.as_ref() else {
        return merged;
    };
    let previous_ports = current
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default();
    let keep_node_ports = matches!(want.type_.as_deref(), Some("NodePort" | "LoadBalancer"));

    let spec = merged.spec.get_or_insert_with(ServiceSpec::default);
    spec.selector.clone_from(&want.selector);
    spec.type_.clone_from(&want.type_);
    spec.ports = want.ports.as_ref().map(|ports| {
        ports
            .iter()
            .map(|port| {
                let mut port = port.clone();
                if keep_node_ports {
                    port.node_port = previous_ports
                        .iter()
                        .find(|p| p.port == port.port)
                        .and_then(|p| p.node_port);
                }
                port
            })
            .collect()
    });
    merged
}

pub struct AppComponentReconciler {
    ctx: Arc<Context>,
    specgen: SpecGenRegistry,
}

impl AppComponentReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            specgen: SpecGenRegistry::default(),
        }
    }

    /// Upsert one ConfigMap per config file directory.
    async fn sync_config_files(
        &self,
        component: &AppComponent,
        uid: &str,
    ) -> Result<Vec<ConfigMount>> {
        let name = component.name_any();
        let mut by_directory: BTreeMap<&str, Vec<&ConfigFile>> = BTreeMap::new();
        for file in &component.spec.config_files {
            if file.directory.is_empty() {
                return Err(Error::invalid(format!(
                    "config file {} of {name} has no directory",
                    file.name
                )));
            }
            by_directory.entry(&file.directory).or_default().push(file);
        }

        let existing = self
            .ctx
            .informers
            .configmaps
            .by_index(SITEPOD_INDEX, uid);
        let mut mounts = Vec::new();
        for (directory, files) in by_directory {
            let current = existing.iter().find(|cm| {
                cm.labels().get(APPCOMPONENT_LABEL) == Some(&name)
                    && cm.labels().get(CONFIGTYPE_LABEL).map(String::as_str)
                        == Some(CONFIGTYPE_APPCOMPONENT)
                    && cm.annotations().get(MOUNT_PATH_ANNOTATION).map(String::as_str)
                        == Some(directory)
            });
            let cm_name = current.map_or_else(|| config_map_name(&name, directory), |cm| cm.name_any());

            let desired = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(cm_name.clone()),
                    labels: Some(BTreeMap::from([
                        (SITEPOD_LABEL.to_string(), uid.to_string()),
                        (APPCOMPONENT_LABEL.to_string(), name.clone()),
                        (CONFIGTYPE_LABEL.to_string(), CONFIGTYPE_APPCOMPONENT.to_string()),
                    ])),
                    annotations: Some(BTreeMap::from([(
                        MOUNT_PATH_ANNOTATION.to_string(),
                        directory.to_string(),
                    )])),
                    ..Default::default()
                },
                data: Some(
                    files
                        .iter()
                        .map(|f| (f.name.clone(), f.content.clone()))
                        .collect(),
                ),
                ..Default::default()
            };
            if upsert(
                self.ctx.stores.configmaps.as_ref(),
                current.map(|cm| &**cm),
                &desired,
                merge_config_map,
            )
            .await?
            {
                info!(configmap = %cm_name, directory = %directory, "Wrote config files");
            }

            mounts.push(ConfigMount {
                name: cm_name,
                path: directory.to_string(),
                items: Some(
                    files
                        .iter()
                        .map(|f| KeyToPath {
                            key: f.name.clone(),
                            path: f.file_name().to_string(),
                            mode: f.mode(),
                        })
                        .collect(),
                ),
                optional: false,
            });
        }
        Ok(mounts)
    }

    /// Every system-file ConfigMap, mounted where it asks to be.
    fn etc_mounts(&self) -> Vec<ConfigMount> {
        self.ctx
            .informers
            .configmaps
            .list()
            .into_iter()
            .filter(|cm| {
                cm.labels().get(ETC_CONFIG_LABEL).map(String::as_str) == Some(ETC_CONFIG_VALUE)
            })
            .filter_map(|cm| {
                let Some(path) = cm.annotations().get(MOUNT_PATH_ANNOTATION) else {
                    warn!(configmap = %cm.name_any(), "Etc ConfigMap has no mount path");
                    return None;
                };
                Some(ConfigMount {
                    name: cm.name_any(),
                    path: path.clone(),
                    items: None,
                    optional: true,
                })
            })
            .collect()
    }

    async fn sync_service(&self, component: &AppComponent, uid: &str) -> Result<()> {
        let cluster = self
            .ctx
            .informers
            .clusters
            .get(CLUSTER_NAME)
            .ok_or_else(|| Error::not_ready(format!("cluster {CLUSTER_NAME}")))?;
        let name = component.name_any();
        let port = component.spec.expose_port;
        if port <= 0 {
            return Err(Error::invalid(format!("{name} is exposed without a port")));
        }
        let desired = Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(BTreeMap::from([
                    (SITEPOD_LABEL.to_string(), uid.to_string()),
                    (APPCOMPONENT_LABEL.to_string(), name.clone()),
                ])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([(SITEPOD_LABEL.to_string(), uid.to_string())])),
                type_: Some(service_type(&cluster, component).to_string()),
                ports: Some(vec![ServicePort {
                    protocol: Some("TCP".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let services = self.ctx.stores.services.as_ref();
        let current = match services.get(&name).await {
            Ok(svc) => Some(svc),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        if upsert(services, current.as_ref(), &desired, merge_service).await? {
            info!(service = %name, "Wrote service");
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for AppComponentReconciler {
    #[instrument(skip(self), fields(controller = "appcomponent"))]
    async fn sync(&self, key: &str) -> Result<()> {
        let ctx = &self.ctx;
        let Some(component) = ctx.informers.appcomponents.get(key) else {
            debug!("AppComponent no longer exists");
            return Ok(());
        };
        let name = component.name_any();
        let uid = component
            .labels()
            .get(SITEPOD_LABEL)
            .cloned()
            .ok_or_else(|| Error::invalid(format!("{name} has no {SITEPOD_LABEL} label")))?;
        if ctx.sitepod_by_uid(&uid).is_none() {
            info!(sitepod = %uid, "Sitepod no longer exists, skipping");
            return Ok(());
        }
        let current = ctx
            .informers
            .deployments
            .by_index(SITEPOD_INDEX, &uid)
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_ready(format!("deployment for sitepod {uid}")))?;

        if let Some(generators) = component.annotations().get(SPECGEN_ANNOTATION) {
            let mut generated = (*component).clone();
            generated.annotations_mut().remove(SPECGEN_ANNOTATION);
            let applied = self.specgen.apply(generators, &mut generated.spec)?;
            ctx.stores.appcomponents.update(&generated).await?;
            // The update event brings the generated spec back through here.
            info!(generators = ?applied, "Applied spec generation");
            return Ok(());
        }

        let mut mounts = self.sync_config_files(&component, &uid).await?;
        if component.spec.mount_etcs {
            mounts.extend(self.etc_mounts());
        }

        let mut deployment: Deployment = (*current).clone();
        let pod = deployment
            .spec
            .get_or_insert_with(Default::default)
            .template
            .spec
            .get_or_insert_with(PodSpec::default);
        apply_to_pod(pod, &component, &mounts);

        if component.spec.expose {
            self.sync_service(&component, &uid).await?;
        }

        if deployment != *current {
            ctx.stores.deployments.update(&deployment).await?;
            info!(deployment = %deployment.name_any(), "Merged component into deployment");
        } else {
            debug!("Deployment already has component");
        }
        Ok(())
    }

    /// Remove what the component added once it is gone for good.
    #[instrument(skip(self), fields(controller = "appcomponent"))]
    async fn delete(&self, key: &str) -> Result<()> {
        let ctx = &self.ctx;
        if ctx.informers.appcomponents.get(key).is_some() {
            return Ok(());
        }
        let name = key_name(key).to_string();
        if name == MANAGER_CONTAINER {
            return Ok(());
        }

        let owned: Vec<_> = ctx
            .informers
            .configmaps
            .list()
            .into_iter()
            .filter(|cm| {
                cm.labels().get(APPCOMPONENT_LABEL) == Some(&name)
                    && cm.labels().get(CONFIGTYPE_LABEL).map(String::as_str)
                        == Some(CONFIGTYPE_APPCOMPONENT)
            })
            .collect();
        let owned_volumes: Vec<String> = owned.iter().map(|cm| cm.name_any()).collect();

        for current in ctx.informers.deployments.list() {
            let mut deployment = (*current).clone();
            let Some(pod) = deployment
                .spec
                .as_mut()
                .and_then(|s| s.template.spec.as_mut())
            else {
                continue;
            };
            if !pod.containers.iter().any(|c| c.name == name) {
                continue;
            }
            pod.containers.retain(|c| c.name != name);
            if let Some(volumes) = pod.volumes.as_mut() {
                volumes.retain(|v| !owned_volumes.contains(&v.name));
            }
            ctx.stores.deployments.update(&deployment).await?;
            info!(deployment = %deployment.name_any(), "Removed component container");
        }

        for cm in owned {
            delete_ignore_missing(ctx.stores.configmaps.as_ref(), &cm.name_any()).await?;
        }
        match ctx.stores.services.get(&name).await {
            Ok(svc) if svc.labels().get(APPCOMPONENT_LABEL) == Some(&name) => {
                delete_ignore_missing(ctx.stores.services.as_ref(), &name).await?;
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

fn enqueue_components<'a>(
    queue: &WorkQueue<Request>,
    components: impl IntoIterator<Item = &'a Arc<AppComponent>>,
) {
    for component in components {
        queue.add(Request::Sync(object_key(component.as_ref())));
    }
}

pub fn controller(ctx: &Arc<Context>) -> Controller {
    let queue: WorkQueue<Request> = WorkQueue::new();
    let informers = &ctx.informers;

    let on_add = queue.clone();
    let on_update = queue.clone();
    let on_delete = queue.clone();
    informers
        .appcomponents
        .add_event_handler(Arc::new(HandlerFns::<AppComponent> {
            on_add: Some(Box::new(move |ac| {
                on_add.add(Request::Sync(object_key(ac.as_ref())));
            })),
            on_update: Some(Box::new(move |_, ac| {
                on_update.add(Request::Sync(object_key(ac.as_ref())));
            })),
            on_delete: Some(Box::new(move |ac| {
                on_delete.add(Request::Delete(object_key(ac.as_ref())));
            })),
        }));

    // A (re)created Deployment needs every component merged back in.
    let (q, components) = (queue.clone(), informers.appcomponents.clone());
    informers
        .deployments
        .add_event_handler(Arc::new(HandlerFns::any(move |d: &Arc<Deployment>| {
            if let Some(uid) = d.labels().get(SITEPOD_LABEL) {
                enqueue_components(&q, &components.by_index(SITEPOD_INDEX, uid));
            }
        })));

    let (q, components) = (queue.clone(), informers.appcomponents.clone());
    let etc_changed = move |cm: &Arc<ConfigMap>| {
        if cm.labels().get(ETC_CONFIG_LABEL).map(String::as_str) == Some(ETC_CONFIG_VALUE) {
            let list = components.list();
            enqueue_components(&q, list.iter().filter(|ac| ac.spec.mount_etcs));
        }
    };
    let on_etc_delete = etc_changed.clone();
    informers
        .configmaps
        .add_event_handler(Arc::new(HandlerFns::<ConfigMap> {
            on_add: Some(Box::new(etc_changed)),
            on_update: None,
            on_delete: Some(Box::new(on_etc_delete)),
        }));

    let (q, components) = (queue.clone(), informers.appcomponents.clone());
    informers
        .clusters
        .add_event_handler(Arc::new(HandlerFns::<Cluster> {
            on_update: Some(Box::new(move |old, new| {
                if old.spec.use_load_balancer != new.spec.use_load_balancer {
                    let list = components.list();
                    enqueue_components(&q, list.iter().filter(|ac| ac.spec.expose));
                }
            })),
            ..Default::default()
        }));

    let reconciler = Arc::new(AppComponentReconciler::new(ctx.clone()));
    ctx.controller("appcomponent", reconciler, queue)
        .with_dependency(Arc::new(informers.appcomponents.clone()))
        .with_dependency(Arc::new(informers.sitepods.clone()))
        .with_dependency(Arc::new(informers.deployments.clone()))
        .with_dependency(Arc::new(informers.configmaps.clone()))
        .with_dependency(Arc::new(informers.clusters.clone()))
}
