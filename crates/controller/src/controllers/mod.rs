//! Reconcilers and the wiring that runs them.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolume, PersistentVolumeClaim, Pod, Service,
};
use kube::api::Api;
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::cache::{Informer, Synced};
use crate::config::ControllerConfig;
use crate::crds::{
    AppComponent, Cluster, ClusterSpec, PodTask, Sitepod, SystemUser, Website, CLUSTER_NAME,
};
use crate::error::Result;
use crate::exec::PodExecutor;
use crate::queue::WorkQueue;
use crate::runtime::{Controller, Reconciler, Request};
use crate::store::{KubeStore, MemoryStore, ObjectStore, ResourceKind, StoreError};

pub mod appcomp;
pub mod etc;
pub mod orphans;
pub mod podtask;
pub mod resources;
pub mod sitepod;
pub mod specgen;
pub mod systemuser;
pub mod website;

pub use podtask::{ConditionRegistry, ConditionTarget};

/// Store handles for every kind the controllers read or write.
#[derive(Clone)]
pub struct Stores {
    pub sitepods: Arc<dyn ObjectStore<Sitepod>>,
    pub appcomponents: Arc<dyn ObjectStore<AppComponent>>,
    pub systemusers: Arc<dyn ObjectStore<SystemUser>>,
    pub podtasks: Arc<dyn ObjectStore<PodTask>>,
    pub websites: Arc<dyn ObjectStore<Website>>,
    pub clusters: Arc<dyn ObjectStore<Cluster>>,
    pub deployments: Arc<dyn ObjectStore<Deployment>>,
    pub replicasets: Arc<dyn ObjectStore<ReplicaSet>>,
    pub pods: Arc<dyn ObjectStore<Pod>>,
    pub pvcs: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
    pub pvs: Arc<dyn ObjectStore<PersistentVolume>>,
    pub configmaps: Arc<dyn ObjectStore<ConfigMap>>,
    pub services: Arc<dyn ObjectStore<Service>>,
}

impl Stores {
    /// Stores backed by the API server. Persistent volumes are cluster-scoped.
    pub fn kube(client: &Client, namespace: &str) -> Self {
        Self {
            sitepods: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            appcomponents: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            systemusers: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            podtasks: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            websites: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            clusters: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            deployments: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            replicasets: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            pods: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            pvcs: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            pvs: Arc::new(KubeStore::new(Api::all(client.clone()))),
            configmaps: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
            services: Arc::new(KubeStore::new(Api::namespaced(client.clone(), namespace))),
        }
    }
}

/// Concrete in-memory stores, kept so tests can seed and inspect them.
#[derive(Clone)]
pub struct MemoryStores {
    pub sitepods: MemoryStore<Sitepod>,
    pub appcomponents: MemoryStore<AppComponent>,
    pub systemusers: MemoryStore<SystemUser>,
    pub podtasks: MemoryStore<PodTask>,
    pub websites: MemoryStore<Website>,
    pub clusters: MemoryStore<Cluster>,
    pub deployments: MemoryStore<Deployment>,
    pub replicasets: MemoryStore<ReplicaSet>,
    pub pods: MemoryStore<Pod>,
    pub pvcs: MemoryStore<PersistentVolumeClaim>,
    pub pvs: MemoryStore<PersistentVolume>,
    pub configmaps: MemoryStore<ConfigMap>,
    pub services: MemoryStore<Service>,
}

impl MemoryStores {
    pub fn new(namespace: &str) -> Self {
        Self {
            sitepods: MemoryStore::namespaced(namespace),
            appcomponents: MemoryStore::namespaced(namespace),
            systemusers: MemoryStore::namespaced(namespace),
            podtasks: MemoryStore::namespaced(namespace),
            websites: MemoryStore::namespaced(namespace),
            clusters: MemoryStore::namespaced(namespace),
            deployments: MemoryStore::namespaced(namespace),
            replicasets: MemoryStore::namespaced(namespace),
            pods: MemoryStore::namespaced(namespace),
            pvcs: MemoryStore::namespaced(namespace),
            pvs: MemoryStore::cluster(),
            configmaps: MemoryStore::namespaced(namespace),
            services: MemoryStore::namespaced(namespace),
        }
    }

    pub fn stores(&self) -> Stores {
        Stores {
            sitepods: Arc::new(self.sitepods.clone()),
            appcomponents: Arc::new(self.appcomponents.clone()),
            systemusers: Arc::new(self.systemusers.clone()),
            podtasks: Arc::new(self.podtasks.clone()),
            websites: Arc::new(self.websites.clone()),
            clusters: Arc::new(self.clusters.clone()),
            deployments: Arc::new(self.deployments.clone()),
            replicasets: Arc::new(self.replicasets.clone()),
            pods: Arc::new(self.pods.clone()),
            pvcs: Arc::new(self.pvcs.clone()),
            pvs: Arc::new(self.pvs.clone()),
            configmaps: Arc::new(self.configmaps.clone()),
            services: Arc::new(self.services.clone()),
        }
    }
}

/// One cache per kind, shared by all controllers.
#[derive(Clone)]
pub struct Informers {
    pub sitepods: Informer<Sitepod>,
    pub appcomponents: Informer<AppComponent>,
    pub systemusers: Informer<SystemUser>,
    pub podtasks: Informer<PodTask>,
    pub websites: Informer<Website>,
    pub clusters: Informer<Cluster>,
    pub deployments: Informer<Deployment>,
    pub pods: Informer<Pod>,
    pub pvcs: Informer<PersistentVolumeClaim>,
    pub pvs: Informer<PersistentVolume>,
    pub configmaps: Informer<ConfigMap>,
}

impl Informers {
    pub fn new(stores: &Stores, namespace: &str) -> Self {
        Self {
            sitepods: Informer::new(
                stores.sitepods.clone(),
                ResourceKind::namespaced().with_uid_index(),
                namespace,
            ),
            appcomponents: Informer::new(
                stores.appcomponents.clone(),
                ResourceKind::namespaced().with_sitepod_index(),
                namespace,
            ),
            systemusers: Informer::new(
                stores.systemusers.clone(),
                ResourceKind::namespaced().with_sitepod_index(),
                namespace,
            ),
            podtasks: Informer::new(
                stores.podtasks.clone(),
                ResourceKind::namespaced().with_sitepod_index(),
                namespace,
            ),
            websites: Informer::new(
                stores.websites.clone(),
                ResourceKind::namespaced().with_sitepod_index(),
                namespace,
            ),
            clusters: Informer::new(stores.clusters.clone(), ResourceKind::namespaced(), namespace),
            // Only provisioned objects carry the sitepod label.
            deployments: Informer::new(
                stores.deployments.clone(),
                ResourceKind::namespaced()
                    .with_sitepod_index()
                    .with_uid_index(),
                namespace,
            )
            .with_selector(crate::crds::labels::SITEPOD_LABEL),
            pods: Informer::new(
                stores.pods.clone(),
                ResourceKind::namespaced().with_sitepod_index(),
                namespace,
            )
            .with_selector(crate::crds::labels::SITEPOD_LABEL),
            pvcs: Informer::new(stores.pvcs.clone(), ResourceKind::namespaced(), namespace),
            pvs: Informer::new(stores.pvs.clone(), ResourceKind::cluster(), namespace),
            configmaps: Informer::new(
                stores.configmaps.clone(),
                ResourceKind::namespaced().with_sitepod_index(),
                namespace,
            ),
        }
    }

    fn all(&self) -> Vec<Arc<dyn Synced>> {
        vec![
            Arc::new(self.sitepods.clone()),
            Arc::new(self.appcomponents.clone()),
            Arc::new(self.systemusers.clone()),
            Arc::new(self.podtasks.clone()),
            Arc::new(self.websites.clone()),
            Arc::new(self.clusters.clone()),
            Arc::new(self.deployments.clone()),
            Arc::new(self.pods.clone()),
            Arc::new(self.pvcs.clone()),
            Arc::new(self.pvs.clone()),
            Arc::new(self.configmaps.clone()),
        ]
    }

    pub fn all_synced(&self) -> bool {
        self.all().iter().all(|i| i.has_synced())
    }

    /// Start one list/watch task per kind.
    pub fn spawn(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        fn start<K: crate::store::StoreObject>(
            informer: &Informer<K>,
            shutdown: &CancellationToken,
        ) -> JoinHandle<()> {
            let informer = informer.clone();
            let token = shutdown.clone();
            tokio::spawn(async move { informer.run(token).await })
        }
        vec![
            start(&self.sitepods, shutdown),
            start(&self.appcomponents, shutdown),
            start(&self.systemusers, shutdown),
            start(&self.podtasks, shutdown),
            start(&self.websites, shutdown),
            start(&self.clusters, shutdown),
            start(&self.deployments, shutdown),
            start(&self.pods, shutdown),
            start(&self.pvcs, shutdown),
            start(&self.pvs, shutdown),
            start(&self.configmaps, shutdown),
        ]
    }
}

/// Shared state handed to every reconciler.
pub struct Context {
    pub namespace: String,
    pub config: Arc<ControllerConfig>,
    pub stores: Stores,
    pub informers: Informers,
    pub executor: Arc<dyn PodExecutor>,
    pub conditions: ConditionRegistry,
}

impl Context {
    pub fn new(
        namespace: &str,
        config: Arc<ControllerConfig>,
        stores: Stores,
        executor: Arc<dyn PodExecutor>,
    ) -> Self {
        let informers = Informers::new(&stores, namespace);
        let conditions = ConditionRegistry::standard(&stores);
        Self {
            namespace: namespace.to_string(),
            config,
            stores,
            informers,
            executor,
            conditions,
        }
    }

    /// Live Sitepod with this uid, if any.
    pub fn sitepod_by_uid(&self, uid: &str) -> Option<Arc<Sitepod>> {
        self.informers
            .sitepods
            .by_index(crate::store::UID_INDEX, uid)
            .into_iter()
            .next()
    }

    fn controller(
        &self,
        name: &str,
        reconciler: Arc<dyn Reconciler>,
        queue: WorkQueue<Request>,
    ) -> Controller {
        Controller::new(name, reconciler, queue)
            .with_retry_delay(self.config.retry_delay())
            .with_sync_poll_interval(self.config.sync_poll_interval())
            .with_workers(self.config.controller.workers)
    }
}

/// Make sure the Cluster singleton exists before anything allocates from it.
#[instrument(skip(stores))]
pub async fn ensure_cluster(stores: &Stores) -> Result<()> {
    match stores.clusters.get(CLUSTER_NAME).await {
        Ok(_) => Ok(()),
        Err(StoreError::NotFound(_)) => {
            info!("Creating cluster singleton {}", CLUSTER_NAME);
            let cluster = Cluster::new(CLUSTER_NAME, ClusterSpec::default());
            match stores.clusters.create(&cluster).await {
                Ok(_) | Err(StoreError::AlreadyExists(_)) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Every controller with its event handlers registered, ready to run.
pub struct ControllerSet {
    /// The Sitepod queue, which the orphan collector feeds deletes into.
    pub sitepod_queue: WorkQueue<Request>,
    pub controllers: Vec<Controller>,
}

pub fn build_controllers(ctx: &Arc<Context>) -> ControllerSet {
    let sitepod = sitepod::controller(ctx);
    let sitepod_queue = sitepod.queue().clone();
    ControllerSet {
        sitepod_queue,
        controllers: vec![
            sitepod,
            appcomp::controller(ctx),
            etc::controller(ctx),
            systemuser::controller(ctx),
            podtask::controller(ctx),
            website::controller(ctx),
        ],
    }
}

/// Run informers, controllers and the orphan collector until `shutdown` fires.
#[instrument(skip_all, fields(namespace = %ctx.namespace))]
pub async fn run_controllers(ctx: Arc<Context>, shutdown: CancellationToken) -> Result<()> {
    info!("Starting sitepod controllers in namespace: {}", ctx.namespace);
    ensure_cluster(&ctx.stores).await?;

    let ControllerSet {
        sitepod_queue,
        controllers,
    } = build_controllers(&ctx);
    let informer_tasks = ctx.informers.spawn(&shutdown);

    let mut tasks: Vec<JoinHandle<()>> = controllers
        .into_iter()
        .map(|c| {
            let token = shutdown.clone();
            tokio::spawn(c.run(token))
        })
        .collect();

    tasks.push(tokio::spawn({
        let ctx = ctx.clone();
        let token = shutdown.clone();
        async move {
            orphans::run_once(&ctx, &sitepod_queue, &token).await;
        }
    }));

    for task in tasks.into_iter().chain(informer_tasks) {
        if let Err(e) = task.await {
            error!("Controller task failed: {}", e);
        }
    }
    info!("All controllers stopped");
    Ok(())
}

/// Container name of the per-Sitepod manager.
pub const MANAGER_CONTAINER: &str = "sitepod-manager";
/// Volume name of the Sitepod's home claim.
pub const HOME_VOLUME: &str = "home-storage";
