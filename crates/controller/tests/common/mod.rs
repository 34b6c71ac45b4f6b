//! Shared fixtures: in-memory stores, a recording executor and a running
//! controller manager.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeSpec, Pod, PodCondition, PodStatus,
};
use kube::api::ObjectMeta;
use parking_lot::Mutex;
use sitepod_controller::controllers::{run_controllers, Context, MemoryStores};
use sitepod_controller::crds::labels::SITEPOD_LABEL;
use sitepod_controller::crds::{Sitepod, SitepodSpec};
use sitepod_controller::exec::{ExecError, ExecOutput, PodExecutor};
use sitepod_controller::store::ObjectStore;
use sitepod_controller::ControllerConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const NAMESPACE: &str = "sitepod";

/// One command the executor was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
}

/// Records every exec and fails the first `failures` of them.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<ExecCall>>,
    failures: AtomicUsize,
}

impl RecordingExecutor {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(failures),
        }
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PodExecutor for RecordingExecutor {
    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, ExecError> {
        self.calls.lock().push(ExecCall {
            pod: pod.to_string(),
            container: container.to_string(),
            command,
        });
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ExecError::Failed {
                code: 1,
                stdout: String::new(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(ExecOutput::default())
    }
}

/// Short delays so convergence takes milliseconds.
pub fn fast_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.controller.retry_delay_ms = 20;
    config.controller.sync_poll_interval_ms = 10;
    config.pod_task.retry_delay_secs = 1;
    config.orphans.grace_secs = 0;
    config
}

pub struct Harness {
    pub mem: MemoryStores,
    pub ctx: Arc<Context>,
    pub executor: Arc<RecordingExecutor>,
    token: CancellationToken,
    handle: JoinHandle<sitepod_controller::Result<()>>,
}

impl Harness {
    pub fn start(mem: MemoryStores, executor: RecordingExecutor) -> Self {
        let executor = Arc::new(executor);
        let ctx = Arc::new(Context::new(
            NAMESPACE,
            Arc::new(fast_config()),
            mem.stores(),
            executor.clone(),
        ));
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_controllers(ctx.clone(), token.clone()));
        Self {
            mem,
            ctx,
            executor,
            token,
            handle,
        }
    }

    pub async fn stop(self) {
        self.token.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

pub async fn eventually(what: &str, f: impl Fn() -> bool) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Sitepod `name` whose home claim is already bound.
pub async fn create_sitepod(mem: &MemoryStores, name: &str) -> Sitepod {
    let claim = format!("{name}-home");
    let volume = format!("{name}-pv");
    mem.pvcs
        .create(&PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(claim.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: Some(volume.clone()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    mem.pvs
        .create(&PersistentVolume {
            metadata: ObjectMeta {
                name: Some(volume),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                claim_ref: Some(ObjectReference {
                    name: Some(claim.clone()),
                    namespace: Some(NAMESPACE.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    mem.sitepods
        .create(&Sitepod::new(
            name,
            SitepodSpec {
                display_name: name.to_string(),
                description: String::new(),
                volume_claims: vec![claim],
            },
        ))
        .await
        .unwrap()
}

/// Stand in for the kubelet: a Ready pod for the Sitepod's Deployment.
pub async fn create_ready_pod(mem: &MemoryStores, sitepod_uid: &str, name: &str) -> Pod {
    mem.pods
        .create(&Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    SITEPOD_LABEL.to_string(),
                    sitepod_uid.to_string(),
                )])),
                ..Default::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: "True".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
        .await
        .unwrap()
}

pub fn labeled(sitepod_uid: &str) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from([(
        SITEPOD_LABEL.to_string(),
        sitepod_uid.to_string(),
    )]))
}
