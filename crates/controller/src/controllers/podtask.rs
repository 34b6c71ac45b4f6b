//! PodTask execution and behalf-of condition signaling.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{Context, Stores, MANAGER_CONTAINER};
use crate::cache::HandlerFns;
use crate::crds::{HasCondition, PodTask, Sitepod, SystemUser, Website};
use crate::error::{Error, Result};
use crate::exec::ExecError;
use crate::queue::WorkQueue;
use crate::runtime::{Controller, Reconciler, Request};
use crate::store::{key_name, object_key, ObjectStore, StoreObject};

/// Something that can have a named condition set on one of its objects.
#[async_trait]
pub trait ConditionTarget: Send + Sync {
    async fn set_condition(&self, name: &str, condition: &str) -> Result<()>;
}

/// Fetches the object from its store, sets the condition and writes the status back.
pub struct StoreConditionTarget<K: StoreObject> {
    store: Arc<dyn ObjectStore<K>>,
}

impl<K: StoreObject> StoreConditionTarget<K> {
    pub fn new(store: Arc<dyn ObjectStore<K>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<K: StoreObject + HasCondition> ConditionTarget for StoreConditionTarget<K> {
    async fn set_condition(&self, name: &str, condition: &str) -> Result<()> {
        let mut obj = match self.store.get(name).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                warn!(target_name = %name, condition = %condition, "Condition target is gone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if !obj.set_condition(condition, true) {
            return Err(Error::invalid(format!(
                "{name} has no condition {condition}"
            )));
        }
        self.store.update_status(&obj).await?;
        Ok(())
    }
}

/// Maps a `behalfType` kind name to the target that can signal it.
#[derive(Clone, Default)]
pub struct ConditionRegistry {
    targets: HashMap<String, Arc<dyn ConditionTarget>>,
}

impl ConditionRegistry {
    /// Every kind that exposes conditions.
    pub fn standard(stores: &Stores) -> Self {
        let mut registry = Self::default();
        registry.register::<Sitepod>(stores.sitepods.clone());
        registry.register::<SystemUser>(stores.systemusers.clone());
        registry.register::<Website>(stores.websites.clone());
        registry
    }

    pub fn register<K: StoreObject + HasCondition>(&mut self, store: Arc<dyn ObjectStore<K>>) {
        self.targets.insert(
            K::kind(&()).into_owned(),
            Arc::new(StoreConditionTarget::new(store)),
        );
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.targets.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub async fn signal(&self, kind: &str, name: &str, condition: &str) -> Result<()> {
        let target = self
            .targets
            .get(kind)
            .ok_or_else(|| Error::invalid(format!("unknown behalf type {kind}")))?;
        target.set_condition(name, condition).await
    }
}

pub struct PodTaskReconciler {
    ctx: Arc<Context>,
}

impl PodTaskReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for PodTaskReconciler {
    #[instrument(skip(self), fields(controller = "podtask"))]
    async fn sync(&self, key: &str) -> Result<()> {
        let store = &self.ctx.stores.podtasks;
        // Read through to the store: attempt counts must never go backwards.
        let mut task = match store.get(key_name(key)).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                debug!("PodTask is gone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if task.is_finished() {
            debug!("PodTask has nothing left to do");
            return Ok(());
        }

        let mut status = task.status_or_default();
        if !status.completed {
            let container = if task.spec.container_name.is_empty() {
                MANAGER_CONTAINER
            } else {
                &task.spec.container_name
            };
            let result = self
                .ctx
                .executor
                .exec(
                    &self.ctx.namespace,
                    &task.spec.pod_name,
                    container,
                    task.spec.command.clone(),
                )
                .await;
            status.attempts += 1;

            let failure = match result {
                Ok(output) => {
                    status.completed = true;
                    status.exit_code = 0;
                    status.std_out = output.stdout;
                    status.std_err = output.stderr;
                    None
                }
                Err(err) => {
                    status.exit_code = err.exit_code();
                    match &err {
                        ExecError::Failed { stdout, stderr, .. } => {
                            status.std_out.clone_from(stdout);
                            status.std_err.clone_from(stderr);
                        }
                        ExecError::Transport(message) => status.std_err.clone_from(message),
                    }
                    Some(err)
                }
            };

            task.status = Some(status.clone());
            task = store.update_status(&task).await?;

            if let Some(err) = failure {
                if status.attempts < task.spec.max_attempts {
                    return Err(Error::ExecFailed {
                        message: err.to_string(),
                        retry_after: self.ctx.config.pod_task_retry_delay(),
                    });
                }
                warn!(
                    attempts = status.attempts,
                    exit_code = status.exit_code,
                    "PodTask out of attempts"
                );
                return Ok(());
            }
            info!(attempts = status.attempts, "PodTask completed");
        }

        if task.has_behalf() && !status.behalf_signaled {
            let signaled = self
                .ctx
                .conditions
                .signal(
                    &task.spec.behalf_type,
                    &task.spec.behalf_of,
                    &task.spec.behalf_condition,
                )
                .await;
            // The command already ran; only the signal is outstanding, so any
            // failure other than a bad target is retried.
            match signaled {
                Ok(()) => {}
                Err(e @ Error::DependentConfigNotValid(_)) => return Err(e),
                Err(e) => {
                    return Err(Error::waiting(format!(
                        "signaling {} {}: {e}",
                        task.spec.behalf_type, task.spec.behalf_of
                    )))
                }
            }
            status.behalf_signaled = true;
            task.status = Some(status);
            store.update_status(&task).await?;
            info!(
                behalf_type = %task.spec.behalf_type,
                behalf_of = %task.spec.behalf_of,
                condition = %task.spec.behalf_condition,
                "Signaled behalf-of condition"
            );
        }
        Ok(())
    }
}

pub fn controller(ctx: &Arc<Context>) -> Controller {
    let queue = WorkQueue::new();
    let informer = &ctx.informers.podtasks;

    let on_add = queue.clone();
    let on_update = queue.clone();
    informer.add_event_handler(Arc::new(HandlerFns::<PodTask> {
        on_add: Some(Box::new(move |t| on_add.add(Request::Sync(object_key(t.as_ref()))))),
        // Status writes come back as updates; only spec changes need a new run.
        on_update: Some(Box::new(move |old, new| {
            if old.spec != new.spec {
                on_update.add(Request::Sync(object_key(new.as_ref())));
            }
        })),
        on_delete: None,
    }));

    ctx.controller("podtask", Arc::new(PodTaskReconciler::new(ctx.clone())), queue)
        .with_dependency(Arc::new(informer.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::testing;
    use crate::crds::{PodTaskSpec, SitepodSpec, STORAGE_READY_CONDITION};
    use crate::error::Disposition;
    use crate::exec::{ExecOutput, MockPodExecutor};
    use crate::store::memory::Op;
    use crate::store::StoreError;

    fn task(behalf_type: &str, behalf_of: &str, max_attempts: u32) -> PodTask {
        PodTask::new(
            "task-1",
            PodTaskSpec {
                pod_name: "site-pod".into(),
                container_name: String::new(),
                command: vec!["mkdir".into(), "-p".into(), "/sitepod/home".into()],
                max_attempts,
                behalf_type: behalf_type.into(),
                behalf_of: behalf_of.into(),
                behalf_condition: STORAGE_READY_CONDITION.into(),
            },
        )
    }

    #[tokio::test]
    async fn test_success_signals_behalf_resource() {
        let mem = testing::stores();
        mem.sitepods
            .create(&Sitepod::new("site", SitepodSpec::default()))
            .await
            .unwrap();
        mem.podtasks.create(&task("Sitepod", "site", 3)).await.unwrap();

        let mut exec = MockPodExecutor::new();
        exec.expect_exec()
            .withf(|ns, pod, container, _| {
                ns == testing::NAMESPACE && pod == "site-pod" && container == MANAGER_CONTAINER
            })
            .times(1)
            .returning(|_, _, _, _| {
                Ok(ExecOutput {
                    stdout: "ok".into(),
                    stderr: String::new(),
                })
            });
        let ctx = testing::context(&mem, Arc::new(exec));
        let r = PodTaskReconciler::new(ctx);

        r.sync("task-1").await.unwrap();
        let stored = mem.podtasks.get("task-1").await.unwrap();
        let status = stored.status.unwrap();
        assert!(status.completed);
        assert!(status.behalf_signaled);
        assert_eq!(status.attempts, 1);
        assert_eq!(status.std_out, "ok");
        assert!(mem.sitepods.get("site").await.unwrap().storage_setup());

        // Finished: a second pass execs nothing.
        r.sync("task-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_signal_is_retried_without_rerunning_command() {
        let mem = testing::stores();
        mem.sitepods
            .create(&Sitepod::new("site", SitepodSpec::default()))
            .await
            .unwrap();
        mem.podtasks.create(&task("Sitepod", "site", 3)).await.unwrap();
        mem.sitepods
            .fail_next(Op::UpdateStatus, StoreError::Kube("500 internal".into()));

        let mut exec = MockPodExecutor::new();
        exec.expect_exec()
            .times(1)
            .returning(|_, _, _, _| Ok(ExecOutput::default()));
        let r = PodTaskReconciler::new(testing::context(&mem, Arc::new(exec)));

        let err = r.sync("task-1").await.unwrap_err();
        assert!(matches!(err, Error::ConditionsNotReady(_)));
        assert!(matches!(err.disposition(), Disposition::Requeue(_)));
        let status = mem.podtasks.get("task-1").await.unwrap().status.unwrap();
        assert!(status.completed);
        assert!(!status.behalf_signaled);
        assert!(!mem.sitepods.get("site").await.unwrap().storage_setup());

        r.sync("task-1").await.unwrap();
        let status = mem.podtasks.get("task-1").await.unwrap().status.unwrap();
        assert!(status.behalf_signaled);
        assert_eq!(status.attempts, 1);
        assert!(mem.sitepods.get("site").await.unwrap().storage_setup());
    }

    #[tokio::test]
    async fn test_failures_requeue_until_attempts_run_out() {
        let mem = testing::stores();
        mem.podtasks.create(&task("", "", 2)).await.unwrap();

        let mut exec = MockPodExecutor::new();
        exec.expect_exec().times(2).returning(|_, _, _, _| {
            Err(ExecError::Failed {
                code: 1,
                stdout: String::new(),
                stderr: "permission denied".into(),
            })
        });
        let ctx = testing::context(&mem, Arc::new(exec));
        let retry = ctx.config.pod_task_retry_delay();
        let r = PodTaskReconciler::new(ctx);

        match r.sync("task-1").await {
            Err(Error::ExecFailed { retry_after, .. }) => assert_eq!(retry_after, retry),
            other => panic!("expected ExecFailed, got {other:?}"),
        }
        // Last attempt fails terminally without asking for a retry.
        r.sync("task-1").await.unwrap();
        // Out of attempts: skipped.
        r.sync("task-1").await.unwrap();

        let status = mem.podtasks.get("task-1").await.unwrap().status.unwrap();
        assert_eq!(status.attempts, 2);
        assert_eq!(status.exit_code, 1);
        assert_eq!(status.std_err, "permission denied");
        assert!(!status.completed);
    }

    #[tokio::test]
    async fn test_unknown_behalf_kind_is_not_valid() {
        let mem = testing::stores();
        mem.podtasks.create(&task("Gadget", "g", 3)).await.unwrap();

        let mut exec = MockPodExecutor::new();
        exec.expect_exec()
            .times(1)
            .returning(|_, _, _, _| Ok(ExecOutput::default()));
        let r = PodTaskReconciler::new(testing::context(&mem, Arc::new(exec)));

        let err = r.sync("task-1").await.unwrap_err();
        assert!(matches!(err, Error::DependentConfigNotValid(_)));
        let status = mem.podtasks.get("task-1").await.unwrap().status.unwrap();
        assert!(status.completed);
        assert!(!status.behalf_signaled);
    }

    #[test]
    fn test_standard_registry_kinds() {
        let mem = testing::stores();
        let registry = ConditionRegistry::standard(&mem.stores());
        assert_eq!(registry.kinds(), vec!["Sitepod", "SystemUser", "Website"]);
    }
}
