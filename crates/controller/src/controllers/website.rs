//! Website setup checklist, advanced one step per reconcile.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use handlebars::Handlebars;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, instrument};

use super::resources::{ensure_pod_task, ready_pod, upsert, TaskState};
use super::Context;
use crate::cache::HandlerFns;
use crate::crds::labels::{CONFIGTYPE_LABEL, CONFIGTYPE_WEBSERVER_SITES, SITEPOD_LABEL};
use crate::crds::{Defaultable, HasCondition, Sitepod, Website, WebsiteStep};
use crate::error::{Error, Result};
use crate::queue::WorkQueue;
use crate::runtime::{Controller, Reconciler, Request};
use crate::store::object_key;

const NGINX_SITE_TEMPLATE: &str = r"server {
    listen 80;
    server_name {{server_names}};
    root {{root}};
    index index.php index.html index.htm;

    access_log /var/log/nginx/{{domain}}.access.log;
    error_log /var/log/nginx/{{domain}}.error.log;

    location / {
        try_files $uri $uri/ =404;
    }

    location ~ \.php$ {
        include fastcgi_params;
        fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;
        fastcgi_pass 127.0.0.1:9090;
    }
}
";

/// Document root as seen from web server containers, which mount the home
/// subPath at `/home`.
pub fn document_root(domain: &str) -> String {
    format!("/home/websites/{domain}")
}

pub fn sites_config_map_name(sitepod: &Sitepod) -> String {
    format!("{}-{CONFIGTYPE_WEBSERVER_SITES}", sitepod.name_any())
}

/// Nginx server block for one website.
pub fn render_server_block(website: &Website) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
        .register_template_string("site", NGINX_SITE_TEMPLATE)
        .map_err(|e| Error::Config(format!("nginx site template: {e}")))?;
    let domain = website.primary_domain();
    handlebars
        .render(
            "site",
            &json!({
                "domain": domain,
                "server_names": website.server_names().join(" "),
                "root": document_root(&domain),
            }),
        )
        .map_err(|e| Error::Config(format!("nginx site render: {e}")))
}

/// Add or replace one site entry, leaving the other websites' entries alone.
fn merge_site_entry(current: &ConfigMap, desired: &ConfigMap) -> ConfigMap {
    let mut merged = current.clone();
    merged
        .labels_mut()
        .extend(desired.labels().iter().map(|(k, v)| (k.clone(), v.clone())));
    if let Some(entries) = &desired.data {
        merged
            .data
            .get_or_insert_with(BTreeMap::new)
            .extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

pub struct WebsiteReconciler {
    ctx: Arc<Context>,
}

impl WebsiteReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn create_directory(&self, website: &Website, sitepod_uid: &str) -> Result<bool> {
        let pod = ready_pod(&self.ctx, sitepod_uid)?;
        let name = website.name_any();
        let directory = format!(
            "{}/home/websites/{}",
            self.ctx.config.manager.mount_path,
            website.primary_domain()
        );
        let state = ensure_pod_task(
            &self.ctx,
            sitepod_uid,
            &format!("{name}-dir"),
            &pod,
            vec!["mkdir".to_string(), "-p".to_string(), directory],
            (
                "Website",
                &name,
                WebsiteStep::DirectoryCreated.condition(),
            ),
        )
        .await?;
        match state {
            TaskState::Created(_) | TaskState::Pending(_) => {
                Err(Error::waiting(format!("directory of website {name}")))
            }
            // The task's signal sets the condition.
            TaskState::Completed(_) => Ok(false),
            TaskState::Failed(task) => Err(Error::invalid(format!(
                "directory task {} for {name} failed",
                task.name_any()
            ))),
        }
    }

    async fn setup_server(&self, website: &Website, sitepod: &Sitepod, uid: &str) -> Result<bool> {
        let name = sites_config_map_name(sitepod);
        let entry = format!("{}.conf", website.uid().unwrap_or_else(|| website.name_any()));
        let desired = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(BTreeMap::from([
                    (SITEPOD_LABEL.to_string(), uid.to_string()),
                    (
                        CONFIGTYPE_LABEL.to_string(),
                        CONFIGTYPE_WEBSERVER_SITES.to_string(),
                    ),
                ])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(entry.clone(), render_server_block(website)?)])),
            ..Default::default()
        };
        let current = self.ctx.informers.configmaps.get(&name);
        if upsert(
            self.ctx.stores.configmaps.as_ref(),
            current.as_deref(),
            &desired,
            merge_site_entry,
        )
        .await?
        {
            info!(configmap = %name, entry = %entry, "Wrote nginx site");
        }
        Ok(true)
    }
}

#[async_trait]
impl Reconciler for WebsiteReconciler {
    #[instrument(skip(self), fields(controller = "website"))]
    async fn sync(&self, key: &str) -> Result<()> {
        let ctx = &self.ctx;
        let Some(cached) = ctx.informers.websites.get(key) else {
            debug!("Website no longer exists");
            return Ok(());
        };
        let uid = cached
            .labels()
            .get(SITEPOD_LABEL)
            .cloned()
            .ok_or_else(|| Error::invalid(format!("{} has no {SITEPOD_LABEL} label", cached.name_any())))?;
        let Some(sitepod) = ctx.sitepod_by_uid(&uid) else {
            info!(sitepod = %uid, "Sitepod no longer exists, skipping");
            return Ok(());
        };

        let mut website = (*cached).clone();
        website.apply_defaults();
        if website.spec != cached.spec {
            ctx.stores.websites.update(&website).await?;
            info!("Applied Website defaults");
            return Ok(());
        }

        let Some(step) = website.status_or_default().next_step() else {
            debug!("Website fully set up");
            return Ok(());
        };
        let done = match step {
            WebsiteStep::DirectoryCreated => self.create_directory(&website, &uid).await?,
            WebsiteStep::ServerSetup => self.setup_server(&website, &sitepod, &uid).await?,
            WebsiteStep::SkeletonSetup | WebsiteStep::LoadBalancerSetup => true,
        };
        if done {
            website.set_condition(step.condition(), true);
            ctx.stores.websites.update_status(&website).await?;
            info!(step = %step.condition(), domain = %website.primary_domain(), "Website step done");
        }
        Ok(())
    }
}

pub fn controller(ctx: &Arc<Context>) -> Controller {
    let queue = WorkQueue::new();
    let informers = &ctx.informers;

    let on_add = queue.clone();
    let on_update = queue.clone();
    informers
        .websites
        .add_event_handler(Arc::new(HandlerFns::<Website> {
            on_add: Some(Box::new(move |w| on_add.add(Request::Sync(object_key(w.as_ref()))))),
            // Each finished step comes back as an update and starts the next one.
            on_update: Some(Box::new(move |_, w| {
                on_update.add(Request::Sync(object_key(w.as_ref())));
            })),
            on_delete: None,
        }));

    ctx.controller("website", Arc::new(WebsiteReconciler::new(ctx.clone())), queue)
        .with_dependency(Arc::new(informers.websites.clone()))
        .with_dependency(Arc::new(informers.sitepods.clone()))
        .with_dependency(Arc::new(informers.pods.clone()))
        .with_dependency(Arc::new(informers.configmaps.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::testing;
    use crate::crds::{WebsiteSpec, WebsiteStatus};
    use crate::store::{ObjectStore, StoreObject};

    fn website(name: &str, sitepod_uid: &str, status: WebsiteStatus) -> Website {
        let mut w = Website::new(
            name,
            WebsiteSpec {
                primary_domain: name.to_string(),
                aliases: vec![format!("www.{name}")],
            },
        );
        w.metadata.labels = Some(BTreeMap::from([(
            SITEPOD_LABEL.to_string(),
            sitepod_uid.to_string(),
        )]));
        w.status = Some(status);
        w
    }

    async fn wait_for<K: StoreObject>(informer: &crate::cache::Informer<K>, obj: &K) {
        let key = object_key(obj);
        testing::eventually(|| {
            informer
                .get(&key)
                .is_some_and(|c| c.resource_version() == obj.resource_version())
        })
        .await;
    }

    #[test]
    fn test_server_block() {
        let w = website("example.com", "u1", WebsiteStatus::default());
        let block = render_server_block(&w).unwrap();
        assert!(block.contains("server_name example.com www.example.com;"));
        assert!(block.contains("root /home/websites/example.com;"));
        assert!(block.contains("try_files $uri $uri/ =404;"));
    }

    #[tokio::test]
    async fn test_directory_step_creates_task_in_manager() {
        let mem = testing::stores();
        let sp = testing::sitepod(&mem, "alpha", None).await;
        let uid = sp.uid().unwrap();
        testing::ready_pod(&mem, &uid, "alpha-pod").await;
        mem.websites
            .create(&website("example.com", &uid, WebsiteStatus::default()))
            .await
            .unwrap();
        let ctx = testing::context(&mem, testing::no_exec());
        let _token = testing::start(&ctx).await;
        let r = WebsiteReconciler::new(ctx);

        let err = r.sync("example.com").await.unwrap_err();
        assert!(matches!(err, Error::ConditionsNotReady(_)));
        let tasks = mem.podtasks.objects();
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            tasks[0].spec.command,
            vec!["mkdir", "-p", "/sitepod/home/websites/example.com"]
        );
        assert_eq!(tasks[0].spec.behalf_type, "Website");
        assert_eq!(tasks[0].spec.behalf_condition, "DirectoryCreated");
        assert!(!mem
            .websites
            .get("example.com")
            .await
            .unwrap()
            .status_or_default()
            .directory_created);
    }

    #[tokio::test]
    async fn test_advances_one_step_per_pass() {
        let mem = testing::stores();
        let sp = testing::sitepod(&mem, "alpha", None).await;
        let uid = sp.uid().unwrap();
        let status = WebsiteStatus {
            directory_created: true,
            ..Default::default()
        };
        mem.websites
            .create(&website("example.com", &uid, status))
            .await
            .unwrap();
        let ctx = testing::context(&mem, testing::no_exec());
        let _token = testing::start(&ctx).await;
        let r = WebsiteReconciler::new(ctx.clone());

        let mut seen = Vec::new();
        for _ in 0..4 {
            r.sync("example.com").await.unwrap();
            let stored = mem.websites.get("example.com").await.unwrap();
            seen.push(stored.status_or_default());
            wait_for(&ctx.informers.websites, &stored).await;
        }
        assert!(seen[0].skeleton_setup && !seen[0].server_setup);
        assert!(seen[1].server_setup && !seen[1].load_balancer_setup);
        assert!(seen[2].load_balancer_setup);
        assert_eq!(seen[2], seen[3]);

        let site = mem.websites.get("example.com").await.unwrap();
        let cm = mem.configmaps.get("alpha-webserver-sites").await.unwrap();
        assert_eq!(cm.labels()[SITEPOD_LABEL], uid);
        assert_eq!(cm.labels()[CONFIGTYPE_LABEL], CONFIGTYPE_WEBSERVER_SITES);
        let entry = format!("{}.conf", site.uid().unwrap());
        assert!(cm.data.unwrap()[&entry].contains("root /home/websites/example.com;"));
    }

    #[tokio::test]
    async fn test_second_site_keeps_first_entry() {
        let mem = testing::stores();
        let sp = testing::sitepod(&mem, "alpha", None).await;
        let uid = sp.uid().unwrap();
        let status = WebsiteStatus {
            directory_created: true,
            skeleton_setup: true,
            ..Default::default()
        };
        mem.websites
            .create(&website("one.test", &uid, status.clone()))
            .await
            .unwrap();
        mem.websites
            .create(&website("two.test", &uid, status))
            .await
            .unwrap();
        let ctx = testing::context(&mem, testing::no_exec());
        let _token = testing::start(&ctx).await;
        let r = WebsiteReconciler::new(ctx.clone());

        r.sync("one.test").await.unwrap();
        let cm = mem.configmaps.get("alpha-webserver-sites").await.unwrap();
        wait_for(&ctx.informers.configmaps, &cm).await;
        r.sync("two.test").await.unwrap();

        let cm = mem.configmaps.get("alpha-webserver-sites").await.unwrap();
        assert_eq!(cm.data.unwrap().len(), 2);
    }
}
