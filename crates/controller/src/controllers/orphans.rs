//! One-time sweep for Deployments left behind by Sitepods deleted while the
//! controller manager was down.

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::Context;
use crate::crds::labels::SITEPOD_LABEL;
use crate::queue::WorkQueue;
use crate::runtime::Request;

/// Wait for the Sitepod and Deployment caches, then schedule a delayed
/// `Delete` for every Deployment whose Sitepod no longer exists.
///
/// Returns the number of orphans scheduled.
#[instrument(skip_all)]
pub async fn run_once(
    ctx: &Context,
    queue: &WorkQueue<Request>,
    shutdown: &CancellationToken,
) -> usize {
    let informers = &ctx.informers;
    while !(informers.sitepods.has_synced() && informers.deployments.has_synced()) {
        tokio::select! {
            () = shutdown.cancelled() => return 0,
            () = tokio::time::sleep(ctx.config.sync_poll_interval()) => {}
        }
    }

    let grace = ctx.config.orphan_grace();
    let mut scheduled = 0;
    for deployment in informers.deployments.list() {
        let Some(uid) = deployment.labels().get(SITEPOD_LABEL) else {
            continue;
        };
        if ctx.sitepod_by_uid(uid).is_some() {
            continue;
        }
        info!(
            deployment = %deployment.name_any(),
            sitepod = %uid,
            grace_secs = grace.as_secs(),
            "Scheduling orphaned deployment for deletion"
        );
        queue.add_after(Request::Delete(uid.clone()), grace);
        scheduled += 1;
    }
    info!(scheduled, "Orphan sweep finished");
    scheduled
}
