//! Worker pool driving [`reconcile`] from the queue

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::tenant::{reconcile, Context, ReconcileOutcome};
use crate::config::ControllerConfig;
use crate::crd::TenantKey;
use crate::queue::{QueueItem, ReconcileQueue};

/// Runs reconcile workers and the periodic resync.
pub struct TenantController {
    ctx: Arc<Context>,
    queue: ReconcileQueue<TenantKey>,
    workers: usize,
    resync_interval: Duration,
}

impl TenantController {
    /// Controller over `ctx`, with its own queue
    pub fn new(ctx: Arc<Context>, config: &ControllerConfig) -> Self {
        Self {
            ctx,
            queue: ReconcileQueue::new(config.backoff.clone()),
            workers: config.workers.max(1),
            resync_interval: config.resync_interval,
        }
    }

    /// Queue shared with the watch layer
    pub fn queue(&self) -> &ReconcileQueue<TenantKey> {
        &self.queue
    }

    /// Queue every cached tenant. Returns how many keys were offered.
    pub fn resync(&self) -> usize {
        let keys = self.ctx.tenants.keys();
        let count = keys.len();
        for key in keys {
            self.queue.add(key);
        }
        count
    }

    /// Run until `shutdown` fires.
    ///
    /// In-flight reconciles finish; queued keys are dropped and picked up
    /// again by the next start's resync.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(workers = self.workers, "starting tenant controller");

        let mut handles = Vec::with_capacity(self.workers + 1);
        for id in 0..self.workers {
            let ctx = self.ctx.clone();
            let queue = self.queue.clone();
            handles.push(tokio::spawn(
                worker(ctx, queue).instrument(tracing::info_span!("worker", id)),
            ));
        }

        let resync = {
            let ctx = self.ctx.clone();
            let queue = self.queue.clone();
            let interval = self.resync_interval;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            let keys = ctx.tenants.keys();
                            debug!(tenants = keys.len(), "periodic resync");
                            for key in keys {
                                queue.add(key);
                            }
                        }
                    }
                }
            })
        };
        handles.push(resync);

        shutdown.cancelled().await;
        info!("stopping tenant controller");
        self.queue.shut_down();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "controller task panicked");
            }
        }
        info!("tenant controller stopped");
    }
}

async fn worker(ctx: Arc<Context>, queue: ReconcileQueue<TenantKey>) {
    while let Some(item) = queue.get().await {
        process(&ctx, item).await;
    }
}

/// Reconcile one key and decide whether it comes back.
///
/// Retryable failures requeue with backoff. Anything else is logged and
/// dropped until the next event or resync for the tenant.
async fn process(ctx: &Context, item: QueueItem<TenantKey>) {
    let key = item.key().clone();
    match reconcile(&key, ctx).await {
        Ok(outcome) => {
            match outcome {
                ReconcileOutcome::Allocated(subnet) => {
                    debug!(tenant = %key, %subnet, "tenant converged")
                }
                ReconcileOutcome::Released(subnet) => {
                    debug!(tenant = %key, %subnet, "tenant withdrawn")
                }
                ReconcileOutcome::Skipped => debug!(tenant = %key, "nothing to do"),
            }
            item.finish();
        }
        Err(e) if e.is_retryable() => {
            let delay = item.retry();
            warn!(
                tenant = %key,
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "reconcile failed, requeueing"
            );
        }
        Err(e) => {
            error!(tenant = %key, error = %e, "reconcile failed permanently");
            item.finish();
        }
    }
}
