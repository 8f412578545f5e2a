//! Tenant watch stream → reconcile events
//!
//! The watcher feeds a reflector store that backs [`TenantLister`]. Every
//! event is applied to the store *before* its key is queued, so a worker
//! always reads at least the state that triggered it.
//!
//! A relist (initial list, or after the watch lost its place) is buffered
//! until it completes. Tenants that existed before the relist and are absent
//! from it were deleted while the watch was down and produce a
//! [`ReconcileEvent::Deleted`].
//!
//! [`TenantLister`]: super::TenantLister

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Api;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::crd::{Tenant, TenantKey};
use crate::queue::ReconcileQueue;

/// Server-side watch timeout; must stay below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 290;

/// A change to a tenant that warrants a reconcile
#[derive(Clone, Debug)]
pub enum ReconcileEvent {
    /// First sighting of the tenant
    Added(Arc<Tenant>),
    /// A new version of a known tenant
    Updated {
        /// Cached version before the change
        old: Arc<Tenant>,
        /// Version after the change
        new: Arc<Tenant>,
    },
    /// Tenant is gone (last known state)
    Deleted(Arc<Tenant>),
}

impl ReconcileEvent {
    /// Queue key for the tenant this event is about
    pub fn key(&self) -> TenantKey {
        match self {
            ReconcileEvent::Added(t) | ReconcileEvent::Deleted(t) => TenantKey::of(t),
            ReconcileEvent::Updated { new, .. } => TenantKey::of(new),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ReconcileEvent::Added(_) => "added",
            ReconcileEvent::Updated { .. } => "updated",
            ReconcileEvent::Deleted(_) => "deleted",
        }
    }
}

/// Applies watcher events to the tenant cache and reports what changed.
pub struct EventTranslator {
    writer: reflector::store::Writer<Tenant>,
    reader: Store<Tenant>,
    relist: Option<Relist>,
}

#[derive(Default)]
struct Relist {
    seen: HashSet<TenantKey>,
    pending: Vec<ReconcileEvent>,
}

impl EventTranslator {
    /// New translator and the cache it maintains
    pub fn new() -> (Self, Store<Tenant>) {
        let (reader, writer) = reflector::store();
        let translator = Self {
            writer,
            reader: reader.clone(),
            relist: None,
        };
        (translator, reader)
    }

    /// Apply `event` to the cache and return the reconcile events it causes.
    pub fn translate(&mut self, event: Event<Tenant>) -> Vec<ReconcileEvent> {
        let out = match &event {
            Event::Init => {
                trace!("tenant relist started");
                self.relist = Some(Relist::default());
                Vec::new()
            }
            Event::InitApply(tenant) => {
                let change = self.classify_apply(tenant);
                let relist = self.relist.get_or_insert_with(Relist::default);
                relist.seen.insert(TenantKey::of(tenant));
                relist.pending.extend(change);
                Vec::new()
            }
            Event::InitDone => {
                let Relist { seen, mut pending } = self.relist.take().unwrap_or_default();
                for stale in self.reader.state() {
                    if !seen.contains(&TenantKey::of(&stale)) {
                        pending.push(ReconcileEvent::Deleted(stale));
                    }
                }
                debug!(
                    tenants = seen.len(),
                    changes = pending.len(),
                    "tenant relist complete"
                );
                pending
            }
            Event::Apply(tenant) => self.classify_apply(tenant).into_iter().collect(),
            Event::Delete(tenant) => vec![ReconcileEvent::Deleted(Arc::new(tenant.clone()))],
        };

        self.writer.apply_watcher_event(&event);
        out
    }

    /// `None` when the cached copy is already at this resource version
    fn classify_apply(&self, tenant: &Tenant) -> Option<ReconcileEvent> {
        let new = Arc::new(tenant.clone());
        match self.reader.get(&ObjectRef::from_obj(tenant)) {
            None => Some(ReconcileEvent::Added(new)),
            Some(old)
                if old.metadata.resource_version.is_some()
                    && old.metadata.resource_version == tenant.metadata.resource_version =>
            {
                None
            }
            Some(old) => Some(ReconcileEvent::Updated { old, new }),
        }
    }
}

/// Watch Tenant objects until `shutdown` fires, queueing every change.
///
/// Watch errors are logged and the stream backs off and resumes on its own.
pub async fn watch_tenants(
    api: Api<Tenant>,
    mut translator: EventTranslator,
    queue: ReconcileQueue<TenantKey>,
    shutdown: CancellationToken,
) {
    let stream = watcher::watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
        .default_backoff();
    tokio::pin!(stream);

    info!("watching tenants");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    for change in translator.translate(event) {
                        let key = change.key();
                        debug!(tenant = %key, event = change.kind(), "tenant changed");
                        queue.add(key);
                    }
                }
                Some(Err(e)) => warn!(error = %e, "tenant watch failed, retrying"),
                None => break,
            }
        }
    }
    info!("tenant watch stopped");
}
