//! Registry multiplexes per-kind reconcilers onto the shared runtime.
//!
//! Each registration runs a dynamic-typed controller task watching
//! instances of one synthesized kind (and the member kinds it owns).
//! Registrations can be hot-swapped with a recompiled graph and are torn
//! down cooperatively.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use kube::{
    api::{Api, DynamicObject},
    core::ApiResource,
    runtime::{controller::Controller, watcher},
};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ControllerConfig;
use crate::instances::{self, InstanceContext};
use crate::{metrics, Context, Error, Result};
use graph::builder::gvk_key;
use graph::Graph;

struct Registration {
    ictx: Arc<InstanceContext>,
    member_kinds: Vec<String>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// DynamicRegistry owns the per-kind reconciler registrations.
pub struct DynamicRegistry {
    client: kube::Client,
    config: ControllerConfig,
    // Pool context; cancelling it stops every registration.
    token: CancellationToken,
    entries: RwLock<HashMap<String, Registration>>,
}

impl DynamicRegistry {
    /// New builds an empty registry bound to the pool context.
    pub fn new(client: kube::Client, config: ControllerConfig, token: CancellationToken) -> Self {
        Self {
            client,
            config,
            token,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Is_registered reports whether a reconciler runs for the graph's
    /// kind.
    pub fn is_registered(&self, key: &str) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .contains_key(key)
    }

    /// Graph_for snapshots the graph a registration currently executes.
    pub fn graph_for(&self, key: &str) -> Option<Arc<Graph>> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(key)
            .map(|r| r.ictx.graph())
    }

    /// Register starts (or hot-swaps) the reconciler for the graph's kind.
    ///
    /// A swap is atomic: the next reconcile of any instance sees either the
    /// old graph or the new one, never a mix. The watch set is rebuilt when
    /// the member kinds changed.
    #[instrument(skip_all, fields(gvk = gvk_key(&graph.gvk)))]
    pub async fn register(&self, ctx: Arc<Context>, graph: Arc<Graph>) -> Result<()> {
        let key = gvk_key(&graph.gvk);
        let member_kinds: Vec<String> = graph.member_kinds().iter().map(gvk_key).collect();

        {
            let entries = self.entries.read().expect("registry lock poisoned");
            if let Some(existing) = entries.get(&key) {
                if existing.member_kinds == member_kinds {
                    debug!("hot-swapping graph");
                    existing.ictx.swap_graph(graph);
                    return Ok(());
                }
            }
        }
        // Member kinds changed (or no registration yet): rebuild the task.
        self.unregister(&key).await?;

        let ictx = Arc::new(InstanceContext::new(ctx, graph.clone()));
        let cancel = self.token.child_token();
        let handle = tokio::spawn(watch_task(
            self.client.clone(),
            self.config.clone(),
            ictx.clone(),
            graph,
            cancel.clone(),
        ));
        metrics::registrations().increment(1);
        info!("registered reconciler");

        self.entries.write().expect("registry lock poisoned").insert(
            key,
            Registration {
                ictx,
                member_kinds,
                cancel,
                handle,
            },
        );
        Ok(())
    }

    /// Unregister stops the reconciler for `key` and drains it, bounded by
    /// the configured shutdown timeout.
    #[instrument(skip(self))]
    pub async fn unregister(&self, key: &str) -> Result<()> {
        let removed = self
            .entries
            .write()
            .expect("registry lock poisoned")
            .remove(key);
        let Some(registration) = removed else {
            return Ok(());
        };
        registration.cancel.cancel();
        match tokio::time::timeout(self.config.shutdown_timeout, registration.handle).await {
            Ok(joined) => joined?,
            Err(_) => {
                warn!(key, "reconciler did not drain in time, abandoning");
            }
        }
        info!(key, "unregistered reconciler");
        Ok(())
    }

    /// Shutdown unregisters everything; used on process exit.
    pub async fn shutdown(&self) -> Result<()> {
        let keys: Vec<String> = self
            .entries
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        for key in keys {
            self.unregister(&key).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DynamicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("registry")
    }
}

// The long-running watch for one synthesized kind. Ends when the
// registration (or the pool) is cancelled.
async fn watch_task(
    client: kube::Client,
    config: ControllerConfig,
    ictx: Arc<InstanceContext>,
    graph: Arc<Graph>,
    cancel: CancellationToken,
) {
    let wc = watcher::Config::default();
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &ictx.api_resource);

    let resync = IntervalStream::new(tokio::time::interval(config.resync_period)).map(|_| ());
    let mut ctl = Controller::new_with(api, wc.clone(), ictx.api_resource.clone())
        .with_config(
            kube::runtime::controller::Config::default().concurrency(config.workers as u16),
        )
        .reconcile_all_on(resync)
        .graceful_shutdown_on(cancel.cancelled_owned());

    // Watch member kinds so status changes wake their dependents.
    let mut seen = std::collections::HashSet::new();
    for member in graph.resource_order() {
        if !seen.insert(gvk_key(&member.gvk)) {
            continue;
        }
        let ar: ApiResource = crate::objects::api_resource_for(member);
        let owned: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
        ctl = ctl.owns_with(owned, ar, wc.clone());
    }

    ctl.run(instances::reconcile, instances::error_policy, ictx)
        .for_each(|ret| {
            if let Err(err) = ret {
                error!(error = %err, "instance controller error");
            }
            futures::future::ready(())
        })
        .await;
    debug!("instance controller finished");
}
