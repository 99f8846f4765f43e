//! Rgds holds the controller for the "ResourceGraphDefinition" CRD.

use std::sync::{Arc, LazyLock};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch},
    core::{DynamicObject, GroupVersionKind},
    runtime::finalizer::{finalizer, Event as Finalizer},
    Resource, ResourceExt,
};
use tokio::time::Duration;
use tokio_stream::wrappers::IntervalStream;

use crate::{
    metrics, objects, prelude::*, RgdState, FINALIZER,
};
use api::v1alpha1::{ResourceGraphDefinition, ResourceGraphDefinitionStatus};
use graph::builder::{gvk_key, GraphBuilder, INSTANCE_ID};
use graph::Graph;

pub(crate) const RGD_CONTROLLER: &str = "resourcegraphdefinition";

static SELF_GVK: LazyLock<GroupVersionKind> = LazyLock::new(|| GroupVersionKind {
    group: ResourceGraphDefinition::group(&()).to_string(),
    version: ResourceGraphDefinition::version(&()).to_string(),
    kind: ResourceGraphDefinition::kind(&()).to_string(),
});

/// Controller is the ResourceGraphDefinition controller.
///
/// An error is returned if any setup fails.
#[instrument(skip_all)]
pub fn controller(cancel: CancellationToken, ctx: Arc<Context>) -> Result<ControllerFuture> {
    let client = ctx.client.clone();
    let ctlcfg = watcher::Config::default();
    let root: Api<ResourceGraphDefinition> = Api::all(client.clone());
    let resync =
        IntervalStream::new(tokio::time::interval(ctx.config.resync_period)).map(|_| ());

    Ok(async move {
        if let Err(e) = root.list(&ListParams::default().limit(1)).await {
            error!("CRD ({SELF_GVK:?}) is not queryable ({e:?}); is the CRD installed?");
            return Err(Error::BadName("no CRD".into()));
        }

        let ctl = Controller::new(root, ctlcfg.clone())
            .owns(
                Api::<CustomResourceDefinition>::all(client.clone()),
                ctlcfg.clone(),
            )
            .reconcile_all_on(resync)
            .graceful_shutdown_on(cancel.cancelled_owned());
        info!("starting resourcegraphdefinition controller");

        ctl.run(reconcile, error_policy, ctx)
            .for_each(|ret| {
                if let Err(err) = ret {
                    error!(error = %err, "reconcile error");
                }
                futures::future::ready(())
            })
            .await;
        debug!("resourcegraphdefinition controller finished");
        Ok(())
    }
    .boxed())
}

fn error_policy(obj: Arc<ResourceGraphDefinition>, err: &Error, _ctx: Arc<Context>) -> Action {
    metrics::failures(RGD_CONTROLLER).increment(1);
    error!(
        error = err.to_string(),
        obj.metadata.name, obj.metadata.uid, "reconcile error"
    );
    Action::requeue(Duration::from_secs(5))
}

#[instrument(skip(ctx, rgd), fields(
    kind = ResourceGraphDefinition::kind(&()).as_ref(),
    name = rgd.name_any(),
    generation = rgd.metadata.generation,
))]
async fn reconcile(rgd: Arc<ResourceGraphDefinition>, ctx: Arc<Context>) -> Result<Action> {
    metrics::reconciles(RGD_CONTROLLER).increment(1);
    let api: Api<ResourceGraphDefinition> = Api::all(ctx.client.clone());

    info!(r#"reconciling ResourceGraphDefinition "{}""#, rgd.name_any());
    finalizer(&api, FINALIZER, rgd, |event| async {
        match event {
            Finalizer::Apply(rgd) => reconcile_one(rgd, ctx.clone()).await,
            Finalizer::Cleanup(rgd) => cleanup_one(rgd, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

#[instrument(skip(ctx, rgd))]
async fn reconcile_one(rgd: Arc<ResourceGraphDefinition>, ctx: Arc<Context>) -> Result<Action> {
    let oref = rgd.object_ref(&());
    let req = Request::new(&ctx.client, oref);

    let compiled = GraphBuilder::new(ctx.schemas.clone()).build(&rgd).await;
    let graph = match compiled {
        Ok(graph) => Arc::new(graph),
        Err(err) => return compile_failed(&rgd, &ctx, req, err).await,
    };

    sync_crd(&rgd, &ctx, &req, &graph).await?;
    ctx.registry.register(ctx.clone(), graph.clone()).await?;

    let order: Vec<String> = graph
        .topological_order
        .iter()
        .filter(|id| id.as_str() != INSTANCE_ID)
        .cloned()
        .collect();
    let mut next = rgd.status.clone().unwrap_or_default();
    next.state = Some(RgdState::Active.to_string());
    next.topological_order = order;
    let conditions = next.conditions.get_or_insert_with(Vec::new);
    crate::set_condition(
        conditions,
        crate::new_condition(
            "GraphVerified",
            true,
            "GraphCompiled",
            "graph compiled and validated",
            rgd.metadata.generation,
            req.now(),
        ),
    );
    crate::set_condition(
        conditions,
        crate::new_condition(
            "ReconcilerReady",
            true,
            "Registered",
            &format!("watching {}", gvk_key(&graph.gvk)),
            rgd.metadata.generation,
            req.now(),
        ),
    );
    publish_status(&rgd, &ctx, next).await?;

    Ok(DEFAULT_REQUEUE.clone())
}

// A compile failure surfaces on the RGD but never destabilizes a running
// registration: instances keep reconciling against the last valid graph.
#[instrument(skip_all, fields(name = rgd.name_any()))]
async fn compile_failed(
    rgd: &ResourceGraphDefinition,
    ctx: &Context,
    req: Request,
    err: graph::Error,
) -> Result<Action> {
    let transient = matches!(err, graph::Error::SchemaResolution(_));
    warn!(error = err.to_string(), transient, "graph compilation failed");

    let mut next = rgd.status.clone().unwrap_or_default();
    next.state = Some(RgdState::Inactive.to_string());
    let conditions = next.conditions.get_or_insert_with(Vec::new);
    crate::set_condition(
        conditions,
        crate::new_condition(
            "GraphVerified",
            false,
            "GraphCompilationFailed",
            &err.to_string(),
            rgd.metadata.generation,
            req.now(),
        ),
    );
    publish_status(rgd, ctx, next).await?;

    req.publish(Event {
        type_: EventType::Warning,
        reason: "GraphCompilationFailed".into(),
        note: Some(err.to_string()),
        action: "Compile".into(),
        secondary: None,
    })
    .await?;

    if transient {
        // The schema source hiccuped; retry with backoff.
        return Err(Error::Graph(err));
    }
    Ok(Action::await_change())
}

// Sync_crd creates or server-side-applies the synthesized CRD, owned by
// the RGD so external edits trigger self-repair.
#[instrument(skip_all, fields(name = rgd.name_any()))]
async fn sync_crd(
    rgd: &ResourceGraphDefinition,
    ctx: &Context,
    req: &Request,
    graph: &Graph,
) -> Result<()> {
    let mut crd = graph.crd.clone();
    let oref = rgd
        .controller_owner_ref(&())
        .ok_or(Error::MissingName("owner reference"))?;
    crd.metadata.owner_references = Some(vec![oref]);
    crd.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(
            crate::MANAGED_BY_LABEL.clone(),
            crate::CONTROLLER_NAME.to_string(),
        );

    let name = crd.metadata.name.clone().ok_or(Error::MissingName("crd"))?;
    let crds: Api<CustomResourceDefinition> = Api::all(ctx.client.clone());
    match crds.get_opt(&name).await? {
        None => {
            debug!(name, "creating CRD");
            crds.create(&CREATE_PARAMS, &crd).await?;
            req.publish(Event {
                type_: EventType::Normal,
                reason: "CRDCreated".into(),
                note: Some(format!("created CustomResourceDefinition {name:?}")),
                action: "SyncCRD".into(),
                secondary: None,
            })
            .await?;
        }
        Some(live) => {
            let desired = serde_json::to_value(&crd)?;
            let live = serde_json::to_value(&live)?;
            if objects::drifted(&desired, &live) {
                debug!(name, "updating CRD");
                crds.patch(&name, &PATCH_PARAMS, &Patch::Apply(&crd)).await?;
            }
        }
    }
    Ok(())
}

#[instrument(skip(ctx, rgd))]
async fn cleanup_one(rgd: Arc<ResourceGraphDefinition>, ctx: Arc<Context>) -> Result<Action> {
    let oref = rgd.object_ref(&());
    let req = Request::new(&ctx.client, oref);
    let key = registered_key(&rgd);

    if ctx.config.allow_crd_deletion {
        if let Some(graph) = ctx.registry.graph_for(&key) {
            // Instances go first; their reconciler is still registered and
            // unwinds each one's members through its finalizer.
            let ar = kube::core::ApiResource::from_gvk_with_plural(&graph.gvk, &graph.plural);
            let instances: Api<DynamicObject> = Api::all_with(ctx.client.clone(), &ar);
            let found = instances.list(&ListParams::default()).await?;
            if !found.items.is_empty() {
                for item in &found.items {
                    if item.metadata.deletion_timestamp.is_none() {
                        debug!(instance = item.name_any(), "deleting instance");
                        let api: Api<DynamicObject> = match item.namespace() {
                            Some(ns) => Api::namespaced_with(ctx.client.clone(), &ns, &ar),
                            None => instances.clone(),
                        };
                        api.delete(&item.name_any(), &DeleteParams::default())
                            .await?;
                    }
                }
                return Ok(Action::requeue(Duration::from_secs(5)));
            }
            let name = graph
                .crd
                .metadata
                .name
                .clone()
                .ok_or(Error::MissingName("crd"))?;
            let crds: Api<CustomResourceDefinition> = Api::all(ctx.client.clone());
            if crds.get_opt(&name).await?.is_some() {
                info!(name, "deleting CRD");
                crds.delete(&name, &DeleteParams::default()).await?;
            }
        }
        ctx.registry.unregister(&key).await?;
    } else if let Some(graph) = ctx.registry.graph_for(&key) {
        // Policy keeps the CRD and its instances; the reconciler must keep
        // serving them (finalizers included), so it only unregisters once
        // the kind is empty.
        let ar = kube::core::ApiResource::from_gvk_with_plural(&graph.gvk, &graph.plural);
        let instances: Api<DynamicObject> = Api::all_with(ctx.client.clone(), &ar);
        let found = instances.list(&ListParams::default().limit(1)).await?;
        if found.items.is_empty() {
            ctx.registry.unregister(&key).await?;
        } else {
            info!(key, "instances remain, leaving reconciler registered");
        }
    }

    req.publish(Event {
        type_: EventType::Normal,
        reason: "DeleteRequested".into(),
        note: Some(format!("Delete `{}`", rgd.name_any())),
        action: "Deleting".into(),
        secondary: None,
    })
    .await?;
    Ok(Action::await_change())
}

// The registration key is derived from the RGD's declared kind; the graph
// may no longer compile at cleanup time, so it is rebuilt from the spec.
fn registered_key(rgd: &ResourceGraphDefinition) -> String {
    let group = rgd
        .spec
        .schema
        .group
        .clone()
        .unwrap_or_else(|| graph::builder::DEFAULT_GROUP.to_string());
    let gvk = GroupVersionKind {
        group,
        version: rgd.spec.schema.api_version.clone(),
        kind: rgd.spec.schema.kind.clone(),
    };
    gvk_key(&gvk)
}

async fn publish_status(
    rgd: &ResourceGraphDefinition,
    ctx: &Context,
    next: ResourceGraphDefinitionStatus,
) -> Result<()> {
    let name = rgd.metadata.name.as_ref().ok_or(Error::MissingName("rgd"))?;
    let api: Api<ResourceGraphDefinition> = Api::all(ctx.client.clone());
    let status_update = Patch::Apply(json!({
        "apiVersion": ResourceGraphDefinition::api_version(&()),
        "kind": ResourceGraphDefinition::kind(&()),
        "status": next,
    }));
    trace!("patching status");
    api.patch_status(name, &PATCH_PARAMS, &status_update).await?;
    Ok(())
}
