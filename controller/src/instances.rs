//! Instances executes a compiled graph for one instance of a synthesized
//! kind: resolve values, materialize members in dependency order, observe
//! live state, gate on readiness, and project the instance status.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch},
    core::ApiResource,
};
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    metrics, objects,
    prelude::*,
    InstanceState, FINALIZER,
};
use graph::builder::{gvk_key, INSTANCE_ID};
use graph::{expr, fieldpath, Graph, Resource as GraphResource};

pub(crate) const INSTANCE_CONTROLLER: &str = "instance";

/// InstanceContext is the per-registration state shared by every reconcile
/// of one synthesized kind.
pub struct InstanceContext {
    /// Ctx is the process-wide controller context.
    pub ctx: Arc<Context>,
    /// Api_resource addresses instances of the synthesized kind.
    pub api_resource: ApiResource,
    graph: RwLock<Arc<Graph>>,
    attempts: Mutex<HashMap<String, u32>>,
    impersonated: AsyncMutex<HashMap<String, kube::Client>>,
}

impl InstanceContext {
    /// New builds the context for one registration.
    pub fn new(ctx: Arc<Context>, graph: Arc<Graph>) -> Self {
        let api_resource = ApiResource::from_gvk_with_plural(&graph.gvk, &graph.plural);
        Self {
            ctx,
            api_resource,
            graph: RwLock::new(graph),
            attempts: Mutex::new(HashMap::new()),
            impersonated: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Graph snapshots the current compiled graph.
    ///
    /// A hot swap is atomic from the caller's point of view: a reconcile
    /// uses the graph it snapshot at entry, never a mix.
    pub fn graph(&self) -> Arc<Graph> {
        self.graph.read().expect("graph lock poisoned").clone()
    }

    /// Swap_graph atomically replaces the compiled graph.
    pub fn swap_graph(&self, next: Arc<Graph>) {
        *self.graph.write().expect("graph lock poisoned") = next;
    }

    fn note_attempt(&self, key: &str) -> u32 {
        let mut attempts = self.attempts.lock().expect("attempts lock poisoned");
        let n = attempts.entry(key.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    fn reset_attempts(&self, key: &str) {
        self.attempts
            .lock()
            .expect("attempts lock poisoned")
            .remove(key);
    }

    // Member writes impersonate the configured service account for the
    // instance's namespace, when one is mapped.
    async fn member_client(&self, graph: &Graph, namespace: &str) -> Result<kube::Client> {
        let account = graph
            .default_service_accounts
            .get(namespace)
            .or_else(|| graph.default_service_accounts.get("*"));
        let Some(account) = account else {
            return Ok(self.ctx.client.clone());
        };
        let Some(base) = self.ctx.kube_config.as_ref() else {
            warn!(account, "no kubeconfig for impersonation, using own identity");
            return Ok(self.ctx.client.clone());
        };
        let user = format!("system:serviceaccount:{namespace}:{account}");
        let mut cache = self.impersonated.lock().await;
        if let Some(client) = cache.get(&user) {
            return Ok(client.clone());
        }
        let mut config = base.clone();
        config.auth_info.impersonate = Some(user.clone());
        let client = kube::Client::try_from(config)?;
        cache.insert(user, client.clone());
        Ok(client)
    }
}

impl std::fmt::Debug for InstanceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ictx({})", gvk_key(&self.graph().gvk))
    }
}

fn instance_key(obj: &DynamicObject) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Reconcile runs one pass for one instance.
#[instrument(skip(obj, ictx), fields(
    kind = ictx.api_resource.kind,
    namespace = obj.namespace().unwrap_or_default(),
    name = obj.name_any(),
    generation = obj.metadata.generation,
))]
pub async fn reconcile(obj: Arc<DynamicObject>, ictx: Arc<InstanceContext>) -> Result<Action> {
    metrics::reconciles(INSTANCE_CONTROLLER).increment(1);
    let graph = ictx.graph();

    if obj.metadata.deletion_timestamp.is_some() {
        return teardown(&obj, &ictx, &graph).await;
    }
    ensure_finalizer(&obj, &ictx).await?;

    match run(&obj, &ictx, &graph).await {
        Ok(action) => {
            ictx.reset_attempts(&instance_key(&obj));
            Ok(action)
        }
        Err(Error::Terminal(reason)) => {
            warn!(reason, "instance cannot converge");
            park(&obj, &ictx, &graph, &reason).await?;
            ictx.reset_attempts(&instance_key(&obj));
            Ok(Action::await_change())
        }
        Err(err) => Err(err),
    }
}

/// Error_policy retries with bounded exponential backoff; items beyond the
/// retry budget are dropped until their next watch event.
pub fn error_policy(obj: Arc<DynamicObject>, err: &Error, ictx: Arc<InstanceContext>) -> Action {
    metrics::failures(INSTANCE_CONTROLLER).increment(1);
    error!(
        error = err.to_string(),
        name = obj.name_any(),
        "instance reconcile error"
    );
    let key = instance_key(&obj);
    let attempts = ictx.note_attempt(&key);
    if attempts > ictx.ctx.config.queue_max_retries {
        metrics::queue_drops(INSTANCE_CONTROLLER).increment(1);
        warn!(attempts, name = obj.name_any(), "retry budget exhausted");
        ictx.reset_attempts(&key);
        return Action::await_change();
    }
    let exp = attempts.min(9);
    let backoff = Duration::from_millis(500u64.saturating_mul(1 << exp))
        .min(Duration::from_secs(300));
    Action::requeue(backoff)
}

enum Resolution {
    Ready(Value),
    Pending(String),
}

async fn run(obj: &DynamicObject, ictx: &InstanceContext, graph: &Graph) -> Result<Action> {
    let namespace = obj
        .namespace()
        .ok_or(Error::MissingName("instance namespace"))?;
    let uid = obj
        .metadata
        .uid
        .clone()
        .ok_or(Error::MissingName("instance uid"))?;
    let owner = obj
        .controller_owner_ref(&ictx.api_resource)
        .ok_or(Error::MissingName("instance owner reference"))?;

    let mut vars: HashMap<String, Value> = HashMap::new();
    vars.insert(INSTANCE_ID.to_string(), serde_json::to_value(obj)?);

    let mut excluded: HashSet<String> = HashSet::new();
    let mut waiting: Vec<(String, String)> = Vec::new();
    let mut unready: HashSet<String> = HashSet::new();

    for resource in graph.resource_order() {
        let id = resource.id.clone();

        // Dependents of excluded members are excluded too; nothing may
        // reference an object that will never exist.
        if resource.dependencies.iter().any(|d| excluded.contains(d)) {
            debug!(id, "excluded via dependency");
            excluded.insert(id);
            continue;
        }
        if !included(resource, &vars)? {
            debug!(id, "excluded by includeWhen");
            excluded.insert(id);
            continue;
        }
        if resource
            .dependencies
            .iter()
            .any(|d| unready.contains(d) || !vars.contains_key(d))
        {
            waiting.push((id, "waiting on dependencies".to_string()));
            continue;
        }

        let object = match materialize(resource, &vars)? {
            Resolution::Ready(object) => object,
            Resolution::Pending(reason) => {
                trace!(id, reason, "not yet resolvable");
                waiting.push((id, reason));
                continue;
            }
        };

        if resource.is_external() {
            match observe_external(ictx, resource, &object, &namespace).await? {
                Some(live) => {
                    vars.insert(id.clone(), live);
                    if !ready(resource, &vars) {
                        unready.insert(id);
                    }
                }
                None => waiting.push((id, "external object not found".to_string())),
            }
            continue;
        }

        let live = apply(ictx, graph, resource, object, &owner, &uid, &namespace).await?;
        vars.insert(id.clone(), live);
        if !ready(resource, &vars) {
            debug!(id = resource.id, "not ready");
            unready.insert(resource.id.clone());
        }
    }

    let state = if waiting.is_empty() && unready.is_empty() {
        InstanceState::Active
    } else {
        InstanceState::Progressing
    };
    let detail = summary(&waiting, &unready);
    project_status(obj, ictx, graph, &vars, state, &detail).await?;

    match state {
        InstanceState::Active => Ok(DEFAULT_REQUEUE.clone()),
        _ => Ok(Action::requeue(ictx.ctx.config.default_requeue_duration)),
    }
}

// IncludeWhen only reads the instance spec, so any failure (a non-boolean
// included) is deterministic until the spec changes.
fn included(resource: &GraphResource, vars: &HashMap<String, Value>) -> Result<bool> {
    for expression in &resource.include_when {
        match expr::evaluate_bool(expression, vars) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(err) => return Err(Error::Terminal(err.to_string())),
        }
    }
    Ok(true)
}

// ReadyWhen failing to evaluate cleanly means not-ready, not an error; the
// next observation may fill in the missing status.
fn ready(resource: &GraphResource, vars: &HashMap<String, Value>) -> bool {
    resource.ready_when.iter().all(|expression| {
        matches!(expr::evaluate_bool(expression, vars), Ok(true))
    })
}

fn materialize(resource: &GraphResource, vars: &HashMap<String, Value>) -> Result<Resolution> {
    let mut object = resource.template.clone();
    for field in &resource.variables {
        if field.dependencies.iter().any(|d| !vars.contains_key(d)) {
            return Ok(Resolution::Pending(format!(
                "field {} waits on {:?}",
                field.path, field.dependencies
            )));
        }
        let segments =
            fieldpath::parse(&field.path).map_err(|err| Error::Graph(err.into()))?;
        let value =
            match expr::evaluate_all(&field.expressions, field.standalone, &field.original, vars)
            {
                Ok(value) => value,
                // A dynamic read usually failed because the referent's
                // status has not been populated yet.
                Err(err) if field.is_dynamic() => {
                    return Ok(Resolution::Pending(err.to_string()))
                }
                Err(err) => return Err(Error::Terminal(err.to_string())),
            };
        fieldpath::set(&mut object, &segments, value);
    }
    Ok(Resolution::Ready(object))
}

async fn observe_external(
    ictx: &InstanceContext,
    resource: &GraphResource,
    object: &Value,
    instance_namespace: &str,
) -> Result<Option<Value>> {
    let namespace = resource
        .external_ref
        .as_ref()
        .and_then(|r| r.metadata.namespace.clone())
        .unwrap_or_else(|| instance_namespace.to_string());
    let api = objects::member_api(ictx.ctx.client.clone(), resource, &namespace);
    let name = objects::object_name(object, &resource.id)?;
    match api.get_opt(&name).await? {
        Some(live) => Ok(Some(serde_json::to_value(&live)?)),
        None => Ok(None),
    }
}

// Create-or-apply one member, then re-fetch it so downstream resolutions
// see authoritative fields.
#[instrument(skip_all, fields(id = resource.id, kind = resource.gvk.kind))]
async fn apply(
    ictx: &InstanceContext,
    graph: &Graph,
    resource: &GraphResource,
    mut object: Value,
    owner: &k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    uid: &str,
    instance_namespace: &str,
) -> Result<Value> {
    objects::decorate(&mut object, resource, owner, uid, instance_namespace);
    let member_namespace = object
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or(instance_namespace)
        .to_string();
    let client = ictx.member_client(graph, instance_namespace).await?;
    let api = objects::member_api(client, resource, &member_namespace);
    let name = objects::object_name(&object, &resource.id)?;

    match api.get_opt(&name).await? {
        None => {
            trace!(name, "create");
            let desired: DynamicObject = serde_json::from_value(object)?;
            api.create(&CREATE_PARAMS, &desired).await?;
        }
        Some(live) => {
            let live = serde_json::to_value(&live)?;
            if objects::drifted(&object, &live) {
                trace!(name, "apply");
                api.patch(&name, &PATCH_PARAMS, &Patch::Apply(&object)).await?;
            } else {
                trace!(name, "converged");
            }
        }
    }

    let observed = api.get(&name).await?;
    Ok(serde_json::to_value(&observed)?)
}

fn summary(waiting: &[(String, String)], unready: &HashSet<String>) -> String {
    if waiting.is_empty() && unready.is_empty() {
        return "all members reconciled".to_string();
    }
    let mut parts = Vec::new();
    if !waiting.is_empty() {
        let ids: Vec<&str> = waiting.iter().map(|(id, _)| id.as_str()).collect();
        parts.push(format!("waiting: {}", ids.join(", ")));
    }
    if !unready.is_empty() {
        let mut ids: Vec<&str> = unready.iter().map(String::as_str).collect();
        ids.sort_unstable();
        parts.push(format!("not ready: {}", ids.join(", ")));
    }
    parts.join("; ")
}

async fn project_status(
    obj: &DynamicObject,
    ictx: &InstanceContext,
    graph: &Graph,
    vars: &HashMap<String, Value>,
    state: InstanceState,
    detail: &str,
) -> Result<()> {
    let mut status = json!({});
    for field in &graph.status_fields {
        if field.dependencies.iter().any(|d| !vars.contains_key(d)) {
            continue;
        }
        let segments =
            fieldpath::parse(&field.path).map_err(|err| Error::Graph(err.into()))?;
        match expr::evaluate_all(&field.expressions, field.standalone, &field.original, vars) {
            // Nulls are dropped from the projection rather than written.
            Ok(Value::Null) => {}
            Ok(value) => fieldpath::set(&mut status, &segments, value),
            Err(err) => trace!(path = field.path, error = err.to_string(), "unresolved"),
        }
    }

    status["state"] = json!(state.to_string());
    let synced = state == InstanceState::Active;
    let mut conditions: Vec<Condition> = obj
        .data
        .pointer("/status/conditions")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    crate::set_condition(
        &mut conditions,
        crate::new_condition(
            "InstanceSynced",
            synced,
            if synced {
                "ReconcileComplete"
            } else {
                "ReconcileInProgress"
            },
            detail,
            obj.metadata.generation,
            meta::v1::Time(Utc::now()),
        ),
    );
    status["conditions"] = serde_json::to_value(&conditions)?;

    // A converged instance produces no further writes.
    let current = obj.data.get("status").cloned().unwrap_or(json!({}));
    if objects::is_subset(&status_without_timestamps(&status), &status_without_timestamps(&current))
    {
        trace!("status unchanged");
        return Ok(());
    }

    let namespace = obj
        .namespace()
        .ok_or(Error::MissingName("instance namespace"))?;
    let api: Api<DynamicObject> =
        Api::namespaced_with(ictx.ctx.client.clone(), &namespace, &ictx.api_resource);
    let api_version = if graph.gvk.group.is_empty() {
        graph.gvk.version.clone()
    } else {
        format!("{}/{}", graph.gvk.group, graph.gvk.version)
    };
    let patch = json!({
        "apiVersion": api_version,
        "kind": graph.gvk.kind,
        "status": status,
    });
    debug!("updating status");
    api.patch_status(&obj.name_any(), &PATCH_PARAMS, &Patch::Apply(&patch))
        .await?;
    Ok(())
}

// Transition times move on every flip; strip them so equality means
// "nothing the user can see changed".
fn status_without_timestamps(status: &Value) -> Value {
    let mut out = status.clone();
    if let Some(conditions) = out
        .pointer_mut("/conditions")
        .and_then(Value::as_array_mut)
    {
        for condition in conditions {
            if let Some(map) = condition.as_object_mut() {
                map.remove("lastTransitionTime");
            }
        }
    }
    out
}

// Park writes the terminal state; the instance is not requeued until its
// spec changes.
async fn park(
    obj: &DynamicObject,
    ictx: &InstanceContext,
    graph: &Graph,
    reason: &str,
) -> Result<()> {
    let req = Request::new(&ictx.ctx.client, obj.object_ref(&ictx.api_resource));
    req.publish(Event {
        type_: EventType::Warning,
        reason: "ReconcileTerminal".into(),
        note: Some(reason.to_string()),
        action: "Reconcile".into(),
        secondary: None,
    })
    .await?;

    let namespace = obj
        .namespace()
        .ok_or(Error::MissingName("instance namespace"))?;
    let api: Api<DynamicObject> =
        Api::namespaced_with(ictx.ctx.client.clone(), &namespace, &ictx.api_resource);
    let mut conditions: Vec<Condition> = obj
        .data
        .pointer("/status/conditions")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    crate::set_condition(
        &mut conditions,
        crate::new_condition(
            "InstanceSynced",
            false,
            "TerminalError",
            reason,
            obj.metadata.generation,
            meta::v1::Time(Utc::now()),
        ),
    );
    let api_version = if graph.gvk.group.is_empty() {
        graph.gvk.version.clone()
    } else {
        format!("{}/{}", graph.gvk.group, graph.gvk.version)
    };
    let patch = json!({
        "apiVersion": api_version,
        "kind": graph.gvk.kind,
        "status": {
            "state": InstanceState::Error.to_string(),
            "conditions": conditions,
        },
    });
    api.patch_status(&obj.name_any(), &PATCH_PARAMS, &Patch::Apply(&patch))
        .await?;
    Ok(())
}

async fn ensure_finalizer(obj: &DynamicObject, ictx: &InstanceContext) -> Result<()> {
    let mut finalizers = obj.metadata.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    finalizers.push(FINALIZER.to_string());
    let namespace = obj
        .namespace()
        .ok_or(Error::MissingName("instance namespace"))?;
    let api: Api<DynamicObject> =
        Api::namespaced_with(ictx.ctx.client.clone(), &namespace, &ictx.api_resource);
    trace!("adding finalizer");
    api.patch(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    Ok(())
}

// Teardown deletes owned members in reverse apply order, waiting for each
// layer to disappear before releasing the next, then drops the finalizer.
// External refs are never touched.
#[instrument(skip_all, fields(name = obj.name_any()))]
async fn teardown(obj: &DynamicObject, ictx: &InstanceContext, graph: &Graph) -> Result<Action> {
    let has_finalizer = obj
        .metadata
        .finalizers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|f| f == FINALIZER);
    if !has_finalizer {
        return Ok(Action::await_change());
    }

    let namespace = obj
        .namespace()
        .ok_or(Error::MissingName("instance namespace"))?;
    let uid = obj
        .metadata
        .uid
        .clone()
        .ok_or(Error::MissingName("instance uid"))?;
    let selector = objects::owned_selector(&uid);

    for id in graph.topological_order.iter().rev() {
        let Some(resource) = graph.resource(id) else {
            continue;
        };
        if resource.is_external() {
            continue;
        }
        let api = objects::member_api(ictx.ctx.client.clone(), resource, &namespace);
        let found = api
            .list(&ListParams::default().labels(&selector))
            .await?;
        if found.items.is_empty() {
            continue;
        }
        for item in &found.items {
            if item.metadata.deletion_timestamp.is_none() {
                debug!(member = item.name_any(), "deleting");
                ignore_not_found(
                    api.delete(&item.name_any(), &DeleteParams::default()).await,
                )?;
            }
        }
        // Wait for this layer to disappear before deleting upstream.
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    remove_finalizer(obj, ictx, &namespace).await?;
    Ok(Action::await_change())
}

async fn remove_finalizer(
    obj: &DynamicObject,
    ictx: &InstanceContext,
    namespace: &str,
) -> Result<()> {
    let finalizers: Vec<String> = obj
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != FINALIZER)
        .collect();
    let api: Api<DynamicObject> =
        Api::namespaced_with(ictx.ctx.client.clone(), namespace, &ictx.api_resource);
    trace!("removing finalizer");
    api.patch(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    Ok(())
}

fn ignore_not_found<T>(result: kube::Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(err) => Err(Error::Kube(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, *};

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn fresh_instances_create_members_and_project_status() {
        let (testctx, fakeserver) = Context::instance_tests();
        let graph = webapp_graph().await;
        let ictx = Arc::new(InstanceContext::new(testctx, graph));
        let obj = testing::instance::test();
        let mocksrv = fakeserver.run(Scenario::InstanceCreatesMember(obj.clone()));
        let action = reconcile(Arc::new(obj), ictx).await.expect("reconciler");
        assert_eq!(action, DEFAULT_REQUEUE.clone());
        timeout_after_1s(mocksrv).await;
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn deleting_instances_remove_owned_members_first() {
        let (testctx, fakeserver) = Context::instance_tests();
        let graph = webapp_graph().await;
        let ictx = Arc::new(InstanceContext::new(testctx, graph));
        let obj = testing::instance::deleting(testing::instance::test());
        let member = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "demo-cm", "namespace": "default" },
        });
        let mocksrv = fakeserver.run(Scenario::InstanceTeardown(obj.clone(), vec![member]));
        let action = reconcile(Arc::new(obj), ictx).await.expect("reconciler");
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        timeout_after_1s(mocksrv).await;
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn drained_instances_release_their_finalizer() {
        let (testctx, fakeserver) = Context::instance_tests();
        let graph = webapp_graph().await;
        let ictx = Arc::new(InstanceContext::new(testctx, graph));
        let obj = testing::instance::deleting(testing::instance::test());
        let mocksrv = fakeserver.run(Scenario::InstanceTeardown(obj.clone(), vec![]));
        let action = reconcile(Arc::new(obj), ictx).await.expect("reconciler");
        assert_eq!(action, Action::await_change());
        timeout_after_1s(mocksrv).await;
    }

    #[self::test]
    fn summaries_read_well() {
        assert_eq!(summary(&[], &HashSet::new()), "all members reconciled");
        let waiting = vec![("subnet".to_string(), "waiting".to_string())];
        let unready: HashSet<String> = ["deployment".to_string()].into();
        assert_eq!(
            summary(&waiting, &unready),
            "waiting: subnet; not ready: deployment"
        );
    }

    #[self::test]
    fn timestamps_do_not_count_as_change() {
        let a = json!({
            "state": "Active",
            "conditions": [{"type": "InstanceSynced", "status": "True", "lastTransitionTime": "2024-01-01T00:00:00Z"}],
        });
        let b = json!({
            "state": "Active",
            "conditions": [{"type": "InstanceSynced", "status": "True", "lastTransitionTime": "2025-06-01T00:00:00Z"}],
        });
        assert!(objects::is_subset(
            &status_without_timestamps(&a),
            &status_without_timestamps(&b)
        ));
    }
}
