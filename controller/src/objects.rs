//! Objects holds the helpers for addressing and stamping member objects.
//!
//! Every member is handled as a [`DynamicObject`] addressed by GVR; variant
//! behavior (namespaced or not) comes from the discovery metadata carried on
//! the compiled resource record.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, DynamicObject},
    core::ApiResource,
};
use serde_json::{json, Value};

use crate::{Error, Result, BUILD_VERSION, CONTROLLER_NAME};
use graph::Resource;

/// Api_resource_for builds the dynamic-type descriptor for a compiled
/// member.
pub fn api_resource_for(resource: &Resource) -> ApiResource {
    ApiResource::from_gvk_with_plural(&resource.gvk, &resource.plural)
}

/// Member_api returns the `Api` a member should be addressed through,
/// namespaced into `namespace` when the kind requires it.
pub fn member_api(
    client: kube::Client,
    resource: &Resource,
    namespace: &str,
) -> Api<DynamicObject> {
    let ar = api_resource_for(resource);
    if resource.namespaced {
        Api::namespaced_with(client, namespace, &ar)
    } else {
        Api::all_with(client, &ar)
    }
}

/// Object_name extracts `metadata.name`, which every materialized member
/// must carry.
pub fn object_name(object: &Value, id: &str) -> Result<String> {
    object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Terminal(format!("member {id:?} resolved without metadata.name")))
}

/// Decorate stamps ownership onto a materialized member: the kro labels,
/// the default namespace, and (for namespaced members) the instance owner
/// reference.
///
/// Cluster-scoped members of a namespaced instance get labels only; the
/// API server rejects cross-scope owner references, so teardown finds them
/// by label instead.
pub fn decorate(
    object: &mut Value,
    resource: &Resource,
    owner: &OwnerReference,
    instance_uid: &str,
    instance_namespace: &str,
) {
    let metadata = match object.get_mut("metadata") {
        Some(Value::Object(m)) => m,
        _ => return,
    };
    if resource.namespaced && !metadata.contains_key("namespace") {
        metadata.insert("namespace".into(), json!(instance_namespace));
    }

    let labels = metadata
        .entry("labels")
        .or_insert_with(|| json!({}));
    if let Value::Object(labels) = labels {
        labels.insert(crate::OWNED_LABEL.clone(), json!("true"));
        labels.insert(crate::VERSION_LABEL.clone(), json!(BUILD_VERSION));
        labels.insert(crate::MANAGED_BY_LABEL.clone(), json!(CONTROLLER_NAME));
        labels.insert(crate::kro_label("instance-uid"), json!(instance_uid));
    }

    if resource.namespaced {
        metadata.insert(
            "ownerReferences".into(),
            json!([serde_json::to_value(owner).unwrap_or_default()]),
        );
    }
}

/// Owned_selector is the label selector finding a single instance's
/// materialized members.
pub fn owned_selector(instance_uid: &str) -> String {
    format!(
        "{}=true,{}={}",
        crate::OWNED_LABEL.as_str(),
        crate::kro_label("instance-uid"),
        instance_uid
    )
}

/// Is_subset reports whether every field of `desired` is present with the
/// same value in `live`. Arrays compare element-wise and must have equal
/// length.
pub fn is_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|lv| is_subset(v, lv))),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len()
                && want.iter().zip(have.iter()).all(|(v, lv)| is_subset(v, lv))
        }
        (want, have) => want == have,
    }
}

/// Drifted reports whether `live` no longer reflects `desired`, ignoring
/// status.
pub fn drifted(desired: &Value, live: &Value) -> bool {
    let mut desired = desired.clone();
    if let Some(m) = desired.as_object_mut() {
        m.remove("status");
    }
    !is_subset(&desired, live)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subset_ignores_server_populated_fields() {
        let desired = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "a", "labels": { "x": "1" } },
            "data": { "k": "v" },
        });
        let live = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "a",
                "labels": { "x": "1", "extra": "2" },
                "resourceVersion": "123",
                "uid": "u",
            },
            "data": { "k": "v" },
        });
        assert!(is_subset(&desired, &live));
        assert!(!drifted(&desired, &live));
    }

    #[test]
    fn value_changes_are_drift() {
        let desired = json!({"data": {"k": "v2"}});
        let live = json!({"data": {"k": "v"}, "status": {"ready": true}});
        assert!(drifted(&desired, &live));
    }

    #[test]
    fn status_is_ignored_for_drift() {
        let desired = json!({"data": {"k": "v"}, "status": {"anything": 1}});
        let live = json!({"data": {"k": "v"}});
        assert!(!drifted(&desired, &live));
    }

    #[test]
    fn arrays_compare_elementwise() {
        assert!(is_subset(&json!([1, 2]), &json!([1, 2])));
        assert!(!is_subset(&json!([1]), &json!([1, 2])));
        assert!(!is_subset(&json!([2, 1]), &json!([1, 2])));
    }
}
