//! Schemas resolves live OpenAPI schemas for member kinds.
//!
//! CRD-backed kinds come straight from their CustomResourceDefinition;
//! builtin kinds come from the API server's `/openapi/v3` group documents.
//! Results are cached per GVK for the life of the process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, JSONSchemaProps,
};
use kube::{
    api::Api,
    core::{discovery::Scope, GroupVersionKind},
    discovery::pinned_kind,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace};

use graph::builder::gvk_key;
use graph::{ResolvedSchema, SchemaSource};

// $ref chains are inlined up to this depth; anything deeper stays opaque.
const MAX_REF_DEPTH: usize = 8;

/// ClusterSchemaSource serves schemas from the connected cluster.
pub struct ClusterSchemaSource {
    client: kube::Client,
    cache: Mutex<HashMap<String, Arc<ResolvedSchema>>>,
}

impl ClusterSchemaSource {
    /// New returns a source resolving against `client`.
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn crd_schema(&self, gvk: &GroupVersionKind, plural: &str) -> Option<JSONSchemaProps> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let name = format!("{}.{}", plural, gvk.group);
        let crd = api.get_opt(&name).await.ok().flatten()?;
        let version = crd
            .spec
            .versions
            .iter()
            .find(|v| v.name == gvk.version)?;
        version
            .schema
            .as_ref()
            .and_then(|s| s.open_api_v3_schema.clone())
    }

    async fn openapi_schema(&self, gvk: &GroupVersionKind) -> Option<JSONSchemaProps> {
        let path = if gvk.group.is_empty() {
            format!("/openapi/v3/api/{}", gvk.version)
        } else {
            format!("/openapi/v3/apis/{}/{}", gvk.group, gvk.version)
        };
        let request = http::Request::get(&path).body(Vec::new()).ok()?;
        let document: Value = self.client.request(request).await.ok()?;
        let components = document.pointer("/components/schemas")?.as_object()?;

        let found = components.values().find(|schema| {
            schema
                .pointer("/x-kubernetes-group-version-kind")
                .and_then(Value::as_array)
                .is_some_and(|ids| {
                    ids.iter().any(|id| {
                        id.get("group").and_then(Value::as_str) == Some(gvk.group.as_str())
                            && id.get("version").and_then(Value::as_str)
                                == Some(gvk.version.as_str())
                            && id.get("kind").and_then(Value::as_str) == Some(gvk.kind.as_str())
                    })
                })
        })?;

        let mut inlined = found.clone();
        inline_refs(&mut inlined, components, 0);
        serde_json::from_value(inlined).ok()
    }
}

#[async_trait]
impl SchemaSource for ClusterSchemaSource {
    #[instrument(skip(self), fields(gvk = gvk_key(gvk)))]
    async fn resolve(&self, gvk: &GroupVersionKind) -> graph::Result<ResolvedSchema> {
        let key = gvk_key(gvk);
        if let Some(found) = self.cache.lock().await.get(&key) {
            trace!("schema cache hit");
            return Ok(found.as_ref().clone());
        }

        let (ar, caps) = pinned_kind(&self.client, gvk)
            .await
            .map_err(|err| graph::Error::SchemaResolution(err.to_string()))?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);

        let schema = match self.crd_schema(gvk, &ar.plural).await {
            Some(schema) => schema,
            None => self
                .openapi_schema(gvk)
                .await
                .ok_or_else(|| graph::Error::SchemaNotFound(key.clone()))?,
        };
        debug!(plural = ar.plural, namespaced, "resolved schema");

        let resolved = ResolvedSchema {
            schema,
            namespaced,
            plural: ar.plural,
        };
        self.cache
            .lock()
            .await
            .insert(key, Arc::new(resolved.clone()));
        Ok(resolved)
    }
}

// Replace `$ref` nodes with the referenced component so downstream
// consumers see one self-contained tree.
fn inline_refs(schema: &mut Value, components: &serde_json::Map<String, Value>, depth: usize) {
    if depth >= MAX_REF_DEPTH {
        if let Some(map) = schema.as_object_mut() {
            map.remove("$ref");
        }
        return;
    }
    if let Some(target) = schema
        .get("$ref")
        .and_then(Value::as_str)
        .and_then(|r| r.strip_prefix("#/components/schemas/"))
        .map(str::to_string)
    {
        if let Some(resolved) = components.get(&target) {
            *schema = resolved.clone();
            inline_refs(schema, components, depth + 1);
            return;
        }
        if let Some(map) = schema.as_object_mut() {
            map.remove("$ref");
        }
        return;
    }
    // Plain nesting does not count toward the depth bound; only actual
    // substitutions do, so deep builtin schemas still inline fully.
    match schema {
        Value::Object(map) => {
            for (_, child) in map.iter_mut() {
                inline_refs(child, components, depth);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                inline_refs(child, components, depth);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn refs_are_inlined() {
        let components = json!({
            "a": { "type": "object", "properties": { "b": { "$ref": "#/components/schemas/b" } } },
            "b": { "type": "string" },
        });
        let components = components.as_object().unwrap();
        let mut schema = json!({ "$ref": "#/components/schemas/a" });
        inline_refs(&mut schema, components, 0);
        assert_eq!(
            schema,
            json!({ "type": "object", "properties": { "b": { "type": "string" } } })
        );
    }

    #[test]
    fn cyclic_refs_terminate() {
        let components = json!({
            "loop": { "type": "object", "properties": { "next": { "$ref": "#/components/schemas/loop" } } },
        });
        let components = components.as_object().unwrap();
        let mut schema = json!({ "$ref": "#/components/schemas/loop" });
        inline_refs(&mut schema, components, 0);
        // Terminates; the deepest node lost its $ref and stays opaque.
        assert!(serde_json::to_string(&schema).unwrap().len() < 10_000);
    }
}
