//! Module `v1alpha1` implements the v1alpha1 ResourceGraphDefinition CRD API.
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// VERSION is the kubernetes API group's version.
pub static VERSION: &str = "v1alpha1";

/// ResourceGraphDefinitionSpec describes a new custom resource kind together
/// with the member resources materialized for each of its instances.
#[derive(
    CustomResource, Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize, Validate,
)]
#[kube(
    group = "kro.run",
    version = "v1alpha1",
    kind = "ResourceGraphDefinition",
    status = "ResourceGraphDefinitionStatus",
    shortname = "rgd",
    category = "kro",
    derive = "Default",
    derive = "PartialEq",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"TopologicalOrder","type":"string","jsonPath":".status.topologicalOrder","priority":1}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinitionSpec {
    /// Schema declares the new kind: its names and the shape of its spec and
    /// status, written in the SimpleSchema notation.
    #[validate]
    pub schema: SchemaDefinition,
    /// Resources lists the member resource templates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate]
    pub resources: Vec<ResourceDefinition>,
    /// DefaultServiceAccounts maps an instance namespace to the service
    /// account impersonated when materializing members in that namespace.
    ///
    /// The key `"*"` is the fallback for namespaces without an explicit
    /// mapping.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub default_service_accounts: BTreeMap<String, String>,
}

/// SchemaDefinition declares the synthesized kind.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDefinition {
    /// ApiVersion of the synthesized kind, e.g. `v1alpha1`.
    #[validate(length(min = 1))]
    #[schemars(regex(pattern = r"^v\d+(?:(?:alpha|beta)\d+)?$"))]
    pub api_version: String,
    /// Kind is the UpperCamelCase name of the synthesized kind.
    #[validate(length(min = 1))]
    #[schemars(regex(pattern = r"^[A-Z][A-Za-z0-9]*$"))]
    pub kind: String,
    /// Group overrides the API group of the synthesized kind.
    ///
    /// Defaults to `kro.run`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Spec is the SimpleSchema definition of the instance spec.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "schema::preserve_unknown_object")]
    pub spec: Option<serde_json::Value>,
    /// Status is the SimpleSchema definition of the instance status.
    ///
    /// Leaves are `${…}` expressions over member resources; the full status
    /// schema is inferred at compile time.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "schema::preserve_unknown_object")]
    pub status: Option<serde_json::Value>,
    /// Types declares named custom types usable from `spec`.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "schema::preserve_unknown_object")]
    pub types: Option<serde_json::Value>,
    /// Validation is a list of CEL rules enforced on instances by the API
    /// server.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<String>,
}

/// ResourceDefinition is one member resource template.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    /// Id names the member inside expressions; lowerCamelCase, unique.
    #[validate(length(min = 1))]
    #[schemars(regex(pattern = r"^[a-z][A-Za-z0-9]*$"))]
    pub id: String,
    /// Template is the full manifest of the member, with `${…}` expressions
    /// in its string fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "schema::preserve_unknown_object")]
    pub template: Option<serde_json::Value>,
    /// ReadyWhen gates downstream members on these boolean expressions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready_when: Vec<String>,
    /// IncludeWhen excludes the member entirely when any expression is false.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_when: Vec<String>,
    /// ExternalRef points at a preexisting object that is read, never
    /// written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<ExternalRef>,
}

/// ExternalRef identifies a preexisting object outside the instance's
/// ownership.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRef {
    /// ApiVersion of the referent, e.g. `apps/v1`.
    #[validate(length(min = 1))]
    pub api_version: String,
    /// Kind of the referent.
    #[validate(length(min = 1))]
    pub kind: String,
    /// Metadata locates the referent.
    pub metadata: ExternalRefMetadata,
}

/// ExternalRefMetadata locates an external referent by name and namespace.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRefMetadata {
    /// Name of the referent.
    #[validate(length(min = 1))]
    pub name: String,
    /// Namespace of the referent; defaults to the instance namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// ResourceGraphDefinitionStatus describes the observed state of a
/// ResourceGraphDefinition.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinitionStatus {
    /// State is `Active` once the graph compiled and the reconciler is
    /// registered, `Inactive` otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// TopologicalOrder is the member apply order of the compiled graph.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topological_order: Vec<String>,
    /// Conditions reports k8s-style conditions for the compile and
    /// registration machinery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "schema::conditions")]
    pub conditions: Option<Vec<meta::v1::Condition>>,
}

mod schema {
    use schemars::gen::SchemaGenerator;
    use schemars::schema::{InstanceType, Schema, SchemaObject};
    use serde_json::json;

    use super::meta;

    /// An object whose fields are not described here; the API server keeps
    /// whatever the user submits.
    pub fn preserve_unknown_object(_: &mut SchemaGenerator) -> Schema {
        let mut schema = SchemaObject {
            instance_type: Some(InstanceType::Object.into()),
            ..Default::default()
        };
        schema
            .extensions
            .insert("x-kubernetes-preserve-unknown-fields".into(), json!(true));
        Schema::Object(schema)
    }

    pub fn conditions(generator: &mut SchemaGenerator) -> Schema {
        let mut schema = generator
            .subschema_for::<Vec<meta::v1::Condition>>()
            .into_object();
        schema
            .extensions
            .insert("x-kubernetes-list-type".into(), json!("map"));
        schema
            .extensions
            .insert("x-kubernetes-list-map-keys".into(), json!(["type"]));
        Schema::Object(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_round_trips() {
        let doc = serde_json::json!({
            "schema": {
                "apiVersion": "v1alpha1",
                "kind": "WebApp",
                "spec": { "name": "string", "replicas": "integer | default=3" },
                "status": { "url": "${service.status.loadBalancer.ingress[0].hostname}" },
            },
            "resources": [{
                "id": "service",
                "template": { "apiVersion": "v1", "kind": "Service" },
                "readyWhen": ["${service.status.ready}"],
            }],
            "defaultServiceAccounts": { "*": "kro-runtime" },
        });
        let spec: ResourceGraphDefinitionSpec = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(spec.schema.kind, "WebApp");
        assert_eq!(spec.resources[0].id, "service");
        assert_eq!(
            spec.default_service_accounts.get("*").map(String::as_str),
            Some("kro-runtime")
        );
        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn crd_has_status_subresource() {
        use kube::CustomResourceExt;
        let crd = ResourceGraphDefinition::crd();
        let version = &crd.spec.versions[0];
        assert!(version.subresources.as_ref().unwrap().status.is_some());
        assert_eq!(crd.spec.names.plural, "resourcegraphdefinitions");
    }
}
