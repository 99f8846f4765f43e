//! Resource holds the compiled per-member records the runtime executes.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use kube::core::GroupVersionKind;
use serde_json::Value;

use api::v1alpha1;

/// FieldKind classifies a template field by what its expressions read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Static fields read only the instance spec and resolve before any
    /// member exists.
    Static,
    /// Dynamic fields read live state of other members (or the instance
    /// status) and resolve as those members report it.
    Dynamic,
}

/// ResourceField is one expression-bearing field of a member template.
#[derive(Debug, Clone)]
pub struct ResourceField {
    /// Path of the field inside the template.
    pub path: String,
    /// The inner expressions, left to right.
    pub expressions: Vec<String>,
    /// Static or Dynamic, per what the expressions reference.
    pub kind: FieldKind,
    /// True when the field is exactly one expression, so the substituted
    /// value keeps its native type.
    pub standalone: bool,
    /// The original string leaf, kept for mixed-field concatenation.
    pub original: String,
    /// Declared type at this path in the member's schema, when known.
    pub expected_type: Option<String>,
    /// Member ids this field reads; `schema` is never listed here.
    pub dependencies: Vec<String>,
}

impl ResourceField {
    /// Is_dynamic reports whether the field waits on other members.
    pub fn is_dynamic(&self) -> bool {
        self.kind == FieldKind::Dynamic
    }
}

/// Resource is one compiled member of a graph.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Id of the member, unique within the graph.
    pub id: String,
    /// Group/version/kind of the materialized object.
    pub gvk: GroupVersionKind,
    /// Plural resource name, from discovery.
    pub plural: String,
    /// Whether the kind is namespaced, from discovery.
    pub namespaced: bool,
    /// The member's OpenAPI schema, when the resolver had one.
    pub schema: Option<JSONSchemaProps>,
    /// The user's template, untouched.
    pub template: Value,
    /// A schema-conformant dummy object used for dry-run typing.
    pub emulated: Value,
    /// The expression-bearing fields of the template.
    pub variables: Vec<ResourceField>,
    /// Boolean expressions gating downstream members on this one.
    pub ready_when: Vec<String>,
    /// Boolean expressions excluding this member entirely.
    pub include_when: Vec<String>,
    /// Set when the member is a read-only reference to a preexisting
    /// object.
    pub external_ref: Option<v1alpha1::ExternalRef>,
    /// Member ids this resource reads, in first-use order.
    pub dependencies: Vec<String>,
}

impl Resource {
    /// Is_external reports whether the member is read-only.
    pub fn is_external(&self) -> bool {
        self.external_ref.is_some()
    }

    /// Api_version renders the member's apiVersion string.
    pub fn api_version(&self) -> String {
        if self.gvk.group.is_empty() {
            self.gvk.version.clone()
        } else {
            format!("{}/{}", self.gvk.group, self.gvk.version)
        }
    }
}
