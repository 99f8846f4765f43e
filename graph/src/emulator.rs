//! Emulator synthesizes schema-conformant dummy objects.
//!
//! The compiler dry-runs every expression against these objects before any
//! real apply, so values only need the right shape and type. Choices are
//! deterministic so compilation of the same definition always sees the same
//! universe.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    JSONSchemaProps, JSONSchemaPropsOrArray, JSONSchemaPropsOrBool,
};
use serde_json::{json, Map, Value};

/// Error is the set of emulation failures.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// NilSchema indicates there was no schema to emulate from.
    #[error("no schema to emulate for {0}")]
    NilSchema(String),
    /// AmbiguousType indicates a node with no type and no usable variants.
    #[error("schema node at {0:?} has no type and no oneOf/anyOf branches")]
    AmbiguousType(String),
    /// MissingItems indicates an array schema without an item schema.
    #[error("array at {0:?} has no items schema")]
    MissingItems(String),
}

/// Result typedef for emulation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

const DUMMY_STRING: &str = "dummy-value";

/// Emulate_object produces a full object for a kind: the schema-driven body
/// with the top-level Kubernetes fields set explicitly afterward.
pub fn emulate_object(
    schema: Option<&JSONSchemaProps>,
    api_version: &str,
    kind: &str,
    name: &str,
    namespace: Option<&str>,
) -> Result<Value> {
    let mut object = match schema {
        Some(schema) => emulate(schema)?,
        None => json!({}),
    };
    if !object.is_object() {
        object = json!({});
    }
    let map = object.as_object_mut().expect("object ensured above");
    map.insert("apiVersion".into(), json!(api_version));
    map.insert("kind".into(), json!(kind));
    let mut metadata = json!({
        "name": name,
        "uid": "00000000-0000-0000-0000-000000000000",
        "generation": 1,
    });
    if let Some(ns) = namespace {
        metadata["namespace"] = json!(ns);
    }
    map.insert("metadata".into(), metadata);
    Ok(object)
}

/// Emulate produces a value conforming to `schema`.
pub fn emulate(schema: &JSONSchemaProps) -> Result<Value> {
    node(schema, "$")
}

fn node(schema: &JSONSchemaProps, path: &str) -> Result<Value> {
    if schema.x_kubernetes_int_or_string.unwrap_or(false) {
        return Ok(json!(1));
    }
    let type_ = match schema.type_.as_deref() {
        Some(t) => t,
        None => {
            // oneOf/anyOf/allOf nodes carry the type on a branch.
            if let Some(branch) = schema
                .one_of
                .as_ref()
                .and_then(|v| v.first())
                .or_else(|| schema.any_of.as_ref().and_then(|v| v.first()))
                .or_else(|| schema.all_of.as_ref().and_then(|v| v.first()))
            {
                return node(branch, path);
            }
            if schema.x_kubernetes_preserve_unknown_fields.unwrap_or(false) {
                return Ok(json!({}));
            }
            // Un-inlined $ref nodes stay opaque rather than failing the
            // whole emulation.
            if schema.ref_path.is_some() {
                return Ok(json!({}));
            }
            return Err(Error::AmbiguousType(path.to_string()));
        }
    };

    Ok(match type_ {
        "string" => match schema.enum_.as_ref().and_then(|e| e.first()) {
            Some(choice) => choice.0.clone(),
            None => match schema.format.as_deref() {
                Some("date-time") => json!("1970-01-01T00:00:00Z"),
                _ => json!(DUMMY_STRING),
            },
        },
        "integer" => {
            let v = bounded(schema.minimum, schema.maximum, 0.0, 10_000.0);
            json!(v as i64)
        }
        "number" => json!(bounded(schema.minimum, schema.maximum, 0.0, 100.0)),
        "boolean" => json!(true),
        "array" => {
            let items = match schema.items.as_ref() {
                Some(JSONSchemaPropsOrArray::Schema(items)) => items.as_ref(),
                Some(JSONSchemaPropsOrArray::Schemas(list)) => match list.first() {
                    Some(items) => items,
                    None => return Err(Error::MissingItems(path.to_string())),
                },
                None => return Err(Error::MissingItems(path.to_string())),
            };
            let min = schema.min_items.unwrap_or(1).max(1);
            let count = match schema.max_items {
                Some(max) => min.min(max).max(0),
                None => min,
            };
            let mut out = Vec::new();
            for i in 0..count {
                out.push(node(items, &format!("{path}[{i}]"))?);
            }
            Value::Array(out)
        }
        "object" => {
            let mut out = Map::new();
            if let Some(properties) = schema.properties.as_ref() {
                for (name, prop) in properties {
                    out.insert(name.clone(), node(prop, &format!("{path}.{name}"))?);
                }
            } else if let Some(JSONSchemaPropsOrBool::Schema(values)) =
                schema.additional_properties.as_ref()
            {
                out.insert("key".into(), node(values, &format!("{path}.key"))?);
            }
            Value::Object(out)
        }
        _ => return Err(Error::AmbiguousType(path.to_string())),
    })
}

// Pick a representative inside the declared bounds.
fn bounded(min: Option<f64>, max: Option<f64>, lo: f64, hi: f64) -> f64 {
    let lo = min.unwrap_or(lo);
    let hi = max.unwrap_or(hi.max(lo));
    if lo > hi {
        return lo;
    }
    let candidate = if lo > 1.0 { lo } else { 1.0 };
    candidate.clamp(lo, hi)
}
