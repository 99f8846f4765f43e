//! Simpleschema converts the terse user schema notation into OpenAPI.
//!
//! Leaves are descriptors like `"integer | default=3"`, `"[]string"` or
//! `"map[string]Port"`; nested mappings become objects; names not in the
//! builtin set resolve against the user's `types` section.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    JSON, JSONSchemaProps, JSONSchemaPropsOrArray, JSONSchemaPropsOrBool,
};
use serde_json::Value;

/// Error is the set of failures schema transformation can report.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// UnknownType indicates a descriptor naming neither a builtin nor a
    /// declared custom type.
    #[error("unknown type {0:?}")]
    UnknownType(String),
    /// MalformedModifier indicates a `key=value` modifier that did not parse.
    #[error("malformed modifier {modifier:?} on type {type_:?}")]
    MalformedModifier {
        /// The modifier text as written.
        modifier: String,
        /// The descriptor it was attached to.
        type_: String,
    },
    /// CyclicTypeAlias indicates custom types that resolve through
    /// themselves.
    #[error("cyclic type alias: {}", .0.join(" -> "))]
    CyclicTypeAlias(Vec<String>),
    /// MalformedDefinition indicates a leaf that is neither a descriptor
    /// string nor a nested mapping.
    #[error("field {field:?}: definition must be a string or mapping")]
    MalformedDefinition {
        /// The offending field.
        field: String,
    },
}

/// Result typedef for schema transformation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Transform converts `definition` (a nested mapping of descriptors) into an
/// OpenAPI object schema, resolving custom types against `types`.
pub fn transform(definition: &Value, types: Option<&Value>) -> Result<JSONSchemaProps> {
    let registry = types
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v)).collect())
        .unwrap_or_default();
    let mut stack = Vec::new();
    object_schema(definition, &registry, &mut stack)
}

type Registry<'a> = BTreeMap<String, &'a Value>;

fn object_schema(
    definition: &Value,
    types: &Registry<'_>,
    stack: &mut Vec<String>,
) -> Result<JSONSchemaProps> {
    let fields = match definition.as_object() {
        Some(m) => m,
        None => {
            return Err(Error::MalformedDefinition {
                field: definition.to_string(),
            })
        }
    };
    let mut properties = BTreeMap::new();
    let mut required = Vec::new();
    for (name, value) in fields {
        let field = match value {
            Value::String(descriptor) => {
                let parsed = field_schema(descriptor, types, stack)?;
                if parsed.required {
                    required.push(name.clone());
                }
                parsed.schema
            }
            Value::Object(_) => object_schema(value, types, stack)?,
            _ => return Err(Error::MalformedDefinition { field: name.clone() }),
        };
        properties.insert(name.clone(), field);
    }
    required.sort();
    Ok(JSONSchemaProps {
        type_: Some("object".to_string()),
        properties: if properties.is_empty() {
            None
        } else {
            Some(properties)
        },
        required: if required.is_empty() {
            None
        } else {
            Some(required)
        },
        ..Default::default()
    })
}

struct ParsedField {
    schema: JSONSchemaProps,
    required: bool,
}

fn field_schema(
    descriptor: &str,
    types: &Registry<'_>,
    stack: &mut Vec<String>,
) -> Result<ParsedField> {
    let mut parts = descriptor.splitn(2, '|');
    let base = parts.next().unwrap_or_default().trim();
    let mut schema = type_schema(base, types, stack)?;
    let mut required = false;

    if let Some(modifiers) = parts.next() {
        for modifier in modifiers.split_whitespace() {
            let (key, raw) = modifier.split_once('=').ok_or_else(|| Error::MalformedModifier {
                modifier: modifier.to_string(),
                type_: descriptor.to_string(),
            })?;
            let malformed = || Error::MalformedModifier {
                modifier: modifier.to_string(),
                type_: descriptor.to_string(),
            };
            match key {
                "required" => required = raw.parse().map_err(|_| malformed())?,
                "default" => schema.default = Some(JSON(default_value(base, raw, malformed)?)),
                "minimum" => schema.minimum = Some(raw.parse().map_err(|_| malformed())?),
                "maximum" => schema.maximum = Some(raw.parse().map_err(|_| malformed())?),
                "enum" => {
                    schema.enum_ = Some(
                        raw.split(',')
                            .map(|v| JSON(Value::String(v.trim().to_string())))
                            .collect(),
                    )
                }
                _ => return Err(malformed()),
            }
        }
    }

    Ok(ParsedField { schema, required })
}

fn default_value(
    base: &str,
    raw: &str,
    malformed: impl Fn() -> Error,
) -> Result<Value> {
    let raw = raw.trim_matches('"');
    Ok(match base {
        "integer" => Value::from(raw.parse::<i64>().map_err(|_| malformed())?),
        "number" => Value::from(raw.parse::<f64>().map_err(|_| malformed())?),
        "boolean" => Value::from(raw.parse::<bool>().map_err(|_| malformed())?),
        _ => Value::String(raw.to_string()),
    })
}

fn type_schema(
    base: &str,
    types: &Registry<'_>,
    stack: &mut Vec<String>,
) -> Result<JSONSchemaProps> {
    match base {
        "string" | "integer" | "number" | "boolean" => Ok(JSONSchemaProps {
            type_: Some(base.to_string()),
            ..Default::default()
        }),
        "object" => Ok(JSONSchemaProps {
            type_: Some("object".to_string()),
            x_kubernetes_preserve_unknown_fields: Some(true),
            ..Default::default()
        }),
        _ if base.starts_with("[]") => {
            let items = type_schema(&base[2..], types, stack)?;
            Ok(JSONSchemaProps {
                type_: Some("array".to_string()),
                items: Some(JSONSchemaPropsOrArray::Schema(Box::new(items))),
                ..Default::default()
            })
        }
        _ if base.starts_with("map[string]") => {
            let values = type_schema(&base["map[string]".len()..], types, stack)?;
            Ok(JSONSchemaProps {
                type_: Some("object".to_string()),
                additional_properties: Some(JSONSchemaPropsOrBool::Schema(Box::new(values))),
                ..Default::default()
            })
        }
        _ => {
            let definition = types
                .get(base)
                .copied()
                .ok_or_else(|| Error::UnknownType(base.to_string()))?;
            if stack.iter().any(|seen| seen == base) {
                let mut path = stack.clone();
                path.push(base.to_string());
                return Err(Error::CyclicTypeAlias(path));
            }
            stack.push(base.to_string());
            let schema = match definition {
                Value::String(descriptor) => field_schema(descriptor, types, stack)?.schema,
                _ => object_schema(definition, types, stack)?,
            };
            stack.pop();
            Ok(schema)
        }
    }
}
