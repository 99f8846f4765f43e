//! Infer builds the status schema of a synthesized kind from the values its
//! status expressions produced during the dry run.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    JSONSchemaProps, JSONSchemaPropsOrArray,
};
use serde_json::Value;

use crate::fieldpath::{self, Segment};

/// Error is the set of inference failures.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// InvalidEvaluationTypes indicates a multi-expression field whose parts
    /// are not all strings.
    #[error("field {path:?}: multiple expressions must all evaluate to strings, got {got}")]
    InvalidEvaluationTypes {
        /// The status field path.
        path: String,
        /// A description of the offending value's type.
        got: String,
    },
    /// UnsupportedValue indicates a value with no schema representation.
    #[error("field {path:?}: cannot infer a schema from a null value")]
    UnsupportedValue {
        /// The status field path.
        path: String,
    },
    /// BadPath indicates a status field path that did not parse.
    #[error("bad status field path: {0}")]
    BadPath(#[from] fieldpath::Error),
}

/// Result typedef for inference.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Infer_status_schema turns `{field path → evaluated values}` into an
/// OpenAPI object schema.
///
/// Paths with one value take that value's type; paths with several values
/// are string concatenations and must be all-string.
pub fn infer_status_schema(values: &BTreeMap<String, Vec<Value>>) -> Result<JSONSchemaProps> {
    let mut root = object_container();
    for (path, evaluated) in values {
        let leaf = leaf_schema(path, evaluated)?;
        let segments = fieldpath::parse(path)?;
        insert(&mut root, &segments, leaf, path)?;
    }
    Ok(root)
}

fn leaf_schema(path: &str, evaluated: &[Value]) -> Result<JSONSchemaProps> {
    match evaluated {
        [] => Err(Error::UnsupportedValue {
            path: path.to_string(),
        }),
        [single] => value_schema(single, path),
        many => {
            for value in many {
                if !value.is_string() {
                    return Err(Error::InvalidEvaluationTypes {
                        path: path.to_string(),
                        got: crate::expr::eval::type_name(value).to_string(),
                    });
                }
            }
            Ok(typed("string"))
        }
    }
}

fn value_schema(value: &Value, path: &str) -> Result<JSONSchemaProps> {
    Ok(match value {
        Value::Bool(_) => typed("boolean"),
        Value::String(_) => typed("string"),
        Value::Number(n) => {
            if n.is_f64() {
                typed("number")
            } else {
                typed("integer")
            }
        }
        Value::Array(items) => {
            let item_schema = match items.first() {
                Some(first) => value_schema(first, path)?,
                None => JSONSchemaProps {
                    x_kubernetes_preserve_unknown_fields: Some(true),
                    ..Default::default()
                },
            };
            JSONSchemaProps {
                type_: Some("array".to_string()),
                items: Some(JSONSchemaPropsOrArray::Schema(Box::new(item_schema))),
                ..Default::default()
            }
        }
        Value::Object(map) => {
            let mut properties = BTreeMap::new();
            for (key, item) in map {
                properties.insert(key.clone(), value_schema(item, path)?);
            }
            JSONSchemaProps {
                type_: Some("object".to_string()),
                properties: if properties.is_empty() {
                    None
                } else {
                    Some(properties)
                },
                ..Default::default()
            }
        }
        Value::Null => {
            return Err(Error::UnsupportedValue {
                path: path.to_string(),
            })
        }
    })
}

// Insert threads `leaf` into `root`, creating the object and array
// containers the path syntax implies.
fn insert(
    root: &mut JSONSchemaProps,
    segments: &[Segment],
    leaf: JSONSchemaProps,
    path: &str,
) -> Result<()> {
    let mut cur = root;
    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        match segment {
            Segment::Field(name) | Segment::Key(name) => {
                if cur.type_.as_deref() != Some("object") {
                    *cur = object_container();
                }
                let properties = cur.properties.get_or_insert_with(BTreeMap::new);
                let entry = properties
                    .entry(name.clone())
                    .or_insert_with(object_container);
                if last {
                    *entry = leaf;
                    return Ok(());
                }
                cur = entry;
            }
            Segment::Index(_) => {
                if cur.type_.as_deref() != Some("array") {
                    *cur = JSONSchemaProps {
                        type_: Some("array".to_string()),
                        items: Some(JSONSchemaPropsOrArray::Schema(Box::new(
                            object_container(),
                        ))),
                        ..Default::default()
                    };
                }
                let items = match cur.items.as_mut() {
                    Some(JSONSchemaPropsOrArray::Schema(items)) => items.as_mut(),
                    _ => {
                        return Err(Error::UnsupportedValue {
                            path: path.to_string(),
                        })
                    }
                };
                if last {
                    *items = leaf;
                    return Ok(());
                }
                cur = items;
            }
        }
    }
    Ok(())
}

fn object_container() -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some("object".to_string()),
        ..Default::default()
    }
}

fn typed(name: &str) -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some(name.to_string()),
        ..Default::default()
    }
}
