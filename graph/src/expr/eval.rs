//! Eval wraps the expression interpreter: compile, evaluate against JSON
//! variables, and convert values back to JSON.

use std::collections::HashMap;

use cel_interpreter::objects::{Key, Map};
use cel_interpreter::{Context, Program, Value as CelValue};
use serde_json::{Number, Value};

use super::{Error, Result};

/// Compile checks that `expression` is a valid program.
pub fn compile(expression: &str) -> Result<Program> {
    Program::compile(expression).map_err(|err| Error::Parse {
        expression: expression.to_string(),
        detail: err.to_string(),
    })
}

/// Parse_ast returns the expression's AST for inspection.
pub fn parse_ast(expression: &str) -> Result<cel_parser::Expression> {
    cel_parser::parse(expression).map_err(|err| Error::Parse {
        expression: expression.to_string(),
        detail: err.to_string(),
    })
}

/// Evaluate runs `expression` with the given root variables.
pub fn evaluate(expression: &str, vars: &HashMap<String, Value>) -> Result<Value> {
    let program = compile(expression)?;
    let mut context = Context::default();
    for (name, value) in vars {
        context.add_variable_from_value(name.clone(), json_to_cel(value));
    }
    let value = program.execute(&context).map_err(|err| Error::Eval {
        expression: expression.to_string(),
        detail: err.to_string(),
    })?;
    cel_to_json(value, expression)
}

/// Evaluate_bool runs a gate expression; anything but a boolean is an error.
pub fn evaluate_bool(expression: &str, vars: &HashMap<String, Value>) -> Result<bool> {
    match evaluate(expression, vars)? {
        Value::Bool(b) => Ok(b),
        other => Err(Error::NonBoolean {
            expression: expression.to_string(),
            got: type_name(&other).to_string(),
        }),
    }
}

/// Evaluate_all resolves one field's expressions.
///
/// A standalone field keeps the native type of its single expression; a
/// mixed field concatenates every part into a string.
pub fn evaluate_all(
    expressions: &[String],
    standalone: bool,
    template: &str,
    vars: &HashMap<String, Value>,
) -> Result<Value> {
    if standalone {
        let expression = expressions.first().expect("standalone field has an expression");
        return evaluate(expression, vars);
    }
    let mut out = String::new();
    let mut rest = template;
    for expression in expressions {
        let marker = format!("${{{expression}}}");
        let (before, after) = rest
            .split_once(&marker)
            .expect("expression came from this template");
        out.push_str(before);
        let value = evaluate(expression, vars)?;
        out.push_str(&coerce_string(&value, expression)?);
        rest = after;
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Coerce_string renders a scalar for concatenation into a mixed field.
pub fn coerce_string(value: &Value, expression: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::NotStringCoercible {
            expression: expression.to_string(),
            got: type_name(other).to_string(),
        }),
    }
}

/// Type_name names a JSON value's type the way error messages want it.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) => {
            if n.is_f64() {
                "number"
            } else {
                "integer"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn json_to_cel(value: &Value) -> CelValue {
    match value {
        Value::Null => CelValue::Null,
        Value::Bool(b) => CelValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                CelValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                CelValue::UInt(u)
            } else {
                CelValue::Float(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => CelValue::String(s.clone().into()),
        Value::Array(items) => {
            CelValue::List(items.iter().map(json_to_cel).collect::<Vec<_>>().into())
        }
        Value::Object(map) => {
            let entries: HashMap<Key, CelValue> = map
                .iter()
                .map(|(k, v)| (Key::String(std::sync::Arc::new(k.clone())), json_to_cel(v)))
                .collect();
            CelValue::Map(Map {
                map: std::sync::Arc::new(entries),
            })
        }
    }
}

fn cel_to_json(value: CelValue, expression: &str) -> Result<Value> {
    let unsupported = |detail: String| Error::UnsupportedValue {
        expression: expression.to_string(),
        detail,
    };
    Ok(match value {
        CelValue::Null => Value::Null,
        CelValue::Bool(b) => Value::Bool(b),
        CelValue::Int(i) => Value::from(i),
        CelValue::UInt(u) => Value::from(u),
        CelValue::Float(f) => Value::Number(
            Number::from_f64(f).ok_or_else(|| unsupported(format!("non-finite number {f}")))?,
        ),
        CelValue::String(s) => Value::String(s.as_ref().clone()),
        CelValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| cel_to_json(item.clone(), expression))
                .collect::<Result<_>>()?,
        ),
        CelValue::Map(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map.map.iter() {
                let key = match key {
                    Key::String(s) => s.as_ref().clone(),
                    Key::Int(i) => i.to_string(),
                    Key::Uint(u) => u.to_string(),
                    Key::Bool(b) => b.to_string(),
                };
                out.insert(key, cel_to_json(item.clone(), expression)?);
            }
            Value::Object(out)
        }
        other => return Err(unsupported(format!("{other:?}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn evaluates_field_access() {
        let vars = vars(&[(
            "vpc",
            json!({"status": {"vpcID": "vpc-123", "cidrs": ["10.0.0.0/8"]}}),
        )]);
        assert_eq!(
            evaluate("vpc.status.vpcID", &vars).unwrap(),
            json!("vpc-123")
        );
        assert_eq!(
            evaluate("vpc.status.cidrs[0]", &vars).unwrap(),
            json!("10.0.0.0/8")
        );
    }

    #[test]
    fn evaluates_operators_and_ternary() {
        let vars = vars(&[("schema", json!({"spec": {"replicas": 3}}))]);
        assert_eq!(
            evaluate("schema.spec.replicas * 2 + 1", &vars).unwrap(),
            json!(7)
        );
        assert_eq!(
            evaluate("schema.spec.replicas > 2 ? \"big\" : \"small\"", &vars).unwrap(),
            json!("big")
        );
        assert!(evaluate_bool("schema.spec.replicas == 3", &vars).unwrap());
    }

    #[test]
    fn evaluates_comprehensions() {
        let vars = vars(&[("order", json!({"items": [1, 2, 3, 4]}))]);
        assert_eq!(
            evaluate("order.items.filter(v, v > 2)", &vars).unwrap(),
            json!([3, 4])
        );
        assert_eq!(
            evaluate("order.items.map(v, v * 10)", &vars).unwrap(),
            json!([10, 20, 30, 40])
        );
    }

    #[test]
    fn gate_must_be_boolean() {
        let vars = vars(&[("schema", json!({"spec": {"name": "x"}}))]);
        assert!(matches!(
            evaluate_bool("schema.spec.name", &vars),
            Err(Error::NonBoolean { .. })
        ));
    }

    #[test]
    fn mixed_fields_concatenate() {
        let vars = vars(&[("schema", json!({"spec": {"name": "shop", "replicas": 2}}))]);
        let got = evaluate_all(
            &["schema.spec.name".into(), "schema.spec.replicas".into()],
            false,
            "${schema.spec.name}-size-${schema.spec.replicas}",
            &vars,
        )
        .unwrap();
        assert_eq!(got, json!("shop-size-2"));
    }

    #[test]
    fn standalone_fields_keep_native_types() {
        let vars = vars(&[("deployment", json!({"status": {"availableReplicas": 3}}))]);
        let got = evaluate_all(
            &["deployment.status.availableReplicas".into()],
            true,
            "${deployment.status.availableReplicas}",
            &vars,
        )
        .unwrap();
        assert_eq!(got, json!(3));
    }

    #[test]
    fn objects_round_trip() {
        let vars = vars(&[("svc", json!({"metadata": {"labels": {"a": "1"}}}))]);
        assert_eq!(
            evaluate("svc.metadata.labels", &vars).unwrap(),
            json!({"a": "1"})
        );
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(matches!(compile("a +"), Err(Error::Parse { .. })));
    }
}
