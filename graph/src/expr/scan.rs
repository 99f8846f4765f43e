//! Scan isolates `${…}` occurrences in nested data.
//!
//! The scanner does not compile anything: it walks a JSON tree, finds the
//! string leaves carrying expressions, and reports each with its field path.

use serde_json::Value;

use super::{Error, Result};
use crate::fieldpath::{self, Segment};

/// ScannedField is one string leaf carrying at least one expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedField {
    /// Path of the leaf inside the scanned tree.
    pub path: String,
    /// The inner expression sources, left to right, `${`/`}` stripped.
    pub expressions: Vec<String>,
    /// True when the leaf is exactly one expression with nothing around it,
    /// so the substituted value keeps its native type.
    pub standalone: bool,
}

/// Scan walks `value` and returns a field per expression-bearing string
/// leaf. Non-string leaves never produce fields.
pub fn scan(value: &Value) -> Result<Vec<ScannedField>> {
    let mut fields = Vec::new();
    let mut segments = Vec::new();
    walk(value, &mut segments, &mut fields)?;
    Ok(fields)
}

fn walk(
    value: &Value,
    segments: &mut Vec<Segment>,
    fields: &mut Vec<ScannedField>,
) -> Result<()> {
    match value {
        Value::String(s) => {
            let (expressions, standalone) = extract_expressions(s)?;
            if !expressions.is_empty() {
                fields.push(ScannedField {
                    path: fieldpath::format(segments),
                    expressions,
                    standalone,
                });
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                segments.push(Segment::Index(i));
                walk(item, segments, fields)?;
                segments.pop();
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                segments.push(key_segment(key));
                walk(item, segments, fields)?;
                segments.pop();
            }
        }
        _ => {}
    }
    Ok(())
}

// Keys that would not re-parse as identifiers are rendered quoted.
fn key_segment(key: &str) -> Segment {
    let plain = !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if plain {
        Segment::Field(key.to_string())
    } else {
        Segment::Key(key.to_string())
    }
}

/// Extract_expressions returns the `${…}` bodies of `input` in order, and
/// whether the whole string is a single standalone expression.
///
/// Braces inside quoted strings within an expression do not count toward
/// balancing.
pub fn extract_expressions(input: &str) -> Result<(Vec<String>, bool)> {
    let bytes = input.as_bytes();
    let mut expressions = Vec::new();
    let mut spans = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        if bytes[pos] == b'$' && pos + 1 < bytes.len() && bytes[pos + 1] == b'{' {
            let start = pos;
            let mut depth = 1usize;
            let mut quote: Option<u8> = None;
            let mut i = pos + 2;
            while i < bytes.len() {
                let b = bytes[i];
                match quote {
                    Some(q) => {
                        if b == b'\\' {
                            i += 1;
                        } else if b == q {
                            quote = None;
                        }
                    }
                    None => match b {
                        b'"' | b'\'' => quote = Some(b),
                        b'{' => depth += 1,
                        b'}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    },
                }
                i += 1;
            }
            if depth != 0 {
                return Err(Error::UnterminatedExpression {
                    input: input.to_string(),
                });
            }
            expressions.push(input[start + 2..i].to_string());
            spans.push((start, i + 1));
            pos = i + 1;
        } else {
            pos += 1;
        }
    }

    let standalone =
        expressions.len() == 1 && spans[0].0 == 0 && spans[0].1 == input.len();
    Ok((expressions, standalone))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn standalone_and_mixed() {
        let (exprs, standalone) = extract_expressions("${vpc.status.vpcID}").unwrap();
        assert_eq!(exprs, vec!["vpc.status.vpcID"]);
        assert!(standalone);

        let (exprs, standalone) =
            extract_expressions("prefix-${schema.spec.name}-${schema.spec.env}").unwrap();
        assert_eq!(exprs, vec!["schema.spec.name", "schema.spec.env"]);
        assert!(!standalone);

        let (exprs, standalone) = extract_expressions("no expressions here").unwrap();
        assert!(exprs.is_empty());
        assert!(!standalone);
    }

    #[test]
    fn nested_braces_and_quotes() {
        let (exprs, standalone) =
            extract_expressions(r#"${ {"a": 1}.a == 1 ? "y}" : "n" }"#).unwrap();
        assert_eq!(exprs, vec![r#" {"a": 1}.a == 1 ? "y}" : "n" "#]);
        assert!(standalone);
    }

    #[test]
    fn unterminated_is_rejected() {
        assert!(matches!(
            extract_expressions("${a.b"),
            Err(Error::UnterminatedExpression { .. })
        ));
    }

    #[test]
    fn scan_reports_paths() {
        let doc = json!({
            "apiVersion": "v1",
            "metadata": { "name": "${schema.spec.name}" },
            "spec": {
                "replicas": 3,
                "subnetIDs": ["${subnet.status.subnetID}"],
                "labels": { "kro.run/app": "${schema.spec.name}-app" },
            },
        });
        let mut fields = scan(&doc).unwrap();
        fields.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(
            fields,
            vec![
                ScannedField {
                    path: "metadata.name".into(),
                    expressions: vec!["schema.spec.name".into()],
                    standalone: true,
                },
                ScannedField {
                    path: "spec.labels[\"kro.run/app\"]".into(),
                    expressions: vec!["schema.spec.name".into()],
                    standalone: false,
                },
                ScannedField {
                    path: "spec.subnetIDs[0]".into(),
                    expressions: vec!["subnet.status.subnetID".into()],
                    standalone: true,
                },
            ]
        );
    }

    #[test]
    fn non_string_leaves_are_inert() {
        let fields = scan(&json!({"a": 1, "b": true, "c": null})).unwrap();
        assert!(fields.is_empty());
    }
}
