//! Fieldpath parses and renders dotted field paths with bracketed indices
//! and quoted map keys, e.g. `a.b[0]["x.y"].c`.
//!
//! The encoder is the inverse of the parser: `format(&parse(p)?) == p` for
//! any valid path.

use serde_json::Value;

/// Error is the set of parse failures.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// UnterminatedQuote indicates a quoted key with no closing quote.
    #[error("unterminated quote in path at byte {0}")]
    UnterminatedQuote(usize),
    /// InvalidIndex indicates a bracketed index that is not a non-negative
    /// integer.
    #[error("invalid index {0:?} in path")]
    InvalidIndex(String),
    /// MissingClose indicates a bracket expression without a closing `]`.
    #[error("missing closing bracket at byte {0}")]
    MissingClose(usize),
    /// UnbalancedBracket indicates a stray `]` or an empty segment.
    #[error("unbalanced bracket or empty segment at byte {0}")]
    UnbalancedBracket(usize),
}

/// Result typedef for path operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Segment is one step of a field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// A bare identifier, `a` in `a.b`.
    Field(String),
    /// An array index, `[0]`.
    Index(usize),
    /// A quoted map key, `["x.y"]`.
    Key(String),
}

/// Parse splits `path` into segments.
pub fn parse(path: &str) -> Result<Vec<Segment>> {
    let bytes = path.as_bytes();
    let mut segments = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        match bytes[pos] {
            b'.' => {
                if segments.is_empty() {
                    return Err(Error::UnbalancedBracket(pos));
                }
                pos += 1;
                let (seg, next) = parse_identifier(path, pos)?;
                segments.push(Segment::Field(seg));
                pos = next;
            }
            b'[' => {
                if segments.is_empty() {
                    return Err(Error::UnbalancedBracket(pos));
                }
                let (seg, next) = parse_bracket(path, pos + 1)?;
                segments.push(seg);
                pos = next;
            }
            b']' => return Err(Error::UnbalancedBracket(pos)),
            _ => {
                if !segments.is_empty() {
                    return Err(Error::UnbalancedBracket(pos));
                }
                let (seg, next) = parse_identifier(path, pos)?;
                segments.push(Segment::Field(seg));
                pos = next;
            }
        }
    }

    if segments.is_empty() {
        return Err(Error::UnbalancedBracket(0));
    }
    Ok(segments)
}

fn parse_identifier(path: &str, start: usize) -> Result<(String, usize)> {
    let bytes = path.as_bytes();
    let mut end = start;
    while end < bytes.len() {
        match bytes[end] {
            b'.' | b'[' | b']' => break,
            _ => end += 1,
        }
    }
    if end == start {
        return Err(Error::UnbalancedBracket(start));
    }
    Ok((path[start..end].to_string(), end))
}

fn parse_bracket(path: &str, start: usize) -> Result<(Segment, usize)> {
    let bytes = path.as_bytes();
    if start >= bytes.len() {
        return Err(Error::MissingClose(start));
    }
    if bytes[start] == b'"' {
        // Quoted map key; backslash escapes the quote and itself.
        let mut key = String::new();
        let mut pos = start + 1;
        loop {
            if pos >= bytes.len() {
                return Err(Error::UnterminatedQuote(start));
            }
            match bytes[pos] {
                b'"' => break,
                b'\\' => {
                    pos += 1;
                    if pos >= bytes.len() {
                        return Err(Error::UnterminatedQuote(start));
                    }
                    key.push(bytes[pos] as char);
                    pos += 1;
                }
                _ => {
                    // Multi-byte characters pass through untouched.
                    let ch = path[pos..].chars().next().expect("in bounds");
                    key.push(ch);
                    pos += ch.len_utf8();
                }
            }
        }
        let close = pos + 1;
        if close >= bytes.len() || bytes[close] != b']' {
            return Err(Error::MissingClose(close));
        }
        Ok((Segment::Key(key), close + 1))
    } else {
        let mut end = start;
        while end < bytes.len() && bytes[end] != b']' {
            end += 1;
        }
        if end >= bytes.len() {
            return Err(Error::MissingClose(start));
        }
        let raw = &path[start..end];
        let index: usize = raw
            .parse()
            .map_err(|_| Error::InvalidIndex(raw.to_string()))?;
        Ok((Segment::Index(index), end + 1))
    }
}

/// Format renders segments back to the path syntax.
pub fn format(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Field(name) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(name);
            }
            Segment::Index(i) => {
                out.push('[');
                out.push_str(&i.to_string());
                out.push(']');
            }
            Segment::Key(key) => {
                out.push_str("[\"");
                for ch in key.chars() {
                    if ch == '"' || ch == '\\' {
                        out.push('\\');
                    }
                    out.push(ch);
                }
                out.push_str("\"]");
            }
        }
    }
    out
}

/// Get walks `value` along `segments`, if every step exists.
pub fn get<'a>(value: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut cur = value;
    for segment in segments {
        cur = match segment {
            Segment::Field(name) | Segment::Key(name) => cur.get(name.as_str())?,
            Segment::Index(i) => cur.get(i)?,
        };
    }
    Some(cur)
}

/// Set writes `new` into `value` at `segments`, creating intermediate
/// objects and arrays as implied by the path.
pub fn set(value: &mut Value, segments: &[Segment], new: Value) {
    let mut cur = value;
    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        match segment {
            Segment::Field(name) | Segment::Key(name) => {
                if !cur.is_object() {
                    *cur = Value::Object(Default::default());
                }
                let map = cur.as_object_mut().expect("made object above");
                if last {
                    map.insert(name.clone(), new);
                    return;
                }
                cur = map.entry(name.clone()).or_insert(Value::Null);
            }
            Segment::Index(idx) => {
                if !cur.is_array() {
                    *cur = Value::Array(Vec::new());
                }
                let arr = cur.as_array_mut().expect("made array above");
                while arr.len() <= *idx {
                    arr.push(Value::Null);
                }
                if last {
                    arr[*idx] = new;
                    return;
                }
                cur = &mut arr[*idx];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips() {
        for path in [
            "a",
            "a.b.c",
            "a[0]",
            "a.b[3].c",
            "a[\"x.y\"].c",
            "items[0][1]",
            "a[\"0leading\"]",
            "a[\"with \\\"quote\\\"\"]",
        ] {
            let segments = parse(path).unwrap();
            assert_eq!(format(&segments), path, "path {path:?}");
        }
    }

    #[test]
    fn parses_mixed_segments() {
        assert_eq!(
            parse("spec.containers[0][\"image.tag\"]").unwrap(),
            vec![
                Segment::Field("spec".into()),
                Segment::Field("containers".into()),
                Segment::Index(0),
                Segment::Key("image.tag".into()),
            ]
        );
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(matches!(parse("a[\"x"), Err(Error::UnterminatedQuote(_))));
        assert!(matches!(parse("a[\"x\""), Err(Error::MissingClose(_))));
        assert_eq!(parse("a[x]").unwrap_err(), Error::InvalidIndex("x".into()));
        assert_eq!(parse("a[-1]").unwrap_err(), Error::InvalidIndex("-1".into()));
        assert!(matches!(parse("a[1"), Err(Error::MissingClose(_))));
        assert!(matches!(parse("a]"), Err(Error::UnbalancedBracket(_))));
        assert!(matches!(parse(""), Err(Error::UnbalancedBracket(_))));
        assert!(matches!(parse(".a"), Err(Error::UnbalancedBracket(_))));
        assert!(matches!(parse("a..b"), Err(Error::UnbalancedBracket(_))));
    }

    #[test]
    fn get_and_set_walk_containers() {
        let mut doc = json!({"spec": {"items": [{"name": "a"}]}});
        let path = parse("spec.items[0].name").unwrap();
        assert_eq!(get(&doc, &path), Some(&json!("a")));

        set(&mut doc, &parse("spec.items[2].name").unwrap(), json!("c"));
        assert_eq!(
            doc["spec"]["items"],
            json!([{"name": "a"}, null, {"name": "c"}])
        );

        let mut fresh = Value::Null;
        set(&mut fresh, &parse("a.b[0]").unwrap(), json!(7));
        assert_eq!(fresh, json!({"a": {"b": [7]}}));
    }
}
