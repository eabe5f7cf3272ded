//! Helpers for working with JSON documents: dotted paths, predicate
//! matching, projections and version diffs.
//!
//! Paths address nested values with dots, e.g. `"a.b.c"`. Array elements
//! are addressed by their decimal index and the special segment `+`
//! appends to (or creates) an array.

use serde_json::{Map, Value};

use crate::error::{CResult, Error};

/// Splits a `key.path` string into the object key and the path inside the
/// document. The path is empty when the whole document is addressed.
pub fn split_path(full: &str) -> (&str, &str) {
    match full.find('.') {
        Some(pos) => (&full[..pos], &full[pos + 1..]),
        None => (full, ""),
    }
}

/// Looks up the value at `path`, or the document itself for an empty path.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(doc);
    }

    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Inserts `value` at `path`, creating intermediate objects as needed and
/// replacing whatever was there before. A trailing `+` segment appends to
/// the array at the parent path, creating the array if necessary.
pub fn insert_path(doc: &mut Value, path: &str, value: Value) -> CResult<()> {
    if path.is_empty() {
        *doc = value;
        return Ok(());
    }

    let mut current = doc;
    let segments: Vec<&str> = path.split('.').collect();

    for (pos, segment) in segments.iter().enumerate() {
        let last = pos + 1 == segments.len();
        let step = current;

        if *segment == "+" {
            if !last {
                return Err(Error::InvalidArgument(format!(
                    "append segment must be last in path '{}'",
                    path
                )));
            }

            if step.is_null() {
                *step = Value::Array(vec![]);
            }

            return match step {
                Value::Array(items) => {
                    items.push(value);
                    Ok(())
                }
                _ => Err(Error::InvalidArgument(format!(
                    "cannot append: '{}' is not an array",
                    path
                ))),
            };
        }

        current = match step {
            Value::Object(map) => {
                if last {
                    map.insert(segment.to_string(), value);
                    return Ok(());
                }

                // Descend, creating an object or array for the next segment.
                let next = segments[pos + 1];
                map.entry(segment.to_string()).or_insert_with(|| {
                    if next == "+" {
                        Value::Array(vec![])
                    } else {
                        Value::Object(Map::new())
                    }
                })
            }
            Value::Array(items) => {
                let idx = segment.parse::<usize>().map_err(|_| {
                    Error::InvalidArgument(format!("invalid array index '{}'", segment))
                })?;
                let slot = items.get_mut(idx).ok_or_else(|| {
                    Error::InvalidArgument(format!("array index {} out of bounds", idx))
                })?;
                if last {
                    *slot = value;
                    return Ok(());
                }
                slot
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "cannot descend into {} at '{}'",
                    type_name(other),
                    segment
                )))
            }
        };
    }

    Ok(())
}

/// Adds `delta` to the value at `path`: numbers are summed, arrays are
/// appended to, and missing values behave like an insert.
pub fn add_path(doc: &mut Value, path: &str, delta: Value) -> CResult<()> {
    let existing = get_path(doc, path).cloned();

    match existing {
        Some(Value::Number(a)) => {
            let b = match &delta {
                Value::Number(n) => n.clone(),
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "cannot add {} to a number",
                        type_name(other)
                    )))
                }
            };

            let sum = if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                Value::from(x + y)
            } else {
                let x = a.as_f64().unwrap_or(0.0);
                let y = b.as_f64().unwrap_or(0.0);
                serde_json::Number::from_f64(x + y).map(Value::Number).unwrap_or(Value::Null)
            };

            insert_path(doc, path, sum)
        }
        Some(Value::Array(mut items)) => {
            items.push(delta);
            insert_path(doc, path, Value::Array(items))
        }
        Some(_) | None => insert_path(doc, path, delta),
    }
}

/// Does `value` satisfy a single predicate? The predicate is either an
/// operator document (`{"$lte": 5}`, `{"$in": [..]}`) or a literal that
/// must compare equal.
pub fn matches_value(value: &Value, predicate: &Value) -> bool {
    match predicate {
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => {
            map.iter().all(|(op, arg)| match op.as_str() {
                "$eq" => value == arg,
                "$ne" => value != arg,
                "$in" => match arg {
                    Value::Array(options) => options.iter().any(|o| o == value),
                    _ => false,
                },
                "$lt" => compare(value, arg) == Some(std::cmp::Ordering::Less),
                "$lte" => {
                    matches!(compare(value, arg),
                        Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal))
                }
                "$gt" => compare(value, arg) == Some(std::cmp::Ordering::Greater),
                "$gte" => {
                    matches!(compare(value, arg),
                        Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal))
                }
                _ => false,
            })
        }
        other => value == other,
    }
}

/// Does the document satisfy all predicates? Top-level keys are paths into
/// the document unless the whole predicate is an operator document, in
/// which case it applies to the document itself. An empty predicate
/// matches everything.
pub fn matches_predicates(doc: &Value, predicates: &Value) -> bool {
    match predicates {
        Value::Null => true,
        Value::Object(map) if map.is_empty() => true,
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => {
            matches_value(doc, predicates)
        }
        Value::Object(map) => map.iter().all(|(path, pred)| match get_path(doc, path) {
            Some(value) => matches_value(value, pred),
            None => false,
        }),
        other => doc == other,
    }
}

/// Restrict a document to the given paths. Paths missing from the document
/// are skipped.
pub fn project(doc: &Value, paths: &[String]) -> Value {
    if paths.is_empty() {
        return doc.clone();
    }

    let mut out = Value::Object(Map::new());
    for path in paths {
        if let Some(value) = get_path(doc, path) {
            // projection failures only drop the path
            let _ = insert_path(&mut out, path, value.clone());
        }
    }
    out
}

/// Compute the difference between two versions of a document as a list of
/// `{op, path, value}` records (`set` and `remove` ops).
pub fn diff(before: &Value, after: &Value) -> Value {
    let mut out = Vec::new();
    diff_inner(before, after, String::new(), &mut out);
    Value::Array(out)
}

fn diff_inner(before: &Value, after: &Value, path: String, out: &mut Vec<Value>) {
    match (before, after) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, old) in a {
                let sub = join_path(&path, k);
                match b.get(k) {
                    Some(new) => diff_inner(old, new, sub, out),
                    None => out.push(serde_json::json!({"op": "remove", "path": sub})),
                }
            }
            for (k, new) in b {
                if !a.contains_key(k) {
                    let sub = join_path(&path, k);
                    out.push(serde_json::json!({"op": "set", "path": sub, "value": new}));
                }
            }
        }
        (old, new) => {
            if old != new {
                out.push(serde_json::json!({"op": "set", "path": path, "value": new}));
            }
        }
    }
}

fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", prefix, segment)
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().and_then(|x| y.as_f64().map(|y| x.partial_cmp(&y)))?
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn split() {
        assert_eq!(split_path("foo"), ("foo", ""));
        assert_eq!(split_path("foo.a.b"), ("foo", "a.b"));
    }

    #[test]
    fn get_nested() {
        let doc = json!({"a": {"b": [1, 2, 3]}});
        assert_eq!(get_path(&doc, "a.b.1"), Some(&json!(2)));
        assert_eq!(get_path(&doc, ""), Some(&doc));
        assert_eq!(get_path(&doc, "a.c"), None);
    }

    #[test]
    fn insert_creates_nesting() {
        let mut doc = json!({});
        insert_path(&mut doc, "a.b", json!({})).unwrap();
        insert_path(&mut doc, "a.b.c", json!([1, 2])).unwrap();
        assert_eq!(doc, json!({"a": {"b": {"c": [1, 2]}}}));
    }

    #[test]
    fn insert_append() {
        let mut doc = json!({});
        insert_path(&mut doc, "xyz.+", json!(1)).unwrap();
        insert_path(&mut doc, "xyz.+", json!(2)).unwrap();
        assert_eq!(doc, json!({"xyz": [1, 2]}));
    }

    #[test]
    fn append_to_scalar_fails() {
        let mut doc = json!({"x": 5});
        assert!(insert_path(&mut doc, "x.+", json!(1)).is_err());
    }

    #[test]
    fn add_numbers_and_arrays() {
        let mut doc = json!({"n": 40, "l": [1]});
        add_path(&mut doc, "n", json!(2)).unwrap();
        add_path(&mut doc, "l", json!(2)).unwrap();
        add_path(&mut doc, "fresh", json!("x")).unwrap();
        assert_eq!(doc, json!({"n": 42, "l": [1, 2], "fresh": "x"}));
    }

    #[test]
    fn predicates() {
        let doc = json!({"a": 42, "b": 23, "s": "hi"});

        assert!(matches_predicates(&doc, &json!({})));
        assert!(matches_predicates(&doc, &json!({"a": 42})));
        assert!(!matches_predicates(&doc, &json!({"a": 41})));
        assert!(matches_predicates(&doc, &json!({"b": {"$in": [21, 22, 23]}})));
        assert!(!matches_predicates(&doc, &json!({"b": {"$in": [21, 22]}})));
        assert!(matches_predicates(&doc, &json!({"a": {"$gte": 42}})));
        assert!(!matches_predicates(&doc, &json!({"a": {"$lt": 42}})));
        assert!(!matches_predicates(&doc, &json!({"missing": 1})));
    }

    #[test]
    fn operator_predicate_against_value() {
        assert!(matches_predicates(&json!(5), &json!({"$lte": 5})));
        assert!(!matches_predicates(&json!(6), &json!({"$lte": 5})));
    }

    #[test]
    fn projection() {
        let doc = json!({"a": {"b": 1, "c": 2}, "d": 3});
        assert_eq!(project(&doc, &["a.b".into(), "d".into()]), json!({"a": {"b": 1}, "d": 3}));
    }

    #[test]
    fn diff_versions() {
        let v1 = json!({"a": 1, "b": {"c": 2}});
        let v2 = json!({"a": 1, "b": {"c": 3}, "d": 4});

        let d = diff(&v1, &v2);
        let entries = d.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.contains(&json!({"op": "set", "path": "b.c", "value": 3})));
        assert!(entries.contains(&json!({"op": "set", "path": "d", "value": 4})));
    }
}
