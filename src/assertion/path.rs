//! Dotted path resolution over JSON value trees
//!
//! Paths are `.`-separated segments. A segment that is a canonical
//! non-negative integer indexes into arrays; against an object every segment
//! is a plain key. Shape mismatches resolve to "not found", never to an error.

use std::fmt;

use serde_json::Value;

/// One step of a [`JsonPath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object key
    Key(String),
    /// Array index, also usable as an object key
    Index(usize),
}

impl Segment {
    fn parse(text: &str) -> Self {
        // "007" stays a key so that rendering the segment gives back the input.
        let canonical = text == "0" || !text.starts_with('0');
        if canonical && text.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = text.parse::<usize>() {
                return Self::Index(index);
            }
        }
        Self::Key(text.to_string())
    }

    fn step<'a>(&self, node: &'a Value) -> Option<&'a Value> {
        match (self, node) {
            (Self::Key(key), Value::Object(map)) => map.get(key),
            (Self::Index(index), Value::Object(map)) => map.get(&index.to_string()),
            (Self::Index(index), Value::Array(items)) => items.get(*index),
            _ => None,
        }
    }
}

/// A pre-split path expression such as `payload.commits.0.id`.
///
/// Construction never fails; a path that is empty or contains an empty
/// segment (leading, trailing or doubled dots) simply never resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Option<Vec<Segment>>,
}

impl JsonPath {
    /// Split a path expression into segments.
    ///
    /// # Examples
    ///
    /// ```
    /// use gh_pulse::assertion::path::JsonPath;
    /// use serde_json::json;
    ///
    /// let path = JsonPath::new("pull_request.labels.1.name");
    /// let doc = json!({"pull_request": {"labels": [{"name": "a"}, {"name": "b"}]}});
    /// assert_eq!(path.resolve(&doc), Some(&json!("b")));
    /// ```
    pub fn new(raw: &str) -> Self {
        let segments = if raw.is_empty() || raw.split('.').any(str::is_empty) {
            None
        } else {
            Some(raw.split('.').map(Segment::parse).collect())
        };
        Self {
            raw: raw.to_string(),
            segments,
        }
    }

    /// The path as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The parsed segments, or `None` if the path can never resolve.
    pub fn segments(&self) -> Option<&[Segment]> {
        self.segments.as_deref()
    }

    /// Walk `root` along this path.
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments
            .as_ref()?
            .iter()
            .try_fold(root, |node, segment| segment.step(node))
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Resolve `path` against `root` in one call.
pub fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    JsonPath::new(path).resolve(root)
}

/// Render a scalar the way assertions compare it.
///
/// Strings render as-is, booleans as `true`/`false`, numbers with their
/// literal text, and `null` as `"null"`. Objects and arrays are not scalars
/// and return `None`.
pub fn stringify_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some("null".to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}
