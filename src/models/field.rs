//! Extraction-tree data model.
//!
//! Every pipeline stage operates on the same nested value representation:
//! a tagged-variant tree of scalar, object, and array nodes addressed by
//! path. Tree shape varies per blueprint, so nothing in this module knows
//! concrete field names; traversal is always path-driven.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Scalar values
// ---------------------------------------------------------------------------

/// A typed leaf value as reported by the extraction engine.
///
/// Untagged on the wire: `true`, `42.5`, `"2024-01-15"` (date), `"text"`.
/// Variant order matters for deserialization; dates are tried before
/// free-form text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Boolean(bool),
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Boolean(b) => write!(f, "{b}"),
            ScalarValue::Number(n) => write!(f, "{n}"),
            ScalarValue::Date(d) => write!(f, "{d}"),
            ScalarValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(s: &str) -> Self {
        ScalarValue::Text(s.to_string())
    }
}

impl From<f64> for ScalarValue {
    fn from(n: f64) -> Self {
        ScalarValue::Number(n)
    }
}

impl From<bool> for ScalarValue {
    fn from(b: bool) -> Self {
        ScalarValue::Boolean(b)
    }
}

// ---------------------------------------------------------------------------
// Tree nodes
// ---------------------------------------------------------------------------

/// A node in a document's extraction tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldNode {
    /// Leaf field. `confidence` is the engine's self-reported certainty in
    /// [0,1]; absence means the engine could not vouch for the value.
    /// `page` is the 1-based source page, kept as reviewer context.
    Scalar {
        value: ScalarValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page: Option<u32>,
    },
    /// Keyed children. BTreeMap keeps serialization deterministic.
    Object { children: BTreeMap<String, FieldNode> },
    /// Ordered children.
    Array { items: Vec<FieldNode> },
}

impl FieldNode {
    /// Leaf constructor without page context.
    pub fn scalar(value: impl Into<ScalarValue>, confidence: Option<f32>) -> Self {
        FieldNode::Scalar {
            value: value.into(),
            confidence,
            page: None,
        }
    }

    /// Leaf constructor with page context.
    pub fn scalar_on_page(
        value: impl Into<ScalarValue>,
        confidence: Option<f32>,
        page: u32,
    ) -> Self {
        FieldNode::Scalar {
            value: value.into(),
            confidence,
            page: Some(page),
        }
    }

    pub fn object(children: impl IntoIterator<Item = (&'static str, FieldNode)>) -> Self {
        FieldNode::Object {
            children: children
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    pub fn array(items: impl IntoIterator<Item = FieldNode>) -> Self {
        FieldNode::Array {
            items: items.into_iter().collect(),
        }
    }

    /// Resolve a node by path. Returns `None` when any segment does not
    /// exist or addresses the wrong node kind.
    pub fn get(&self, path: &FieldPath) -> Option<&FieldNode> {
        let mut current = self;
        for segment in path.segments() {
            current = match (current, segment) {
                (FieldNode::Object { children }, PathSegment::Key(key)) => children.get(key)?,
                (FieldNode::Array { items }, PathSegment::Index(i)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// All scalar paths in the tree, in depth-first order.
    pub fn scalar_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_scalar_paths(self, FieldPath::root(), &mut paths);
        paths
    }
}

fn collect_scalar_paths(node: &FieldNode, path: FieldPath, out: &mut Vec<FieldPath>) {
    match node {
        FieldNode::Scalar { .. } => out.push(path),
        FieldNode::Object { children } => {
            for (key, child) in children {
                collect_scalar_paths(child, path.child(key), out);
            }
        }
        FieldNode::Array { items } => {
            for (i, item) in items.iter().enumerate() {
                collect_scalar_paths(item, path.index(i), out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// One step of a field path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// The unique address of a node within an extraction tree.
///
/// Canonical text form is dotted keys with bracketed indices, e.g.
/// `diagnosis.immunostains[2].name`. The empty path addresses the root.
/// Serialized as its text form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FieldPath(Vec<PathSegment>);

impl FieldPath {
    pub fn root() -> Self {
        FieldPath(Vec::new())
    }

    pub fn child(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Key(key.to_string()));
        FieldPath(segments)
    }

    pub fn index(&self, i: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(i));
        FieldPath(segments)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(key) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{key}")?;
                }
                PathSegment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

/// Error from parsing a field path's text form.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid field path {path:?}: {reason}")]
pub struct PathParseError {
    pub path: String,
    pub reason: String,
}

impl FromStr for FieldPath {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason: &str| PathParseError {
            path: s.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut rest = s;
        let mut first = true;

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('[') {
                let end = after.find(']').ok_or_else(|| fail("unterminated index"))?;
                let index: usize = after[..end]
                    .parse()
                    .map_err(|_| fail("non-numeric index"))?;
                segments.push(PathSegment::Index(index));
                rest = &after[end + 1..];
            } else {
                let rest_key = if first {
                    rest
                } else {
                    rest.strip_prefix('.').ok_or_else(|| fail("expected '.'"))?
                };
                let end = rest_key
                    .find(['.', '['])
                    .unwrap_or(rest_key.len());
                if end == 0 {
                    return Err(fail("empty key"));
                }
                segments.push(PathSegment::Key(rest_key[..end].to_string()));
                rest = &rest_key[end..];
            }
            first = false;
        }

        Ok(FieldPath(segments))
    }
}

impl Serialize for FieldPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> FieldNode {
        FieldNode::object([
            ("name", FieldNode::scalar("Jane Doe", Some(0.95))),
            (
                "diagnosis",
                FieldNode::object([
                    ("tumor_size", FieldNode::scalar(2.3, Some(0.81))),
                    (
                        "immunostains",
                        FieldNode::array([
                            FieldNode::scalar("ER positive", Some(0.92)),
                            FieldNode::scalar("PR negative", None),
                        ]),
                    ),
                ]),
            ),
        ])
    }

    #[test]
    fn path_display_round_trips() {
        let path = FieldPath::root()
            .child("diagnosis")
            .child("immunostains")
            .index(2)
            .child("name");
        let text = path.to_string();
        assert_eq!(text, "diagnosis.immunostains[2].name");
        assert_eq!(text.parse::<FieldPath>().unwrap(), path);
    }

    #[test]
    fn root_path_is_empty_string() {
        assert_eq!(FieldPath::root().to_string(), "");
        assert_eq!("".parse::<FieldPath>().unwrap(), FieldPath::root());
        assert!(FieldPath::root().is_root());
    }

    #[test]
    fn path_parse_rejects_garbage() {
        assert!("a..b".parse::<FieldPath>().is_err());
        assert!("a[".parse::<FieldPath>().is_err());
        assert!("a[x]".parse::<FieldPath>().is_err());
        assert!(".a".parse::<FieldPath>().is_err());
    }

    #[test]
    fn path_parse_index_chains() {
        let path = "rows[0][3].cell".parse::<FieldPath>().unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("rows".into()),
                PathSegment::Index(0),
                PathSegment::Index(3),
                PathSegment::Key("cell".into()),
            ]
        );
    }

    #[test]
    fn get_resolves_nested_scalar() {
        let tree = sample_tree();
        let path: FieldPath = "diagnosis.immunostains[1]".parse().unwrap();
        match tree.get(&path) {
            Some(FieldNode::Scalar { value, confidence, .. }) => {
                assert_eq!(value, &ScalarValue::Text("PR negative".into()));
                assert!(confidence.is_none());
            }
            other => panic!("Expected scalar, got {other:?}"),
        }
    }

    #[test]
    fn get_returns_none_for_missing_path() {
        let tree = sample_tree();
        assert!(tree.get(&"diagnosis.grade".parse().unwrap()).is_none());
        assert!(tree.get(&"diagnosis.immunostains[9]".parse().unwrap()).is_none());
        // Key segment against an array node
        assert!(tree.get(&"diagnosis.immunostains.first".parse().unwrap()).is_none());
    }

    #[test]
    fn scalar_paths_covers_all_leaves() {
        let tree = sample_tree();
        let paths: Vec<String> = tree.scalar_paths().iter().map(|p| p.to_string()).collect();
        assert_eq!(
            paths,
            vec![
                "diagnosis.immunostains[0]",
                "diagnosis.immunostains[1]",
                "diagnosis.tumor_size",
                "name",
            ]
        );
    }

    #[test]
    fn scalar_root_has_single_empty_path() {
        let tree = FieldNode::scalar("lone", Some(0.5));
        let paths = tree.scalar_paths();
        assert_eq!(paths, vec![FieldPath::root()]);
    }

    #[test]
    fn tree_serde_round_trips() {
        let tree = sample_tree();
        let json = serde_json::to_string(&tree).unwrap();
        assert!(json.contains("\"kind\":\"object\""));
        assert!(json.contains("\"kind\":\"scalar\""));
        let back: FieldNode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn missing_confidence_omitted_from_json() {
        let node = FieldNode::scalar("x", None);
        let json = serde_json::to_string(&node).unwrap();
        assert!(!json.contains("confidence"));
    }

    #[test]
    fn date_scalar_parses_from_iso_string() {
        let json = r#"{"kind":"scalar","value":"1990-01-01","confidence":0.4}"#;
        let node: FieldNode = serde_json::from_str(json).unwrap();
        match node {
            FieldNode::Scalar { value: ScalarValue::Date(d), .. } => {
                assert_eq!(d.to_string(), "1990-01-01");
            }
            other => panic!("Expected date scalar, got {other:?}"),
        }
    }

    #[test]
    fn free_text_stays_text() {
        let json = r#"{"kind":"scalar","value":"Jane Doe"}"#;
        let node: FieldNode = serde_json::from_str(json).unwrap();
        assert!(matches!(
            node,
            FieldNode::Scalar { value: ScalarValue::Text(_), .. }
        ));
    }
}
