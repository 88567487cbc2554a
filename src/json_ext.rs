//! Manipulation of JSON values as they appear in GraphQL responses.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
pub use serde_json_bytes::Value;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;

/// A JSON object.
pub type Object = Map<ByteString, Value>;

/// One segment of a [`Path`] into a response value.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    /// An index into a list value.
    Index(usize),

    /// A key into an object value.
    Key(String),
}

/// A path into the `data` of a GraphQL response, as carried by the `path`
/// field of a GraphQL error.
///
/// Serialized as a JSON array of strings and integers, per the GraphQL
/// specification.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    /// An iterator over the segments of this path.
    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.0.iter()
    }

    /// The number of segments in this path.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this path has no segments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Self(
            s.split('/')
                .filter(|segment| !segment.is_empty())
                .map(|segment| {
                    if let Ok(index) = segment.parse::<usize>() {
                        PathElement::Index(index)
                    } else {
                        PathElement::Key(segment.to_string())
                    }
                })
                .collect(),
        )
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            match element {
                PathElement::Index(index) => write!(f, "{index}")?,
                PathElement::Key(key) => write!(f, "{key}")?,
            }
        }
        Ok(())
    }
}
