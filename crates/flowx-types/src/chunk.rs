use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A piece of split document text.
///
/// `mark` identifies the document the chunk was cut from (its URL, library
/// path, or the reference it was passed through). Retrieval keys its
/// embedding cache on the mark of the first chunk in a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    pub mark: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Chunk {
    pub fn new(content: impl Into<String>, mark: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            mark: mark.into(),
            metadata: Map::new(),
        }
    }

    /// Decode a chunk list that travelled through a JSON value (for example
    /// an upstream node's output read back through a reference).
    pub fn list_from_value(value: &Value) -> Option<Vec<Chunk>> {
        serde_json::from_value(value.clone()).ok()
    }
}
