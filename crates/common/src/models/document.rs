//! Source document handed to the chunker

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw fetched or uploaded content, owned by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier; generated by the chunker when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Raw content, possibly containing markup
    pub text: String,

    /// Free-form metadata copied into every chunk (e.g. `url`)
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.metadata.insert("url".to_string(), Value::String(url.into()));
        self
    }

    /// The `url` metadata entry when it is a string
    pub fn url(&self) -> Option<&str> {
        self.metadata.get("url").and_then(Value::as_str)
    }
}
