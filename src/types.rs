//! Wire types for the dhub API

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Server information published at `GET /server`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Number of elements per list page; also bounds bundle sizes
    #[serde(rename = "Page-Size")]
    pub page_size: usize,
    /// Any other advertised settings
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ServerInfo {
    /// Server info with just a page size
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            extra: HashMap::new(),
        }
    }
}

/// Token information published at `GET /tokens/{token}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Namespace the token owns datasets under
    #[serde(default)]
    pub prefix: String,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Editable metadata of an element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementData {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Tags are either plain strings (`"name: value"`) or single-key objects
    #[serde(default)]
    pub tags: Vec<Value>,
    #[serde(default)]
    pub http_ref: String,
}

/// Element as returned by listing and lookup endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(flatten)]
    pub data: ElementData,
    #[serde(default)]
    pub comments_count: u64,
    #[serde(default)]
    pub has_content: bool,
}

/// Input for creating an element
#[derive(Debug, Clone, Default)]
pub struct NewElement {
    pub data: ElementData,
    /// Initial content, queued for upload once the element exists
    pub content: Option<Bytes>,
}

impl NewElement {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            data: ElementData {
                title: title.into(),
                description: description.into(),
                ..Default::default()
            },
            content: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<Value>) -> Self {
        self.data.tags = tags;
        self
    }

    pub fn with_ref(mut self, http_ref: impl Into<String>) -> Self {
        self.data.http_ref = http_ref.into();
        self
    }

    pub fn with_content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// Dataset as returned by `GET /datasets/{prefix}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub url_prefix: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub fork_count: u64,
    #[serde(default)]
    pub fork_father: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub elements_count: usize,
    #[serde(default)]
    pub comments_count: u64,
}

impl DatasetRecord {
    /// Body for `PATCH /datasets/{prefix}`; the prefix itself is immutable
    pub fn patch_body(&self) -> Value {
        serde_json::json!({
            "title": self.title,
            "description": self.description,
            "reference": self.reference,
            "tags": self.tags,
            "fork_count": self.fork_count,
            "fork_father": self.fork_father,
            "size": self.size,
        })
    }
}

/// Input for creating or forking a dataset
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewDataset {
    pub url_prefix: String,
    pub title: String,
    pub description: String,
    pub reference: String,
    pub tags: Vec<String>,
}

/// Overrides applied to a forked dataset; unset fields keep the source's
#[derive(Debug, Clone, Default, Serialize)]
pub struct ForkRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub reference: Option<String>,
    /// Only elements matching these filter options are copied
    pub options: Option<Value>,
}

/// Server-side filter applied to element listings
///
/// Options are opaque to the client; they are forwarded as the `options`
/// body field and keyed in the page cache by their JSON text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOptions(Value);

impl FilterOptions {
    /// No filtering
    pub fn none() -> Self {
        Self(Value::Null)
    }

    pub fn is_none(&self) -> bool {
        self.0.is_null()
    }

    /// Body field value
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Stable key for the page cache
    pub fn cache_key(&self) -> String {
        self.0.to_string()
    }
}

impl From<Value> for FilterOptions {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
