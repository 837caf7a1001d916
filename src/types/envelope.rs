//! Task descriptors and the wire envelope.
//!
//! The envelope body is the JSON document `{"args": [...], "kwargs": {...},
//! "other_data": {...}}`; the delivery headers carry the correlation `id` and
//! the remote handler name `task`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Content type stamped on every published envelope.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content encoding stamped on every published envelope.
pub const CONTENT_ENCODING_UTF8: &str = "utf-8";

/// Header carrying the correlation identifier.
pub const HEADER_ID: &str = "id";

/// Header carrying the remote task name.
pub const HEADER_TASK: &str = "task";

/// A task to be executed by the remote worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Fully qualified name of the remote handler
    pub task_name: String,

    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,

    /// Keyword arguments
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskDescriptor {
    /// Create a descriptor with no arguments.
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// JSON body of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBody {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub other_data: Map<String, Value>,
}

/// The wire message exchanged with the broker.
///
/// Immutable once built: fields are only reachable through accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEnvelope {
    content_type: String,
    content_encoding: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl TaskEnvelope {
    /// Build the envelope for `task` with a freshly generated correlation id.
    pub fn for_task(task: &TaskDescriptor) -> Result<Self, serde_json::Error> {
        let body = TaskBody {
            args: task.args.clone(),
            kwargs: task.kwargs.clone(),
            other_data: Map::new(),
        };

        let mut headers = BTreeMap::new();
        headers.insert(HEADER_ID.to_string(), Uuid::new_v4().to_string());
        headers.insert(HEADER_TASK.to_string(), task.task_name.clone());

        Ok(Self {
            content_type: CONTENT_TYPE_JSON.to_string(),
            content_encoding: CONTENT_ENCODING_UTF8.to_string(),
            headers,
            body: serde_json::to_vec(&body)?,
        })
    }

    /// Reassemble an envelope from its delivered parts.
    pub fn from_parts(
        content_type: impl Into<String>,
        content_encoding: impl Into<String>,
        headers: BTreeMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            content_type: content_type.into(),
            content_encoding: content_encoding.into(),
            headers,
            body,
        }
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content_encoding(&self) -> &str {
        &self.content_encoding
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Correlation id header, if present.
    pub fn id(&self) -> Option<&str> {
        self.headers.get(HEADER_ID).map(String::as_str)
    }

    /// Task name header, if present.
    pub fn task(&self) -> Option<&str> {
        self.headers.get(HEADER_TASK).map(String::as_str)
    }

    /// Decode the JSON body.
    pub fn decode_body(&self) -> Result<TaskBody, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}
