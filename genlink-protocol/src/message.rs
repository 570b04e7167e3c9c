//! JSON message types for task requests and responses.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Task discriminator carried in every frame's `taskType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskType {
    // Session management
    Authentication,

    // Generation
    ImageInference,
    GetImageResult,

    // Assets
    UploadImage,
}

impl TaskType {
    /// Returns the wire name of this task type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Authentication => "authentication",
            TaskType::ImageInference => "imageInference",
            TaskType::GetImageResult => "getImageResult",
            TaskType::UploadImage => "uploadImage",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task that has not been assigned a correlation token yet.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    task_type: TaskType,
    params: Map<String, Value>,
}

impl TaskRequest {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_optional_param<V: Into<Value>>(
        self,
        key: impl Into<String>,
        value: Option<V>,
    ) -> Self {
        match value {
            Some(v) => self.with_param(key, v),
            None => self,
        }
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    /// Attaches the correlation token, producing the frame to transmit.
    pub fn into_message(self, task_uuid: impl Into<String>) -> OutgoingMessage {
        OutgoingMessage {
            task_type: self.task_type,
            task_uuid: task_uuid.into(),
            params: self.params,
        }
    }
}

/// Outgoing task frame: `{ taskType, taskUUID, ...params }`.
///
/// Fields are read-only once the message is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(rename = "taskType")]
    task_type: TaskType,

    #[serde(rename = "taskUUID")]
    task_uuid: String,

    #[serde(flatten)]
    params: Map<String, Value>,
}

impl OutgoingMessage {
    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn task_uuid(&self) -> &str {
        &self.task_uuid
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }
}

/// Authentication frame sent immediately after the transport opens.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthenticationMessage {
    #[serde(rename = "taskType")]
    task_type: TaskType,

    #[serde(rename = "apiKey")]
    api_key: String,

    /// Session from a previous connection, echoed back so the service can resume it.
    #[serde(
        rename = "connectionSessionUUID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    connection_session_uuid: Option<String>,
}

impl AuthenticationMessage {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            task_type: TaskType::Authentication,
            api_key: api_key.into(),
            connection_session_uuid: None,
        }
    }

    pub fn with_session(mut self, session_uuid: Option<String>) -> Self {
        self.connection_session_uuid = session_uuid;
        self
    }

    pub fn connection_session_uuid(&self) -> Option<&str> {
        self.connection_session_uuid.as_deref()
    }
}

impl fmt::Debug for AuthenticationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationMessage")
            .field("api_key", &"<redacted>")
            .field("connection_session_uuid", &self.connection_session_uuid)
            .finish()
    }
}

/// Incoming frame: `{ taskUUID?, taskType?, data?, error? }`.
///
/// A missing `taskUUID` marks a frame that cannot be correlated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    #[serde(rename = "taskUUID", default, skip_serializing_if = "Option::is_none")]
    pub task_uuid: Option<String>,

    #[serde(rename = "taskType", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl IncomingMessage {
    /// Builds a successful response for a task.
    pub fn data(task_uuid: impl Into<String>, data: Value) -> Self {
        Self {
            task_uuid: Some(task_uuid.into()),
            task_type: None,
            data: Some(data),
            error: None,
        }
    }

    /// Builds an error response, optionally bound to a task.
    pub fn failure(task_uuid: Option<String>, message: impl Into<String>) -> Self {
        Self {
            task_uuid,
            task_type: None,
            data: None,
            error: Some(Value::String(message.into())),
        }
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type.as_str().to_string());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.as_ref().is_some_and(|e| !e.is_null())
    }

    /// Returns the error text, whether the service sent a string or an object.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => Some(
                obj.get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
            ),
            other => Some(other.to_string()),
        }
    }

    /// Returns the task type, falling back to the one nested in `data`.
    pub fn task_type(&self) -> Option<&str> {
        self.task_type.as_deref().or_else(|| {
            self.data
                .as_ref()
                .and_then(|d| d.get("taskType"))
                .and_then(Value::as_str)
        })
    }

    pub fn is_task(&self, task_type: TaskType) -> bool {
        self.task_type() == Some(task_type.as_str())
    }
}

/// Normalized result of an inference or result-lookup task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(rename = "taskUUID")]
    pub task_uuid: String,

    #[serde(rename = "imageUUID", default, skip_serializing_if = "Option::is_none")]
    pub image_uuid: Option<String>,

    #[serde(rename = "imageURL", default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    /// Job status for result lookups (e.g. "processing", "success").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Cost charged for the task, when the service reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Client-measured round trip, filled in by the caller.
    #[serde(rename = "elapsedMs", default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl JobResult {
    /// Builds a result from a response payload.
    ///
    /// The service may answer with one object or a list of results; the first
    /// entry wins. A payload without its own `taskUUID` inherits `task_uuid`.
    pub fn from_data(task_uuid: &str, data: Value) -> Result<Self, ProtocolError> {
        let object = first_object(data).ok_or(ProtocolError::MissingField("data"))?;
        Ok(serde_json::from_value(Value::Object(with_task_uuid(
            object, task_uuid,
        )))?)
    }

    /// Returns the best available reference to the generated image.
    pub fn image_reference(&self) -> Option<&str> {
        self.image_url.as_deref().or(self.image_uuid.as_deref())
    }
}

/// Acknowledgement of an uploaded asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAck {
    #[serde(rename = "taskUUID")]
    pub task_uuid: String,

    #[serde(rename = "imageUUID")]
    pub image_uuid: String,
}

impl UploadAck {
    pub fn from_data(task_uuid: &str, data: Value) -> Result<Self, ProtocolError> {
        let object = first_object(data).ok_or(ProtocolError::MissingField("data"))?;
        if !object.contains_key("imageUUID") {
            return Err(ProtocolError::MissingField("imageUUID"));
        }
        Ok(serde_json::from_value(Value::Object(with_task_uuid(
            object, task_uuid,
        )))?)
    }
}

fn first_object(data: Value) -> Option<Map<String, Value>> {
    match data {
        Value::Object(obj) => Some(obj),
        Value::Array(items) => items.into_iter().find_map(|item| match item {
            Value::Object(obj) => Some(obj),
            _ => None,
        }),
        _ => None,
    }
}

fn with_task_uuid(mut object: Map<String, Value>, task_uuid: &str) -> Map<String, Value> {
    object
        .entry("taskUUID")
        .or_insert_with(|| Value::String(task_uuid.to_string()));
    object
}
