//! JSON codec for task frames.
//!
//! Outgoing frames are single JSON objects. Incoming frames arrive in one of
//! three shapes, all flattened into a list of [`IncomingMessage`]:
//! - a single message object
//! - a JSON array of message objects
//! - a batched envelope `{ "data": [...], "errors": [...] }`

use crate::error::ProtocolError;
use crate::message::IncomingMessage;
use serde::Serialize;
use serde_json::{Map, Value};

/// Encodes a message into a text frame.
pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Decodes a text frame into its messages.
pub fn decode_frame(frame: &str) -> Result<Vec<IncomingMessage>, ProtocolError> {
    let value: Value = serde_json::from_str(frame)?;
    flatten(value)
}

/// Decodes a binary frame carrying UTF-8 JSON.
pub fn decode_bytes(frame: &[u8]) -> Result<Vec<IncomingMessage>, ProtocolError> {
    let text = std::str::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8)?;
    decode_frame(text)
}

fn flatten(value: Value) -> Result<Vec<IncomingMessage>, ProtocolError> {
    match value {
        Value::Array(items) => items.into_iter().map(message_from_value).collect(),
        Value::Object(obj) if is_batch(&obj) => Ok(expand_batch(obj)),
        Value::Object(_) => Ok(vec![message_from_value(value)?]),
        other => Err(ProtocolError::UnexpectedFrame(format!(
            "expected object or array, got {}",
            kind(&other)
        ))),
    }
}

fn is_batch(obj: &Map<String, Value>) -> bool {
    // A correlated message may legitimately carry a list in `data`.
    !obj.contains_key("taskUUID")
        && (obj.get("data").is_some_and(Value::is_array)
            || obj.get("errors").is_some_and(Value::is_array))
}

fn expand_batch(mut obj: Map<String, Value>) -> Vec<IncomingMessage> {
    let mut messages = Vec::new();

    if let Some(Value::Array(items)) = obj.remove("data") {
        for item in items {
            messages.push(IncomingMessage {
                task_uuid: string_field(&item, "taskUUID"),
                task_type: string_field(&item, "taskType"),
                data: Some(item),
                error: None,
            });
        }
    }

    if let Some(Value::Array(items)) = obj.remove("errors") {
        for item in items {
            messages.push(IncomingMessage {
                task_uuid: string_field(&item, "taskUUID"),
                task_type: string_field(&item, "taskType"),
                data: None,
                error: Some(item),
            });
        }
    }

    messages
}

fn message_from_value(value: Value) -> Result<IncomingMessage, ProtocolError> {
    if !value.is_object() {
        return Err(ProtocolError::UnexpectedFrame(format!(
            "expected message object, got {}",
            kind(&value)
        )));
    }
    Ok(serde_json::from_value(value)?)
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn kind(value: &Value) -> &'static str {
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
    use crate::message::{AuthenticationMessage, TaskRequest, TaskType};
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_encode_outgoing() {
        let msg = TaskRequest::new(TaskType::GetImageResult)
            .with_param("jobId", "job-7")
            .into_message("t-3");
        let frame = encode(&msg).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"taskType": "getImageResult", "taskUUID": "t-3", "jobId": "job-7"})
        );
    }

    #[test]
    fn test_encode_authentication() {
        let frame = encode(&AuthenticationMessage::new("k")).unwrap();
        assert!(frame.contains("\"apiKey\":\"k\""));
        assert!(frame.contains("\"taskType\":\"authentication\""));
    }

    #[test]
    fn test_decode_single_object() {
        let messages =
            decode_frame(r#"{"taskUUID":"t-1","data":{"imageUUID":"img"}}"#).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].task_uuid.as_deref(), Some("t-1"));
        assert_eq!(messages[0].data, Some(json!({"imageUUID": "img"})));
        assert!(!messages[0].is_error());
    }

    #[test]
    fn test_decode_without_task_uuid() {
        let messages = decode_frame(r#"{"error":"rate limited"}"#).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].task_uuid.is_none());
        assert_eq!(messages[0].error_message().as_deref(), Some("rate limited"));
    }

    #[test]
    fn test_decode_array() {
        let messages = decode_frame(
            r#"[{"taskUUID":"a","data":{}},{"taskUUID":"b","error":"boom"}]"#,
        )
        .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].task_uuid.as_deref(), Some("a"));
        assert_eq!(messages[1].error_message().as_deref(), Some("boom"));
    }

    #[test]
    fn test_decode_batched_envelope() {
        let frame = json!({
            "data": [
                {"taskType": "imageInference", "taskUUID": "a", "imageURL": "https://x"},
                {"taskType": "authentication", "connectionSessionUUID": "s-1"}
            ],
            "errors": [
                {"taskUUID": "b", "code": "invalidPrompt", "message": "prompt too short"}
            ]
        })
        .to_string();

        let messages = decode_frame(&frame).unwrap();
        assert_eq!(messages.len(), 3);

        assert_eq!(messages[0].task_uuid.as_deref(), Some("a"));
        assert!(messages[0].is_task(TaskType::ImageInference));

        assert!(messages[1].task_uuid.is_none());
        assert!(messages[1].is_task(TaskType::Authentication));

        assert_eq!(messages[2].task_uuid.as_deref(), Some("b"));
        assert_eq!(messages[2].error_message().as_deref(), Some("prompt too short"));
    }

    #[test]
    fn test_correlated_list_payload_is_not_a_batch() {
        let messages =
            decode_frame(r#"{"taskUUID":"t-1","data":[{"imageUUID":"a"},{"imageUUID":"b"}]}"#)
                .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].task_uuid.as_deref(), Some("t-1"));
        assert!(messages[0].data.as_ref().unwrap().is_array());
    }

    #[test]
    fn test_decode_rejects_scalars() {
        let err = decode_frame("42").unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedFrame(_)));

        let err = decode_frame("[1, 2]").unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedFrame(_)));
    }

    #[test]
    fn test_decode_invalid_json() {
        let err = decode_frame("{\"taskUUID\":").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn test_decode_bytes() {
        let messages = decode_bytes(br#"{"taskUUID":"t","data":null}"#).unwrap();
        assert_eq!(messages[0].task_uuid.as_deref(), Some("t"));

        let err = decode_bytes(&[0xff, 0xfe]).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidUtf8);
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(frame in ".*") {
            let _ = decode_frame(&frame);
        }

        #[test]
        fn prop_task_uuid_preserved(id in "[a-zA-Z0-9-]{1,40}") {
            let frame = json!({"taskUUID": id, "data": {"ok": true}}).to_string();
            let messages = decode_frame(&frame).unwrap();
            prop_assert_eq!(messages.len(), 1);
            prop_assert_eq!(messages[0].task_uuid.as_deref(), Some(id.as_str()));
        }
    }
}
