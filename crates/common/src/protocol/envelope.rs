// Wire frames exchanged over the command socket.
//
// Outbound: `CommandFrame` for every command, `CancelFrame` to abandon one.
// Inbound: `Envelope`, correlated to an outbound command by `requestId`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command name reserved for cancellation frames.
pub const CANCEL_COMMAND: &str = "cancel";

/// Field-name prefix marking client-local annotations that never go on the wire.
pub const LOCAL_ANNOTATION_PREFIX: char = '$';

/// Client -> Server: issue a named command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandFrame {
    pub request_id: String,
    pub command: String,
    pub command_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Client -> Server: stop work for an outstanding request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CancelFrame {
    pub request_id: String,
    pub command: String,
}

impl CancelFrame {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self { request_id: request_id.into(), command: CANCEL_COMMAND.to_string() }
    }
}

/// Outcome carried by an inbound envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeStatus {
    /// A partial or complete result; more frames may follow.
    Data,
    /// Terminal success.
    Done,
    /// Terminal failure; `data.text` holds the message.
    Exception,
    /// The session is no longer authenticated.
    AuthenticationException,
}

/// Server -> Client: one answer frame for an outstanding request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub request_id: String,
    pub status: EnvelopeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    /// Human-readable message of an `exception` envelope.
    pub fn exception_text(&self) -> String {
        match &self.data {
            Some(Value::Object(fields)) => match fields.get("text") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => Value::Object(fields.clone()).to_string(),
            },
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => "Unknown server error".to_string(),
        }
    }
}

/// Remove every object field whose name starts with `$`, recursing through
/// nested objects and arrays.
pub fn strip_local_annotations(value: &mut Value) {
    match value {
        Value::Object(fields) => {
            fields.retain(|name, _| !name.starts_with(LOCAL_ANNOTATION_PREFIX));
            for nested in fields.values_mut() {
                strip_local_annotations(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_local_annotations(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_frame_uses_camel_case_and_omits_missing_credential() {
        let frame = CommandFrame {
            request_id: "-9223372036854775808".to_string(),
            command: "getAnalysis".to_string(),
            command_data: json!({ "analysisId": "A1" }),
            credential: None,
        };

        let encoded = serde_json::to_value(&frame).expect("frame should serialize");
        assert_eq!(
            encoded,
            json!({
                "requestId": "-9223372036854775808",
                "command": "getAnalysis",
                "commandData": { "analysisId": "A1" },
            })
        );
    }

    #[test]
    fn cancel_frame_has_fixed_command_name() {
        let encoded = serde_json::to_value(CancelFrame::new("7")).expect("frame should serialize");
        assert_eq!(encoded, json!({ "requestId": "7", "command": "cancel" }));
    }

    #[test]
    fn envelope_decodes_every_status() {
        for (raw, expected) in [
            ("data", EnvelopeStatus::Data),
            ("done", EnvelopeStatus::Done),
            ("exception", EnvelopeStatus::Exception),
            ("authenticationException", EnvelopeStatus::AuthenticationException),
        ] {
            let envelope: Envelope =
                serde_json::from_value(json!({ "requestId": "1", "status": raw }))
                    .expect("envelope should decode");
            assert_eq!(envelope.status, expected);
            assert!(envelope.data.is_none());
        }
    }

    #[test]
    fn envelope_rejects_unknown_status() {
        let result =
            serde_json::from_value::<Envelope>(json!({ "requestId": "1", "status": "progress" }));
        assert!(result.is_err());
    }

    #[test]
    fn exception_text_prefers_text_field() {
        let envelope: Envelope = serde_json::from_value(json!({
            "requestId": "1",
            "status": "exception",
            "data": { "text": "table not found" }
        }))
        .expect("envelope should decode");
        assert_eq!(envelope.exception_text(), "table not found");

        let bare = Envelope {
            request_id: "2".to_string(),
            status: EnvelopeStatus::Exception,
            data_type: None,
            data: None,
        };
        assert_eq!(bare.exception_text(), "Unknown server error");
    }

    #[test]
    fn strip_local_annotations_recurses_through_objects_and_arrays() {
        let mut data = json!({
            "qube": {
                "id": "Q1",
                "$expanded": true,
                "queries": [
                    { "id": "R1", "diql": "select count()", "$result": { "percentComplete": 100 } },
                    { "id": "R2", "nested": [{ "$tmp": 1, "keep": 2 }] }
                ]
            },
            "$selection": ["R1"]
        });

        strip_local_annotations(&mut data);

        assert_eq!(
            data,
            json!({
                "qube": {
                    "id": "Q1",
                    "queries": [
                        { "id": "R1", "diql": "select count()" },
                        { "id": "R2", "nested": [{ "keep": 2 }] }
                    ]
                }
            })
        );
    }

    #[test]
    fn strip_local_annotations_leaves_values_containing_dollar_alone() {
        let mut data = json!({ "diql": "select $1", "tags": ["$literal"] });
        let expected = data.clone();
        strip_local_annotations(&mut data);
        assert_eq!(data, expected);
    }
}
