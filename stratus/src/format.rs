//! Pluggable event formats: codecs between [`CloudEvent`] and bytes.
//!
//! Storage backends serialize events through an [`EventFormat`] before
//! turning them into documents, and deserialize through the same format on
//! the way out. The default is the CloudEvents JSON format.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value};

use crate::errors::{EventStoreError, EventStoreResult};
use crate::event::{CloudEvent, EventData, ExtensionValue, SPEC_VERSION};

/// A codec between CloudEvents and a byte representation.
///
/// Implementations must be pure: `deserialize(serialize(e))` yields an event
/// equal to `e` for every event the format can represent.
pub trait EventFormat: Send + Sync {
    /// Serializes a CloudEvent to bytes.
    fn serialize(&self, event: &CloudEvent) -> EventStoreResult<Vec<u8>>;

    /// Deserializes bytes produced by [`EventFormat::serialize`].
    fn deserialize(&self, bytes: &[u8]) -> EventStoreResult<CloudEvent>;
}

/// The CloudEvents JSON event format.
///
/// Context attributes become top-level members, extension attributes sit
/// alongside them, JSON payloads use the `data` member and binary payloads
/// the base64-encoded `data_base64` member.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventFormat;

impl EventFormat for JsonEventFormat {
    fn serialize(&self, event: &CloudEvent) -> EventStoreResult<Vec<u8>> {
        let mut members = Map::new();
        members.insert("specversion".to_string(), Value::from(SPEC_VERSION));
        members.insert("id".to_string(), Value::from(event.id()));
        members.insert("source".to_string(), Value::from(event.source()));
        members.insert("type".to_string(), Value::from(event.event_type()));

        if let Some(subject) = event.subject() {
            members.insert("subject".to_string(), Value::from(subject));
        }
        if let Some(content_type) = event.datacontenttype() {
            members.insert("datacontenttype".to_string(), Value::from(content_type));
        }
        if let Some(dataschema) = event.dataschema() {
            members.insert("dataschema".to_string(), Value::from(dataschema));
        }
        if let Some(time) = event.time() {
            members.insert(
                "time".to_string(),
                Value::from(time.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            );
        }

        for (name, value) in event.extensions() {
            let json = match value {
                ExtensionValue::String(s) => Value::from(s.clone()),
                ExtensionValue::Boolean(b) => Value::from(*b),
                ExtensionValue::Integer(i) => Value::from(*i),
            };
            members.insert(name.to_string(), json);
        }

        match event.data() {
            Some(EventData::Json(value)) => {
                members.insert("data".to_string(), value.clone());
            }
            Some(EventData::Binary(bytes)) => {
                members.insert("data_base64".to_string(), Value::from(BASE64.encode(bytes)));
            }
            None => {}
        }

        serde_json::to_vec(&Value::Object(members))
            .map_err(|e| EventStoreError::SerializationFailed(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> EventStoreResult<CloudEvent> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| EventStoreError::DeserializationFailed(e.to_string()))?;
        let Value::Object(members) = value else {
            return Err(EventStoreError::MalformedDocument(
                "CloudEvent JSON must be an object".to_string(),
            ));
        };

        let specversion = require_string(&members, "specversion")?;
        if specversion != SPEC_VERSION {
            return Err(EventStoreError::MalformedDocument(format!(
                "unsupported specversion '{specversion}'"
            )));
        }

        let mut event = CloudEvent::new(
            require_string(&members, "id")?,
            require_string(&members, "source")?,
            require_string(&members, "type")?,
        );

        for (name, value) in &members {
            match name.as_str() {
                "specversion" | "id" | "source" | "type" => {}
                "subject" => event = event.with_subject(expect_string(name, value)?),
                "datacontenttype" => event = event.with_datacontenttype(expect_string(name, value)?),
                "dataschema" => event = event.with_dataschema(expect_string(name, value)?),
                "time" => {
                    let raw = expect_string(name, value)?;
                    let time = DateTime::parse_from_rfc3339(raw).map_err(|e| {
                        EventStoreError::DeserializationFailed(format!(
                            "invalid RFC 3339 time '{raw}': {e}"
                        ))
                    })?;
                    event = event.with_time(time);
                }
                "data" => event = event.with_data(EventData::Json(value.clone())),
                "data_base64" => {
                    let raw = expect_string(name, value)?;
                    let bytes = BASE64.decode(raw).map_err(|e| {
                        EventStoreError::DeserializationFailed(format!(
                            "invalid base64 payload: {e}"
                        ))
                    })?;
                    event = event.with_data(EventData::Binary(bytes));
                }
                _ => {
                    let extension = match value {
                        Value::String(s) => ExtensionValue::String(s.clone()),
                        Value::Bool(b) => ExtensionValue::Boolean(*b),
                        Value::Number(n) => match n.as_i64() {
                            Some(i) => ExtensionValue::Integer(i),
                            None => {
                                return Err(EventStoreError::MalformedDocument(format!(
                                    "extension attribute '{name}' is not an integer"
                                )))
                            }
                        },
                        _ => {
                            return Err(EventStoreError::MalformedDocument(format!(
                                "extension attribute '{name}' has an unsupported type"
                            )))
                        }
                    };
                    event = event.with_extension(name.clone(), extension);
                }
            }
        }

        Ok(event)
    }
}

fn require_string<'a>(members: &'a Map<String, Value>, name: &str) -> EventStoreResult<&'a str> {
    members
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            EventStoreError::MalformedDocument(format!("missing or non-string attribute '{name}'"))
        })
}

fn expect_string<'a>(name: &str, value: &'a Value) -> EventStoreResult<&'a str> {
    value.as_str().ok_or_else(|| {
        EventStoreError::MalformedDocument(format!("attribute '{name}' must be a string"))
    })
}
