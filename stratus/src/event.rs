//! The CloudEvent envelope stored and delivered by stratus.
//!
//! This is a deliberately small rendition of the CloudEvents v1 attribute
//! model: the required context attributes, the optional ones the store cares
//! about, an opaque data payload, and extension attributes. The store itself
//! only ever reads and writes two extensions: [`STREAM_ID_EXTENSION`] ties an
//! event to its stream on ingress, and the change feed attaches
//! [`STREAM_POSITION_EXTENSION`] on delivery so consumers can persist their
//! resume point.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};

/// The CloudEvents specification version stratus produces and accepts.
pub const SPEC_VERSION: &str = "1.0";

/// Extension attribute naming the stream an event belongs to.
pub const STREAM_ID_EXTENSION: &str = "streamid";

/// Extension attribute carrying the change-feed position of a delivered
/// event, base64-encoded.
pub const STREAM_POSITION_EXTENSION: &str = "streamposition";

/// The payload of a CloudEvent.
///
/// JSON-valued payloads round-trip through the JSON event format's `data`
/// member; binary payloads use `data_base64`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    /// A JSON value, serialized inline.
    Json(serde_json::Value),
    /// Opaque bytes, base64-encoded on the wire.
    Binary(Vec<u8>),
}

/// A CloudEvents extension attribute value.
///
/// The CloudEvents type system restricts extension values to a small set of
/// primitives; stratus supports the three that survive a JSON round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionValue {
    /// A string value.
    String(String),
    /// A boolean value.
    Boolean(bool),
    /// An integer value.
    Integer(i64),
}

impl From<&str> for ExtensionValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ExtensionValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for ExtensionValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for ExtensionValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl ExtensionValue {
    /// The value as a string slice, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// A CloudEvent: the unit of storage and delivery.
///
/// Construction is builder-style; `id`, `source` and `type` are required up
/// front, everything else is optional.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use stratus::{CloudEvent, EventData};
///
/// let event = CloudEvent::new("e1", "https://example.org/registry", "NameDefined")
///     .with_subject("name")
///     .with_time_utc(Utc::now())
///     .with_data(EventData::Json(serde_json::json!({ "name": "John Doe" })));
///
/// assert_eq!(event.id(), "e1");
/// assert_eq!(event.event_type(), "NameDefined");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CloudEvent {
    id: String,
    source: String,
    ty: String,
    subject: Option<String>,
    datacontenttype: Option<String>,
    dataschema: Option<String>,
    time: Option<DateTime<FixedOffset>>,
    data: Option<EventData>,
    extensions: BTreeMap<String, ExtensionValue>,
}

impl CloudEvent {
    /// Creates an event with the three required context attributes.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            ty: event_type.into(),
            subject: None,
            datacontenttype: None,
            dataschema: None,
            time: None,
            data: None,
            extensions: BTreeMap::new(),
        }
    }

    /// Sets the `subject` attribute.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets the `datacontenttype` attribute.
    #[must_use]
    pub fn with_datacontenttype(mut self, content_type: impl Into<String>) -> Self {
        self.datacontenttype = Some(content_type.into());
        self
    }

    /// Sets the `dataschema` attribute.
    #[must_use]
    pub fn with_dataschema(mut self, dataschema: impl Into<String>) -> Self {
        self.dataschema = Some(dataschema.into());
        self
    }

    /// Sets the `time` attribute, preserving the given offset.
    #[must_use]
    pub fn with_time(mut self, time: DateTime<FixedOffset>) -> Self {
        self.time = Some(time);
        self
    }

    /// Sets the `time` attribute from a UTC instant.
    #[must_use]
    pub fn with_time_utc(self, time: DateTime<Utc>) -> Self {
        self.with_time(time.fixed_offset())
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets an extension attribute.
    ///
    /// Extension names should follow the CloudEvents convention of lowercase
    /// letters and digits; stratus stores them as given.
    #[must_use]
    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<ExtensionValue>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    /// Removes an extension attribute, returning its previous value.
    pub fn remove_extension(&mut self, name: &str) -> Option<ExtensionValue> {
        self.extensions.remove(name)
    }

    /// The `id` attribute, unique per `source`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The `source` attribute.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The `type` attribute.
    pub fn event_type(&self) -> &str {
        &self.ty
    }

    /// The `subject` attribute, if set.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// The `datacontenttype` attribute, if set.
    pub fn datacontenttype(&self) -> Option<&str> {
        self.datacontenttype.as_deref()
    }

    /// The `dataschema` attribute, if set.
    pub fn dataschema(&self) -> Option<&str> {
        self.dataschema.as_deref()
    }

    /// The `time` attribute, if set.
    pub fn time(&self) -> Option<&DateTime<FixedOffset>> {
        self.time.as_ref()
    }

    /// The payload, if any.
    pub fn data(&self) -> Option<&EventData> {
        self.data.as_ref()
    }

    /// An extension attribute by name.
    pub fn extension(&self, name: &str) -> Option<&ExtensionValue> {
        self.extensions.get(name)
    }

    /// All extension attributes, ordered by name.
    pub fn extensions(&self) -> impl Iterator<Item = (&str, &ExtensionValue)> {
        self.extensions.iter().map(|(k, v)| (k.as_str(), v))
    }
}
