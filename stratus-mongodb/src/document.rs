//! Conversion between CloudEvents and the documents stored in MongoDB.
//!
//! An event document is the event format's JSON rendition of the CloudEvent
//! parsed into BSON, plus the `streamid` field tying it to its stream. The
//! `time` attribute is stored in one of two representations, fixed per store
//! instance: the RFC 3339 string the format produced, or a native BSON
//! datetime so date range queries work server-side. BSON datetimes hold
//! milliseconds, so the native representation insists on millisecond-truncated
//! UTC times at write time rather than silently losing precision.

use bson::{Bson, Document};
use chrono::{DateTime, SecondsFormat, Utc};

use stratus::{CloudEvent, EventFormat, EventStoreError, EventStoreResult, StreamId, STREAM_ID_EXTENSION};

/// How the `time` attribute is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeRepresentation {
    /// Store the RFC 3339 string produced by the event format. Always
    /// lossless; string comparisons only.
    #[default]
    Rfc3339String,
    /// Store a native BSON datetime (millisecond precision, UTC). Enables
    /// server-side date queries; requires millisecond-truncated UTC times.
    Date,
}

/// Converts a CloudEvent into its stored document.
pub fn event_to_document(
    format: &dyn EventFormat,
    time_representation: TimeRepresentation,
    stream_id: &StreamId,
    event: &CloudEvent,
) -> EventStoreResult<Document> {
    let event_to_serialize = match time_representation {
        TimeRepresentation::Rfc3339String => normalize_time(event),
        TimeRepresentation::Date => event.clone(),
    };

    let bytes = format.serialize(&event_to_serialize)?;
    let json: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| EventStoreError::SerializationFailed(e.to_string()))?;
    let mut document = bson::to_document(&json)
        .map_err(|e| EventStoreError::SerializationFailed(e.to_string()))?;
    document.insert(STREAM_ID_EXTENSION, stream_id.as_ref());

    if time_representation == TimeRepresentation::Date {
        if let Some(time) = event.time() {
            if time.timestamp_subsec_nanos() % 1_000_000 != 0 {
                return Err(EventStoreError::InvalidTimePrecision(
                    "the CloudEvent time attribute carries micro- or nanoseconds, which the \
                     Date time representation cannot hold; truncate the time to milliseconds \
                     or switch to Rfc3339String"
                        .to_string(),
                ));
            }
            if time.offset().local_minus_utc() != 0 {
                return Err(EventStoreError::InvalidTimeZone(
                    "the CloudEvent time attribute is not expressed in UTC, which the Date \
                     time representation requires; convert the time to UTC or switch to \
                     Rfc3339String"
                        .to_string(),
                ));
            }
            // Overwrite the serialized string with a native datetime so the
            // time field supports server-side date queries.
            document.insert(
                "time",
                Bson::DateTime(bson::DateTime::from_chrono(time.with_timezone(&Utc))),
            );
        }
    }

    Ok(document)
}

/// Converts a stored document back into a CloudEvent.
///
/// The server-assigned `_id` and the `streamid` field are internal and
/// removed before the format sees the document; the change feed re-attaches
/// stream identity as an extension attribute for subscribers.
pub fn document_to_event(
    format: &dyn EventFormat,
    time_representation: TimeRepresentation,
    mut document: Document,
) -> EventStoreResult<CloudEvent> {
    document.remove("_id");
    document.remove(STREAM_ID_EXTENSION);

    if time_representation == TimeRepresentation::Date {
        // Tolerate string times here in case the representation was changed
        // under an existing collection.
        if let Some(Bson::DateTime(time)) = document.get("time") {
            let rfc3339 = time
                .to_chrono()
                .to_rfc3339_opts(SecondsFormat::Millis, true);
            document.insert("time", rfc3339);
        }
    }

    let json: serde_json::Value = Bson::Document(document).into_relaxed_extjson();
    let bytes = serde_json::to_vec(&json)
        .map_err(|e| EventStoreError::MalformedDocument(e.to_string()))?;
    format.deserialize(&bytes)
}

/// Re-parses the time attribute through its RFC 3339 rendition so
/// non-canonical offsets serialize stably.
fn normalize_time(event: &CloudEvent) -> CloudEvent {
    match event.time() {
        Some(time) => match DateTime::parse_from_rfc3339(&time.to_rfc3339()) {
            Ok(parsed) => event.clone().with_time(parsed),
            Err(_) => event.clone(),
        },
        None => event.clone(),
    }
}
