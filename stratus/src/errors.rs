//! Error types for the stratus event store.

use thiserror::Error;

use crate::condition::WriteCondition;
use crate::types::SubscriptionId;

/// Errors raised by event store operations.
#[derive(Debug, Clone, Error)]
pub enum EventStoreError {
    /// The write condition evaluated to false against the current stream
    /// version. The message phrasing is part of the public contract.
    #[error("WriteCondition was not fulfilled. Expected version {condition} but was {actual}.")]
    WriteConditionNotFulfilled {
        /// The condition the caller supplied.
        condition: WriteCondition,
        /// The stream version the condition was evaluated against.
        actual: u64,
    },

    /// A non-trivial write condition was given to a store configured without
    /// stream version tracking.
    #[error(
        "WriteCondition '{condition}' requires stream version tracking, \
         which this store is configured without"
    )]
    WriteConditionNotSupported {
        /// The condition the caller supplied.
        condition: WriteCondition,
    },

    /// Inserting the batch violated the `(streamid, id)` uniqueness index.
    #[error("Duplicate event id: {0}")]
    DuplicateEventId(String),

    /// The event's time carries sub-millisecond precision, which the native
    /// timestamp representation cannot hold.
    #[error("Invalid time precision: {0}")]
    InvalidTimePrecision(String),

    /// The event's time is not expressed in UTC, which the native timestamp
    /// representation requires.
    #[error("Invalid time zone: {0}")]
    InvalidTimeZone(String),

    /// A stored document could not be interpreted as a CloudEvent.
    #[error("Malformed event document: {0}")]
    MalformedDocument(String),

    /// A CloudEvent could not be serialized by the configured event format.
    #[error("Event serialization failed: {0}")]
    SerializationFailed(String),

    /// Stored bytes could not be deserialized by the configured event format.
    #[error("Event deserialization failed: {0}")]
    DeserializationFailed(String),

    /// The underlying document store is unreachable or aborted with a
    /// transient fault. Callers may retry.
    #[error("Event store unavailable: {0}")]
    Unavailable(String),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the subscription engine and its collaborators.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    /// A subscription with this id is already running in the engine.
    #[error("Subscription '{0}' is already running")]
    AlreadySubscribed(SubscriptionId),

    /// No running subscription has this id.
    #[error("Subscription '{0}' is not running")]
    NotSubscribed(SubscriptionId),

    /// The engine is shutting down and does not accept new subscriptions.
    #[error("Subscription engine is shut down")]
    ShutDown,

    /// The change feed failed and could not be re-established after the
    /// configured retries.
    #[error("Subscription failed: {0}")]
    Failed(String),

    /// The change feed reported an error for a single poll or open attempt.
    #[error("Change feed error: {0}")]
    Feed(String),

    /// A change notification could not be decoded into a CloudEvent.
    #[error("Change feed decode error: {0}")]
    Decode(#[from] EventStoreError),

    /// Reading or writing a durable subscription position failed.
    #[error("Position storage error: {0}")]
    PositionStorage(String),
}

/// Result alias for event store operations.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

/// Result alias for subscription operations.
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::VersionCondition;

    #[test]
    fn unfulfilled_condition_message_uses_canonical_phrasing() {
        let err = EventStoreError::WriteConditionNotFulfilled {
            condition: WriteCondition::stream_version_eq(10),
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "WriteCondition was not fulfilled. Expected version to be equal to 10 but was 3."
        );
    }

    #[test]
    fn unfulfilled_composite_condition_message_joins_phrases() {
        let err = EventStoreError::WriteConditionNotFulfilled {
            condition: WriteCondition::stream_version(VersionCondition::and(vec![
                VersionCondition::Gte(0),
                VersionCondition::Lt(100),
                VersionCondition::Ne(1),
            ])),
            actual: 1,
        };
        assert_eq!(
            err.to_string(),
            "WriteCondition was not fulfilled. Expected version to be greater than or equal to 0 \
             and to be less than 100 and to not be equal to 1 but was 1."
        );
    }

    #[test]
    fn unsupported_condition_message_names_the_condition() {
        let err = EventStoreError::WriteConditionNotSupported {
            condition: WriteCondition::stream_version_eq(2),
        };
        assert!(err.to_string().contains("to be equal to 2"));
    }

    #[test]
    fn subscription_error_messages_are_descriptive() {
        let id = SubscriptionId::try_new("names-projection").unwrap();
        assert_eq!(
            SubscriptionError::AlreadySubscribed(id.clone()).to_string(),
            "Subscription 'names-projection' is already running"
        );
        assert_eq!(
            SubscriptionError::NotSubscribed(id).to_string(),
            "Subscription 'names-projection' is not running"
        );
    }

    #[test]
    fn decode_errors_convert_from_store_errors() {
        let err: SubscriptionError =
            EventStoreError::MalformedDocument("missing specversion".to_string()).into();
        assert!(matches!(err, SubscriptionError::Decode(_)));
    }
}
