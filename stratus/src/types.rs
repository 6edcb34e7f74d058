//! Core identifier and version types for the stratus event store.
//!
//! All identifier types follow the "parse, don't validate" principle: a smart
//! constructor checks the value once, and every holder of the type can rely on
//! it afterwards.

use nutype::nutype;

/// A unique identifier for an event stream.
///
/// A stream is an ordered, append-only sequence of CloudEvents sharing the
/// same `streamid` extension attribute. Stream ids are non-empty, trimmed,
/// and at most 255 characters.
///
/// # Examples
///
/// ```
/// use stratus::StreamId;
///
/// let stream = StreamId::try_new("order-123").expect("valid stream id");
/// assert_eq!(stream.as_ref(), "order-123");
///
/// assert!(StreamId::try_new("").is_err());
/// assert!(StreamId::try_new("a".repeat(256)).is_err());
/// ```
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct StreamId(String);

/// A unique identifier for a change subscription.
///
/// Subscription ids key the durable resume position in position storage, so
/// they must be stable across restarts of the subscribing process.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct SubscriptionId(String);

/// The version of an event stream.
///
/// The version counts *accepted append batches*, not individual events: the
/// first successful write moves a stream from version 0 to 1 regardless of
/// how many events the batch contained. Stores configured without a
/// consistency guarantee always report version 0.
///
/// # Examples
///
/// ```
/// use stratus::StreamVersion;
///
/// let v0 = StreamVersion::initial();
/// let v1 = v0.next();
/// assert_eq!(u64::from(v0), 0);
/// assert_eq!(u64::from(v1), 1);
/// assert!(v1 > v0);
/// ```
#[nutype(
    validate(greater_or_equal = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct StreamVersion(u64);

impl StreamVersion {
    /// The version of a stream that has never accepted a write.
    pub fn initial() -> Self {
        Self::try_new(0).expect("0 is always a valid version")
    }

    /// The version after one more accepted batch.
    #[must_use]
    pub fn next(self) -> Self {
        let current: u64 = self.into();
        Self::try_new(current + 1).expect("incremented version is always valid")
    }
}

impl From<u64> for StreamVersion {
    fn from(value: u64) -> Self {
        Self::try_new(value).expect("all u64 values are valid versions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn stream_id_accepts_reasonable_strings(s in "[a-zA-Z0-9_:-]{1,255}") {
            let stream_id = StreamId::try_new(s.clone());
            prop_assert!(stream_id.is_ok());
            let stream_id = stream_id.unwrap();
            prop_assert_eq!(stream_id.as_ref(), &s);
        }

        #[test]
        fn stream_id_trims_surrounding_whitespace(s in " {0,5}[a-z0-9-]{1,100} {0,5}") {
            let stream_id = StreamId::try_new(s.clone()).unwrap();
            prop_assert_eq!(stream_id.as_ref(), s.trim());
        }

        #[test]
        fn stream_version_next_increments_by_one(v in 0u64..u64::MAX) {
            let version = StreamVersion::from(v);
            prop_assert_eq!(u64::from(version.next()), v + 1);
        }

        #[test]
        fn stream_version_ordering_matches_integers(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(StreamVersion::from(a) < StreamVersion::from(b), a < b);
            prop_assert_eq!(StreamVersion::from(a) == StreamVersion::from(b), a == b);
        }
    }

    #[test]
    fn stream_id_rejects_empty_and_oversized_input() {
        assert!(StreamId::try_new("").is_err());
        assert!(StreamId::try_new("   ").is_err());
        assert!(StreamId::try_new("a".repeat(256)).is_err());
        assert!(StreamId::try_new("a".repeat(255)).is_ok());
    }

    #[test]
    fn subscription_id_rejects_empty_input() {
        assert!(SubscriptionId::try_new("").is_err());
        assert!(SubscriptionId::try_new("  \t").is_err());
        assert!(SubscriptionId::try_new("projection-names").is_ok());
    }

    #[test]
    fn initial_version_is_zero() {
        assert_eq!(u64::from(StreamVersion::initial()), 0);
    }

    #[test]
    fn version_serializes_as_plain_integer() {
        let json = serde_json::to_string(&StreamVersion::from(7)).unwrap();
        assert_eq!(json, "7");
    }
}
