//! Change subscription contracts: positions, feeds, storage, and actions.
//!
//! A subscription tails the global feed of inserted events. The engine in
//! [`crate::subscription_engine`] drives the pieces defined here: a
//! [`ChangeFeed`] producing events with opaque resume positions, a
//! [`PositionStorage`] holding each subscription's durable resume point, and
//! a [`SubscriptionAction`] invoked for every delivered event.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::errors::{EventStoreError, EventStoreResult, SubscriptionResult};
use crate::event::CloudEvent;
use crate::filter::Filter;
use crate::types::SubscriptionId;

/// An opaque position in the change feed.
///
/// Positions are resume tokens issued by the underlying store. They are
/// never interpreted, only stored and replayed byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubscriptionPosition(Vec<u8>);

impl SubscriptionPosition {
    /// Wraps raw resume-token bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The raw resume-token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the position, returning the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Encodes the position for transport in a CloudEvent extension
    /// attribute.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    /// Decodes a position previously produced by
    /// [`SubscriptionPosition::to_base64`].
    pub fn from_base64(encoded: &str) -> EventStoreResult<Self> {
        BASE64
            .decode(encoded)
            .map(Self)
            .map_err(|e| EventStoreError::DeserializationFailed(format!("invalid position: {e}")))
    }
}

/// Where a subscription starts when it has no persisted position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartAt {
    /// Start at the current tail of the feed: only events inserted after the
    /// subscription opens are delivered.
    Now,
    /// Resume from a previously obtained position.
    Position(SubscriptionPosition),
}

impl StartAt {
    /// Start at the current tail of the feed.
    pub const fn now() -> Self {
        Self::Now
    }

    /// Resume from the given position.
    pub const fn subscription_position(position: SubscriptionPosition) -> Self {
        Self::Position(position)
    }
}

/// An event delivered by a change feed, paired with the resume position of
/// the notification that carried it.
#[derive(Debug, Clone)]
pub struct ChangeFeedEvent {
    /// The decoded CloudEvent, with `streamid` and `streamposition`
    /// extension attributes attached.
    pub event: CloudEvent,
    /// The position to resume from after this event is handled.
    pub position: SubscriptionPosition,
}

/// A feed of insert notifications from the underlying document store.
#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    /// The cursor type produced by [`ChangeFeed::open`].
    type Cursor: ChangeFeedCursor;

    /// Opens a cursor, optionally resuming from a position and restricted by
    /// a server-side filter.
    async fn open(
        &self,
        start_at: &StartAt,
        filter: Option<&Filter>,
    ) -> SubscriptionResult<Self::Cursor>;

    /// The feed's current tail position, used to anchor `StartAt::Now`
    /// subscriptions before their first delivery.
    async fn current_position(&self) -> SubscriptionResult<SubscriptionPosition>;
}

/// An open change-feed cursor.
#[async_trait]
pub trait ChangeFeedCursor: Send {
    /// Waits for the next inserted event.
    ///
    /// `Ok(None)` means the cursor closed; the caller decides whether to
    /// reopen from the last position.
    async fn next(&mut self) -> SubscriptionResult<Option<ChangeFeedEvent>>;

    /// The most recent resume position observed on this cursor, if any.
    fn position(&self) -> Option<SubscriptionPosition>;
}

/// Durable storage of subscription resume positions.
///
/// Each subscription writes only its own key, so implementations need no
/// cross-key ordering guarantees, but `save` must atomically overwrite.
#[async_trait]
pub trait PositionStorage: Send + Sync + 'static {
    /// The persisted position for a subscription, if any.
    async fn read(&self, id: &SubscriptionId) -> SubscriptionResult<Option<SubscriptionPosition>>;

    /// Persists the position, overwriting any previous value.
    async fn save(
        &self,
        id: &SubscriptionId,
        position: &SubscriptionPosition,
    ) -> SubscriptionResult<()>;

    /// Deletes the persisted position. Deleting a missing position is not an
    /// error.
    async fn delete(&self, id: &SubscriptionId) -> SubscriptionResult<()>;
}

/// The error type user callbacks may fail with.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// The user callback invoked for every delivered event.
///
/// A failing callback is retried with the same event under the engine's
/// retry strategy; the position is not persisted until the callback returns
/// successfully. Closures returning a future implement this trait directly.
#[async_trait]
pub trait SubscriptionAction: Send + Sync + 'static {
    /// Handles one delivered event.
    async fn handle(&self, event: CloudEvent) -> Result<(), ActionError>;
}

#[async_trait]
impl<F, Fut> SubscriptionAction for F
where
    F: Fn(CloudEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), ActionError>> + Send + 'static,
{
    async fn handle(&self, event: CloudEvent) -> Result<(), ActionError> {
        (self)(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_round_trip_through_base64() {
        let position = SubscriptionPosition::from_bytes(vec![0x82, 0x00, 0xff, 0x10]);
        let encoded = position.to_base64();
        assert_eq!(SubscriptionPosition::from_base64(&encoded).unwrap(), position);
    }

    #[test]
    fn invalid_base64_positions_are_rejected() {
        assert!(SubscriptionPosition::from_base64("not base64!").is_err());
    }

    #[test]
    fn start_at_constructors_match_variants() {
        assert_eq!(StartAt::now(), StartAt::Now);
        let position = SubscriptionPosition::from_bytes(vec![1]);
        assert_eq!(
            StartAt::subscription_position(position.clone()),
            StartAt::Position(position)
        );
    }

    #[tokio::test]
    async fn closures_implement_subscription_action() {
        let action = |_event: CloudEvent| async move { Ok::<(), ActionError>(()) };
        let result = action.handle(CloudEvent::new("e1", "s", "t")).await;
        assert!(result.is_ok());
    }
}
