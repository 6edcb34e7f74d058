//! The event store contract: ordered, append-only streams of CloudEvents.
//!
//! Implementations sit on top of a document database. The trait is written
//! against lazy sequences on both sides: writers hand in a stream of events
//! which the store drains fully before committing, and readers get a stream
//! backed by a live cursor that is closed when the sequence is dropped.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::condition::WriteCondition;
use crate::errors::{EventStoreError, EventStoreResult};
use crate::event::CloudEvent;
use crate::types::{StreamId, StreamVersion};

/// A lazy batch of events to append.
pub type EventBatch = BoxStream<'static, CloudEvent>;

/// Builds an [`EventBatch`] from anything iterable.
///
/// # Examples
///
/// ```
/// use stratus::{batch, CloudEvent};
///
/// let events = batch(vec![CloudEvent::new("e1", "s", "t")]);
/// ```
pub fn batch<I>(events: I) -> EventBatch
where
    I: IntoIterator<Item = CloudEvent>,
    I::IntoIter: Send + 'static,
{
    stream::iter(events).boxed()
}

/// The result of reading a stream: its id, current version, and a lazy
/// sequence of events in insertion order.
///
/// The event sequence is single-pass; collect it if you need to iterate
/// twice. Dropping the sequence closes the underlying cursor.
pub struct EventStream {
    /// The stream that was read.
    pub id: StreamId,
    /// The stream version at the time of the read. Always 0 for stores
    /// without a consistency guarantee.
    pub version: StreamVersion,
    /// The events, in insertion order.
    pub events: BoxStream<'static, EventStoreResult<CloudEvent>>,
}

impl EventStream {
    /// Creates an event stream result.
    pub fn new(
        id: StreamId,
        version: StreamVersion,
        events: BoxStream<'static, EventStoreResult<CloudEvent>>,
    ) -> Self {
        Self { id, version, events }
    }

    /// An empty stream at the given version.
    pub fn empty(id: StreamId, version: StreamVersion) -> Self {
        Self::new(id, version, stream::empty().boxed())
    }

    /// Drains the lazy sequence into a vector, failing on the first error.
    pub async fn collect_events(self) -> EventStoreResult<Vec<CloudEvent>> {
        self.events.try_collect().await
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// An append-only store of CloudEvent streams.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends a batch of events to a stream without a concurrency guard.
    ///
    /// Equivalent to [`EventStore::write_conditionally`] with
    /// [`WriteCondition::AnyStreamVersion`]. An empty batch is a no-op and
    /// does not advance the stream version.
    async fn write(&self, stream_id: &StreamId, events: EventBatch) -> EventStoreResult<()> {
        self.write_conditionally(stream_id, WriteCondition::AnyStreamVersion, events)
            .await
    }

    /// Appends a batch of events to a stream, guarded by a write condition.
    ///
    /// The batch is drained completely before anything is committed. Under a
    /// transactional guarantee the batch is all-or-nothing and the stream
    /// version advances by exactly one on success.
    ///
    /// # Errors
    ///
    /// * [`EventStoreError::WriteConditionNotFulfilled`] if the condition
    ///   rejects the current stream version.
    /// * [`EventStoreError::WriteConditionNotSupported`] if a non-trivial
    ///   condition is given to a store without version tracking.
    /// * [`EventStoreError::DuplicateEventId`] if the batch violates the
    ///   `(streamid, id)` uniqueness index.
    async fn write_conditionally(
        &self,
        stream_id: &StreamId,
        condition: WriteCondition,
        events: EventBatch,
    ) -> EventStoreResult<()>;

    /// Reads a whole stream in insertion order.
    ///
    /// A stream that has never been written to yields version 0 and no
    /// events; it is not an error.
    async fn read(&self, stream_id: &StreamId) -> EventStoreResult<EventStream> {
        self.read_slice(stream_id, 0, None).await
    }

    /// Reads a slice of a stream: `skip` events are dropped from the front
    /// of the server-side ordered result and at most `limit` are yielded.
    ///
    /// `skip` beyond the end of the stream yields an empty sequence with the
    /// correct version.
    async fn read_slice(
        &self,
        stream_id: &StreamId,
        skip: u64,
        limit: Option<u64>,
    ) -> EventStoreResult<EventStream>;

    /// Whether any events exist for the stream.
    async fn exists(&self, stream_id: &StreamId) -> EventStoreResult<bool>;

    /// The current version of the stream: 0 if the stream does not exist or
    /// the store is configured without version tracking.
    async fn stream_version(&self, stream_id: &StreamId) -> EventStoreResult<StreamVersion>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_yields_events_in_order() {
        let events: Vec<_> = (0..3)
            .map(|i| CloudEvent::new(format!("e{i}"), "s", "t"))
            .collect();
        let collected: Vec<_> = batch(events.clone()).collect().await;
        assert_eq!(collected, events);
    }

    #[tokio::test]
    async fn empty_event_stream_collects_to_nothing() {
        let stream = EventStream::empty(
            StreamId::try_new("name").unwrap(),
            StreamVersion::initial(),
        );
        assert_eq!(stream.collect_events().await.unwrap(), Vec::new());
    }

    #[test]
    fn debug_output_omits_the_cursor() {
        let stream = EventStream::empty(
            StreamId::try_new("name").unwrap(),
            StreamVersion::from(2),
        );
        let rendered = format!("{stream:?}");
        assert!(rendered.contains("name"));
        assert!(rendered.contains('2'));
    }
}
