//! In-memory backend for the stratus event store.
//!
//! This crate provides in-memory implementations of the `EventStore`,
//! `ChangeFeed`, and `PositionStorage` contracts from the stratus core,
//! useful for tests and development scenarios where persistence is not
//! required.
//!
//! The store keeps a single global log protected by a lock, so every write
//! is atomic: with version tracking enabled it behaves like the
//! transactional document-store backend, and with tracking disabled it
//! mirrors the guarantee-free configuration (version 0 everywhere,
//! non-trivial write conditions rejected).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::Notify;
use tracing::debug;

use stratus::{
    ChangeFeed, ChangeFeedCursor, ChangeFeedEvent, CloudEvent, Comparison, EventBatch, EventStore,
    EventStoreError, EventStoreResult, EventStream, ExtensionValue, Filter, FilterValue,
    PositionStorage, StartAt, StreamId, StreamVersion, SubscriptionError, SubscriptionId,
    SubscriptionPosition, SubscriptionResult, WriteCondition, STREAM_ID_EXTENSION,
    STREAM_POSITION_EXTENSION,
};

/// Whether the in-memory store tracks stream versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyMode {
    /// Track a per-stream batch counter and evaluate write conditions, like
    /// the transactional document-store configuration.
    #[default]
    Tracked,
    /// No version bookkeeping: reads report version 0 and non-trivial write
    /// conditions fail, like the guarantee-free configuration.
    Untracked,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    sequence: u64,
    stream_id: StreamId,
    event: CloudEvent,
}

#[derive(Debug, Default)]
struct SharedState {
    log: Vec<StoredEntry>,
    versions: HashMap<StreamId, u64>,
    event_ids: HashSet<(StreamId, String)>,
}

/// Thread-safe in-memory event store.
///
/// Cloning shares the underlying storage, so a store and the feeds and
/// subscriptions derived from it observe the same log.
#[derive(Clone)]
pub struct InMemoryEventStore {
    state: Arc<RwLock<SharedState>>,
    notify: Arc<Notify>,
    mode: ConsistencyMode,
}

impl InMemoryEventStore {
    /// Creates an empty store with version tracking enabled.
    pub fn new() -> Self {
        Self::with_mode(ConsistencyMode::Tracked)
    }

    /// Creates an empty store with the given consistency mode.
    pub fn with_mode(mode: ConsistencyMode) -> Self {
        Self {
            state: Arc::new(RwLock::new(SharedState::default())),
            notify: Arc::new(Notify::new()),
            mode,
        }
    }

    /// A change feed over this store's log.
    pub fn change_feed(&self) -> InMemoryChangeFeed {
        InMemoryChangeFeed {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn write_conditionally(
        &self,
        stream_id: &StreamId,
        condition: WriteCondition,
        events: EventBatch,
    ) -> EventStoreResult<()> {
        if self.mode == ConsistencyMode::Untracked && !condition.is_any() {
            return Err(EventStoreError::WriteConditionNotSupported { condition });
        }

        // Drain the lazy batch fully before touching the log.
        let events: Vec<CloudEvent> = events.collect().await;
        if events.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write().expect("store lock poisoned");

        let current = state.versions.get(stream_id).copied().unwrap_or(0);
        if !condition.eval(current) {
            return Err(EventStoreError::WriteConditionNotFulfilled {
                condition,
                actual: current,
            });
        }

        // Uniqueness of (streamid, id), including within the batch itself.
        let mut batch_ids = HashSet::new();
        for event in &events {
            let key = (stream_id.clone(), event.id().to_string());
            if state.event_ids.contains(&key) || !batch_ids.insert(key) {
                return Err(EventStoreError::DuplicateEventId(event.id().to_string()));
            }
        }

        for event in events {
            let sequence = state.log.len() as u64 + 1;
            state
                .event_ids
                .insert((stream_id.clone(), event.id().to_string()));
            state.log.push(StoredEntry {
                sequence,
                stream_id: stream_id.clone(),
                event,
            });
        }

        if self.mode == ConsistencyMode::Tracked {
            state.versions.insert(stream_id.clone(), current + 1);
        }
        drop(state);

        debug!(stream = %stream_id, "appended batch");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn read_slice(
        &self,
        stream_id: &StreamId,
        skip: u64,
        limit: Option<u64>,
    ) -> EventStoreResult<EventStream> {
        let state = self.state.read().expect("store lock poisoned");

        let version = match self.mode {
            ConsistencyMode::Tracked => state.versions.get(stream_id).copied().unwrap_or(0),
            ConsistencyMode::Untracked => 0,
        };

        let events: Vec<EventStoreResult<CloudEvent>> = state
            .log
            .iter()
            .filter(|entry| &entry.stream_id == stream_id)
            .skip(usize::try_from(skip).unwrap_or(usize::MAX))
            .take(limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX)))
            .map(|entry| Ok(entry.event.clone()))
            .collect();

        Ok(EventStream::new(
            stream_id.clone(),
            StreamVersion::from(version),
            stream::iter(events).boxed(),
        ))
    }

    async fn exists(&self, stream_id: &StreamId) -> EventStoreResult<bool> {
        let state = self.state.read().expect("store lock poisoned");
        Ok(state.log.iter().any(|entry| &entry.stream_id == stream_id))
    }

    async fn stream_version(&self, stream_id: &StreamId) -> EventStoreResult<StreamVersion> {
        let state = self.state.read().expect("store lock poisoned");
        let version = match self.mode {
            ConsistencyMode::Tracked => state.versions.get(stream_id).copied().unwrap_or(0),
            ConsistencyMode::Untracked => 0,
        };
        Ok(StreamVersion::from(version))
    }
}

/// A change feed over an [`InMemoryEventStore`]'s log.
#[derive(Clone)]
pub struct InMemoryChangeFeed {
    state: Arc<RwLock<SharedState>>,
    notify: Arc<Notify>,
}

fn encode_position(sequence: u64) -> SubscriptionPosition {
    SubscriptionPosition::from_bytes(sequence.to_be_bytes().to_vec())
}

fn decode_position(position: &SubscriptionPosition) -> SubscriptionResult<u64> {
    let bytes: [u8; 8] = position
        .as_bytes()
        .try_into()
        .map_err(|_| SubscriptionError::Feed("invalid in-memory feed position".to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    type Cursor = InMemoryChangeFeedCursor;

    async fn open(
        &self,
        start_at: &StartAt,
        filter: Option<&Filter>,
    ) -> SubscriptionResult<Self::Cursor> {
        if let Some(filter) = filter {
            reject_raw(filter)?;
        }
        let last_seen = match start_at {
            StartAt::Now => self.state.read().expect("store lock poisoned").log.len() as u64,
            StartAt::Position(position) => decode_position(position)?,
        };
        Ok(InMemoryChangeFeedCursor {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            filter: filter.cloned(),
            last_seen,
        })
    }

    async fn current_position(&self) -> SubscriptionResult<SubscriptionPosition> {
        let sequence = self.state.read().expect("store lock poisoned").log.len() as u64;
        Ok(encode_position(sequence))
    }
}

/// An open cursor over the in-memory log: replays history past the start
/// position, then waits for new appends.
pub struct InMemoryChangeFeedCursor {
    state: Arc<RwLock<SharedState>>,
    notify: Arc<Notify>,
    filter: Option<Filter>,
    last_seen: u64,
}

#[async_trait]
impl ChangeFeedCursor for InMemoryChangeFeedCursor {
    async fn next(&mut self) -> SubscriptionResult<Option<ChangeFeedEvent>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.read().expect("store lock poisoned");
                for entry in &state.log {
                    if entry.sequence <= self.last_seen {
                        continue;
                    }
                    self.last_seen = entry.sequence;
                    if let Some(filter) = &self.filter {
                        if !matches_filter(filter, &entry.stream_id, &entry.event) {
                            continue;
                        }
                    }
                    let position = encode_position(entry.sequence);
                    let event = entry
                        .event
                        .clone()
                        .with_extension(STREAM_ID_EXTENSION, entry.stream_id.as_ref())
                        .with_extension(STREAM_POSITION_EXTENSION, position.to_base64());
                    return Ok(Some(ChangeFeedEvent { event, position }));
                }
            }
            notified.await;
        }
    }

    fn position(&self) -> Option<SubscriptionPosition> {
        (self.last_seen > 0).then(|| encode_position(self.last_seen))
    }
}

fn reject_raw(filter: &Filter) -> SubscriptionResult<()> {
    match filter {
        Filter::Raw(_) => Err(SubscriptionError::Feed(
            "raw filter expressions are not supported by the in-memory feed".to_string(),
        )),
        Filter::All(children) | Filter::Any(children) => {
            children.iter().try_for_each(reject_raw)
        }
        Filter::Attribute { .. } => Ok(()),
    }
}

/// Evaluates the structured filter DSL against an event in the log.
fn matches_filter(filter: &Filter, stream_id: &StreamId, event: &CloudEvent) -> bool {
    match filter {
        Filter::All(children) => children
            .iter()
            .all(|child| matches_filter(child, stream_id, event)),
        Filter::Any(children) => children
            .iter()
            .any(|child| matches_filter(child, stream_id, event)),
        Filter::Attribute { name, op, value } => {
            attribute_ordering(name, value, stream_id, event).is_some_and(|ordering| match op {
                Comparison::Eq => ordering == CmpOrdering::Equal,
                Comparison::Ne => ordering != CmpOrdering::Equal,
                Comparison::Lt => ordering == CmpOrdering::Less,
                Comparison::Gt => ordering == CmpOrdering::Greater,
                Comparison::Lte => ordering != CmpOrdering::Greater,
                Comparison::Gte => ordering != CmpOrdering::Less,
            })
        }
        // Rejected at open time.
        Filter::Raw(_) => false,
    }
}

/// Compares the named attribute of `event` with the filter value. `None`
/// when the attribute is absent or of an incomparable type; such events
/// never match.
fn attribute_ordering(
    name: &str,
    value: &FilterValue,
    stream_id: &StreamId,
    event: &CloudEvent,
) -> Option<CmpOrdering> {
    match name {
        "id" => compare_str(event.id(), value),
        "type" => compare_str(event.event_type(), value),
        "source" => compare_str(event.source(), value),
        "subject" => compare_str(event.subject()?, value),
        "time" => {
            let FilterValue::Time(expected) = value else {
                return None;
            };
            event.time()?.partial_cmp(expected)
        }
        STREAM_ID_EXTENSION => compare_str(stream_id.as_ref(), value),
        extension => match (event.extension(extension)?, value) {
            (ExtensionValue::String(actual), FilterValue::String(expected)) => {
                Some(actual.as_str().cmp(expected.as_str()))
            }
            (ExtensionValue::Integer(actual), FilterValue::Integer(expected)) => {
                Some(actual.cmp(expected))
            }
            (ExtensionValue::Boolean(actual), FilterValue::Boolean(expected)) => {
                Some(actual.cmp(expected))
            }
            _ => None,
        },
    }
}

fn compare_str(actual: &str, value: &FilterValue) -> Option<CmpOrdering> {
    let FilterValue::String(expected) = value else {
        return None;
    };
    Some(actual.cmp(expected.as_str()))
}

/// In-memory position storage.
#[derive(Clone, Default)]
pub struct InMemoryPositionStorage {
    positions: Arc<Mutex<HashMap<SubscriptionId, SubscriptionPosition>>>,
}

impl InMemoryPositionStorage {
    /// Creates empty position storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStorage for InMemoryPositionStorage {
    async fn read(&self, id: &SubscriptionId) -> SubscriptionResult<Option<SubscriptionPosition>> {
        Ok(self
            .positions
            .lock()
            .expect("position lock poisoned")
            .get(id)
            .cloned())
    }

    async fn save(
        &self,
        id: &SubscriptionId,
        position: &SubscriptionPosition,
    ) -> SubscriptionResult<()> {
        self.positions
            .lock()
            .expect("position lock poisoned")
            .insert(id.clone(), position.clone());
        Ok(())
    }

    async fn delete(&self, id: &SubscriptionId) -> SubscriptionResult<()> {
        self.positions
            .lock()
            .expect("position lock poisoned")
            .remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus::batch;

    fn stream(name: &str) -> StreamId {
        StreamId::try_new(name).unwrap()
    }

    fn name_defined(id: &str, name: &str) -> CloudEvent {
        CloudEvent::new(id, "https://example.org/names", "NameDefined")
            .with_subject("name")
            .with_data(stratus::EventData::Json(serde_json::json!({ "name": name })))
    }

    #[tokio::test]
    async fn untracked_store_round_trips_a_single_event() {
        let store = InMemoryEventStore::with_mode(ConsistencyMode::Untracked);
        let event = name_defined("e1", "John Doe");

        store
            .write(&stream("name"), batch(vec![event.clone()]))
            .await
            .unwrap();

        let result = store.read(&stream("name")).await.unwrap();
        assert_eq!(u64::from(result.version), 0);
        assert_eq!(result.collect_events().await.unwrap(), vec![event]);
    }

    #[tokio::test]
    async fn untracked_store_rejects_non_trivial_conditions() {
        let store = InMemoryEventStore::with_mode(ConsistencyMode::Untracked);
        let err = store
            .write_conditionally(
                &stream("name"),
                WriteCondition::stream_version_eq(0),
                batch(vec![name_defined("e1", "John Doe")]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::WriteConditionNotSupported { .. }));
    }

    #[tokio::test]
    async fn reads_are_snapshots_of_the_moment_they_were_taken() {
        let store = InMemoryEventStore::with_mode(ConsistencyMode::Untracked);
        let (a, b, c) = (
            name_defined("a", "A"),
            name_defined("b", "B"),
            name_defined("c", "C"),
        );
        store
            .write(&stream("name"), batch(vec![a.clone(), b.clone()]))
            .await
            .unwrap();

        let snapshot = store.read(&stream("name")).await.unwrap();
        store.write(&stream("name"), batch(vec![c])).await.unwrap();

        assert_eq!(u64::from(snapshot.version), 0);
        assert_eq!(snapshot.collect_events().await.unwrap(), vec![a, b]);
    }

    #[tokio::test]
    async fn version_increments_once_per_batch() {
        let store = InMemoryEventStore::new();
        let id = stream("name");
        let (a, b, c) = (
            name_defined("a", "A"),
            name_defined("b", "B"),
            name_defined("c", "C"),
        );

        for (version, event) in [(0, a.clone()), (1, b.clone()), (2, c.clone())] {
            store
                .write_conditionally(
                    &id,
                    WriteCondition::stream_version_eq(version),
                    batch(vec![event]),
                )
                .await
                .unwrap();
        }

        let result = store.read(&id).await.unwrap();
        assert_eq!(u64::from(result.version), 3);
        assert_eq!(result.collect_events().await.unwrap(), vec![a, b, c]);
    }

    #[tokio::test]
    async fn condition_violation_reports_the_canonical_message() {
        let store = InMemoryEventStore::new();
        let id = stream("name");
        for (version, event_id) in [(0, "a"), (1, "b"), (2, "c")] {
            store
                .write_conditionally(
                    &id,
                    WriteCondition::stream_version_eq(version),
                    batch(vec![name_defined(event_id, "X")]),
                )
                .await
                .unwrap();
        }

        let err = store
            .write_conditionally(
                &id,
                WriteCondition::stream_version_eq(10),
                batch(vec![name_defined("d", "D")]),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "WriteCondition was not fulfilled. Expected version to be equal to 10 but was 3."
        );
        assert_eq!(u64::from(store.stream_version(&id).await.unwrap()), 3);
        assert_eq!(store.read(&id).await.unwrap().collect_events().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn composite_conditions_accept_and_reject_with_exact_messages() {
        use stratus::VersionCondition;

        let store = InMemoryEventStore::new();
        let id = stream("name");
        store
            .write_conditionally(
                &id,
                WriteCondition::stream_version_eq(0),
                batch(vec![name_defined("a", "A")]),
            )
            .await
            .unwrap();

        let accepting = WriteCondition::stream_version(VersionCondition::and(vec![
            VersionCondition::Gte(0),
            VersionCondition::Lt(100),
            VersionCondition::Ne(40),
        ]));
        store
            .write_conditionally(&id, accepting, batch(vec![name_defined("b", "B")]))
            .await
            .unwrap();

        // Version is now 2; use a composite rejecting version 2.
        let rejecting = WriteCondition::stream_version(VersionCondition::and(vec![
            VersionCondition::Gte(0),
            VersionCondition::Lt(100),
            VersionCondition::Ne(2),
        ]));
        let err = store
            .write_conditionally(&id, rejecting, batch(vec![name_defined("c", "C")]))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "WriteCondition was not fulfilled. Expected version to be greater than or equal to 0 \
             and to be less than 100 and to not be equal to 2 but was 2."
        );
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_rejected_atomically() {
        let store = InMemoryEventStore::new();
        let id = stream("name");
        store
            .write(&id, batch(vec![name_defined("e1", "A")]))
            .await
            .unwrap();

        let err = store
            .write(
                &id,
                batch(vec![name_defined("e2", "B"), name_defined("e1", "dup")]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::DuplicateEventId(_)));

        // Nothing from the failed batch is visible and the version is unchanged.
        let result = store.read(&id).await.unwrap();
        assert_eq!(u64::from(result.version), 1);
        assert_eq!(result.collect_events().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_event_id_on_different_streams_is_allowed() {
        let store = InMemoryEventStore::new();
        store
            .write(&stream("a"), batch(vec![name_defined("e1", "A")]))
            .await
            .unwrap();
        store
            .write(&stream("b"), batch(vec![name_defined("e1", "B")]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_batches_do_not_advance_the_version() {
        let store = InMemoryEventStore::new();
        let id = stream("name");
        store.write(&id, batch(Vec::new())).await.unwrap();
        assert_eq!(u64::from(store.stream_version(&id).await.unwrap()), 0);
        assert!(!store.exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn skip_and_limit_slice_the_ordered_result() {
        let store = InMemoryEventStore::new();
        let id = stream("name");
        let events: Vec<_> = (0..5).map(|i| name_defined(&format!("e{i}"), "X")).collect();
        store.write(&id, batch(events.clone())).await.unwrap();

        let slice = store.read_slice(&id, 1, Some(2)).await.unwrap();
        assert_eq!(
            slice.collect_events().await.unwrap(),
            events[1..3].to_vec()
        );

        let beyond = store.read_slice(&id, 10, None).await.unwrap();
        assert_eq!(u64::from(beyond.version), 1);
        assert!(beyond.collect_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reading_a_missing_stream_is_not_an_error() {
        let store = InMemoryEventStore::new();
        let result = store.read(&stream("missing")).await.unwrap();
        assert_eq!(u64::from(result.version), 0);
        assert!(result.collect_events().await.unwrap().is_empty());
        assert!(!store.exists(&stream("missing")).await.unwrap());
    }

    #[tokio::test]
    async fn feed_replays_inserts_with_stream_identity_and_position() {
        let store = InMemoryEventStore::new();
        store
            .write(&stream("name"), batch(vec![name_defined("e1", "A")]))
            .await
            .unwrap();

        let feed = store.change_feed();
        let mut cursor = feed
            .open(&StartAt::Position(encode_position(0)), None)
            .await
            .unwrap();
        let delivered = cursor.next().await.unwrap().unwrap();

        assert_eq!(delivered.event.id(), "e1");
        assert_eq!(
            delivered
                .event
                .extension(STREAM_ID_EXTENSION)
                .and_then(ExtensionValue::as_str),
            Some("name")
        );
        assert_eq!(
            delivered
                .event
                .extension(STREAM_POSITION_EXTENSION)
                .and_then(ExtensionValue::as_str),
            Some(delivered.position.to_base64().as_str())
        );
    }

    #[tokio::test]
    async fn feed_filters_are_applied_server_side() {
        let store = InMemoryEventStore::new();
        store
            .write(
                &stream("name"),
                batch(vec![
                    name_defined("e1", "A"),
                    CloudEvent::new("e2", "https://example.org/names", "NameRemoved"),
                ]),
            )
            .await
            .unwrap();

        let feed = store.change_feed();
        let filter = Filter::event_type(stratus::Comparison::Eq, "NameRemoved");
        let mut cursor = feed
            .open(&StartAt::Position(encode_position(0)), Some(&filter))
            .await
            .unwrap();
        let delivered = cursor.next().await.unwrap().unwrap();
        assert_eq!(delivered.event.id(), "e2");
    }

    #[tokio::test]
    async fn feed_rejects_raw_filters() {
        let store = InMemoryEventStore::new();
        let feed = store.change_feed();
        let err = feed
            .open(&StartAt::now(), Some(&Filter::raw("{}")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SubscriptionError::Feed(_)));
    }

    #[tokio::test]
    async fn position_storage_overwrites_and_deletes() {
        let storage = InMemoryPositionStorage::new();
        let id = SubscriptionId::try_new("projection").unwrap();

        assert!(storage.read(&id).await.unwrap().is_none());
        storage.save(&id, &encode_position(1)).await.unwrap();
        storage.save(&id, &encode_position(2)).await.unwrap();
        assert_eq!(storage.read(&id).await.unwrap(), Some(encode_position(2)));
        storage.delete(&id).await.unwrap();
        assert!(storage.read(&id).await.unwrap().is_none());
        // Deleting again is fine.
        storage.delete(&id).await.unwrap();
    }
}
