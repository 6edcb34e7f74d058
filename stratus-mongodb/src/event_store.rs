//! The MongoDB event store.

use std::sync::Arc;

use bson::{doc, Document};
use futures::stream::StreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOptions, IndexOptions};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use async_trait::async_trait;
use stratus::{
    CloudEvent, EventBatch, EventFormat, EventStore, EventStoreError, EventStoreResult,
    EventStream, JsonEventFormat, StreamId, StreamVersion, WriteCondition, STREAM_ID_EXTENSION,
};

use crate::change_feed::MongoChangeFeed;
use crate::consistency::ConsistencyGuarantee;
use crate::document::{document_to_event, event_to_document, TimeRepresentation};
use crate::position::MongoPositionStorage;

/// Default name of the events collection.
pub const DEFAULT_EVENTS_COLLECTION: &str = "events";

/// Configuration for a [`MongoEventStore`].
#[derive(Debug, Clone)]
pub struct MongoEventStoreConfig {
    /// Name of the collection holding event documents.
    pub events_collection: String,
    /// How the `time` attribute is persisted.
    pub time_representation: TimeRepresentation,
    /// How writes coordinate with stream versions.
    pub guarantee: ConsistencyGuarantee,
}

impl Default for MongoEventStoreConfig {
    fn default() -> Self {
        Self {
            events_collection: DEFAULT_EVENTS_COLLECTION.to_string(),
            time_representation: TimeRepresentation::default(),
            guarantee: ConsistencyGuarantee::default(),
        }
    }
}

/// An event store backed by MongoDB.
///
/// Events live as documents in a single collection; insertion order within a
/// stream is preserved by the write-time-assigned `_id`, which reads sort
/// on. On first use the store ensures a unique index over
/// `(streamid, id)`, and over `streamid` in the version collection when the
/// configured guarantee tracks versions.
///
/// # Examples
///
/// ```rust,ignore
/// use mongodb::Client;
/// use stratus_mongodb::MongoEventStore;
///
/// let client = Client::with_uri_str("mongodb://localhost:27017").await?;
/// let store = MongoEventStore::new(client, "events-db");
/// ```
#[derive(Clone)]
pub struct MongoEventStore {
    pub(crate) client: Client,
    pub(crate) database: Database,
    pub(crate) events: Collection<Document>,
    pub(crate) format: Arc<dyn EventFormat>,
    pub(crate) config: MongoEventStoreConfig,
    bootstrap: Arc<OnceCell<()>>,
}

impl MongoEventStore {
    /// Creates a store with the default configuration: RFC 3339 times and
    /// store-managed transactions.
    pub fn new(client: Client, database_name: &str) -> Self {
        Self::with_config(client, database_name, MongoEventStoreConfig::default())
    }

    /// Creates a store with a custom configuration.
    pub fn with_config(client: Client, database_name: &str, config: MongoEventStoreConfig) -> Self {
        let database = client.database(database_name);
        let events = database.collection::<Document>(&config.events_collection);
        Self {
            client,
            database,
            events,
            format: Arc::new(JsonEventFormat),
            config,
            bootstrap: Arc::new(OnceCell::new()),
        }
    }

    /// Replaces the event format used to serialize and deserialize events.
    #[must_use]
    pub fn with_event_format(mut self, format: Arc<dyn EventFormat>) -> Self {
        self.format = format;
        self
    }

    /// A change feed over this store's events collection.
    pub fn change_feed(&self) -> MongoChangeFeed {
        MongoChangeFeed::new(
            self.events.clone(),
            Arc::clone(&self.format),
            self.config.time_representation,
        )
    }

    /// Subscription position storage in this store's database.
    pub fn position_storage(&self, collection_name: &str) -> MongoPositionStorage {
        MongoPositionStorage::new(&self.database, collection_name)
    }

    /// Reads a stream inside a caller-provided session, so the version and
    /// the events come from the same point-in-time snapshot when a
    /// transaction is active on the session.
    pub async fn read_in_session(
        &self,
        session: &mut ClientSession,
        stream_id: &StreamId,
    ) -> EventStoreResult<EventStream> {
        self.ensure_schema().await?;

        let version = match self.version_collection() {
            Some(versions) => self
                .version_in_session(&versions, session, stream_id)
                .await?
                .unwrap_or(0),
            None => 0,
        };

        let options = FindOptions::builder().sort(doc! { "_id": 1 }).build();
        let mut cursor = self
            .events
            .find_with_session(
                doc! { STREAM_ID_EXTENSION: stream_id.as_ref() },
                options,
                session,
            )
            .await
            .map_err(map_mongo_error)?;

        let mut events = Vec::new();
        while let Some(document) = cursor.next(session).await {
            let document = document.map_err(map_mongo_error)?;
            events.push(Ok(document_to_event(
                self.format.as_ref(),
                self.config.time_representation,
                document,
            )?));
        }

        Ok(EventStream::new(
            stream_id.clone(),
            StreamVersion::from(version),
            futures::stream::iter(events).boxed(),
        ))
    }

    pub(crate) fn version_collection(&self) -> Option<Collection<Document>> {
        self.config
            .guarantee
            .version_collection_name()
            .map(|name| self.database.collection::<Document>(name))
    }

    pub(crate) fn encode_batch(
        &self,
        stream_id: &StreamId,
        events: &[CloudEvent],
    ) -> EventStoreResult<Vec<Document>> {
        events
            .iter()
            .map(|event| {
                event_to_document(
                    self.format.as_ref(),
                    self.config.time_representation,
                    stream_id,
                    event,
                )
            })
            .collect()
    }

    /// Ensures the unique indexes exist, once per store instance.
    pub(crate) async fn ensure_schema(&self) -> EventStoreResult<()> {
        self.bootstrap
            .get_or_try_init(|| async { self.create_indexes().await })
            .await?;
        Ok(())
    }

    async fn create_indexes(&self) -> EventStoreResult<()> {
        let event_index = IndexModel::builder()
            .keys(doc! { STREAM_ID_EXTENSION: 1, "id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.events
            .create_index(event_index, None)
            .await
            .map_err(map_mongo_error)?;

        if let Some(versions) = self.version_collection() {
            let version_index = IndexModel::builder()
                .keys(doc! { "streamid": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build();
            versions
                .create_index(version_index, None)
                .await
                .map_err(map_mongo_error)?;
        }

        debug!(collection = self.config.events_collection, "indexes ensured");
        Ok(())
    }

    async fn current_version(&self, stream_id: &StreamId) -> EventStoreResult<u64> {
        match self.version_collection() {
            Some(versions) => Ok(self.version_of(&versions, stream_id).await?.unwrap_or(0)),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl EventStore for MongoEventStore {
    #[instrument(skip(self, events), fields(stream = %stream_id))]
    async fn write_conditionally(
        &self,
        stream_id: &StreamId,
        condition: WriteCondition,
        events: EventBatch,
    ) -> EventStoreResult<()> {
        if self.version_collection().is_none() && !condition.is_any() {
            return Err(EventStoreError::WriteConditionNotSupported { condition });
        }
        self.ensure_schema().await?;

        // Drain the lazy batch fully before committing anything.
        let events: Vec<CloudEvent> = events.collect().await;
        if events.is_empty() {
            debug!("empty batch, version unchanged");
            return Ok(());
        }
        let documents = self.encode_batch(stream_id, &events)?;
        debug!(count = documents.len(), "appending batch");

        match self.version_collection() {
            None => self.write_unguarded(documents).await,
            Some(versions) => match self.config.guarantee {
                ConsistencyGuarantee::TransactionalAnnotation { .. } => {
                    self.write_annotated(stream_id, condition, documents, versions)
                        .await
                }
                _ => {
                    self.write_transactional(stream_id, condition, documents, versions)
                        .await
                }
            },
        }
    }

    #[instrument(skip(self), fields(stream = %stream_id))]
    async fn read_slice(
        &self,
        stream_id: &StreamId,
        skip: u64,
        limit: Option<u64>,
    ) -> EventStoreResult<EventStream> {
        self.ensure_schema().await?;

        let version = self.current_version(stream_id).await?;

        let limit = limit
            .map(i64::try_from)
            .transpose()
            .map_err(|_| EventStoreError::Internal("read limit exceeds the i64 range".to_string()))?;
        let options = FindOptions::builder()
            .sort(doc! { "_id": 1 })
            .skip(skip)
            .limit(limit)
            .build();
        let cursor = self
            .events
            .find(doc! { STREAM_ID_EXTENSION: stream_id.as_ref() }, options)
            .await
            .map_err(map_mongo_error)?;

        let format = Arc::clone(&self.format);
        let time_representation = self.config.time_representation;
        let events = cursor
            .map(move |document| match document {
                Ok(document) => document_to_event(format.as_ref(), time_representation, document),
                Err(error) => Err(map_mongo_error(error)),
            })
            .boxed();

        Ok(EventStream::new(
            stream_id.clone(),
            StreamVersion::from(version),
            events,
        ))
    }

    #[instrument(skip(self), fields(stream = %stream_id))]
    async fn exists(&self, stream_id: &StreamId) -> EventStoreResult<bool> {
        self.ensure_schema().await?;
        let found = self
            .events
            .find_one(doc! { STREAM_ID_EXTENSION: stream_id.as_ref() }, None)
            .await
            .map_err(map_mongo_error)?;
        Ok(found.is_some())
    }

    #[instrument(skip(self), fields(stream = %stream_id))]
    async fn stream_version(&self, stream_id: &StreamId) -> EventStoreResult<StreamVersion> {
        self.ensure_schema().await?;
        Ok(StreamVersion::from(self.current_version(stream_id).await?))
    }
}

/// Maps a driver error into the store's error taxonomy.
///
/// Uniqueness violations on `(streamid, id)` surface as duplicate event
/// ids with the server's message kept verbatim; connection-level and
/// transient-transaction faults surface as retriable unavailability.
pub(crate) fn map_mongo_error(error: mongodb::error::Error) -> EventStoreError {
    if let Some(message) = duplicate_key_message(&error) {
        return EventStoreError::DuplicateEventId(message);
    }
    match error.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => {
            EventStoreError::Unavailable(error.to_string())
        }
        _ if error.contains_label("TransientTransactionError") => {
            EventStoreError::Unavailable(error.to_string())
        }
        _ => EventStoreError::Internal(error.to_string()),
    }
}

fn duplicate_key_message(error: &mongodb::error::Error) -> Option<String> {
    const DUPLICATE_KEY: i32 = 11000;
    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error))
            if write_error.code == DUPLICATE_KEY =>
        {
            Some(write_error.message.clone())
        }
        ErrorKind::BulkWrite(failure) => failure.write_errors.as_ref().and_then(|write_errors| {
            write_errors
                .iter()
                .find(|write_error| write_error.code == DUPLICATE_KEY)
                .map(|write_error| write_error.message.clone())
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_the_default_collection_and_guarantee() {
        let config = MongoEventStoreConfig::default();
        assert_eq!(config.events_collection, DEFAULT_EVENTS_COLLECTION);
        assert_eq!(config.time_representation, TimeRepresentation::Rfc3339String);
        assert!(matches!(
            config.guarantee,
            ConsistencyGuarantee::Transactional { .. }
        ));
    }
}
