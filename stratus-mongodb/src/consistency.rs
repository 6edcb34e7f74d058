//! Stream-consistency guarantees: how a write batch interacts with the
//! per-stream version document.
//!
//! The guarantee is a strategy picked at configuration time and dispatched
//! on every write:
//!
//! - [`ConsistencyGuarantee::None`] keeps no version bookkeeping at all.
//!   Writes are a single bulk insert, reads report version 0, and any write
//!   condition other than `AnyStreamVersion` is refused.
//! - [`ConsistencyGuarantee::Transactional`] wraps every batch in a
//!   store-managed session transaction: fetch version, evaluate the
//!   condition, insert the events, conditionally advance the version,
//!   commit. A failed insert aborts the transaction and the version is
//!   untouched.
//! - [`ConsistencyGuarantee::TransactionalAnnotation`] runs the same logical
//!   steps but never starts or commits a transaction itself; the caller is
//!   expected to provide one, e.g. through
//!   [`MongoEventStore::write_in_session`]. Without one, a bulk-insert
//!   failure after the version update leaves the version advanced with no
//!   matching events. That anomaly is the documented trade-off of this
//!   guarantee and is asserted by the test suite.

use bson::{doc, Document};
use futures::StreamExt;
use mongodb::{ClientSession, Collection};
use tracing::debug;

use stratus::{EventBatch, EventStoreError, EventStoreResult, StreamId, WriteCondition};

use crate::event_store::{map_mongo_error, MongoEventStore};
use crate::query::version_condition_to_document;

/// Default name of the stream version collection.
pub const DEFAULT_VERSIONS_COLLECTION: &str = "stream-versions";

/// How writes coordinate with the per-stream version document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyGuarantee {
    /// No version bookkeeping and no transactions.
    None,
    /// Store-managed transaction per batch, tracking versions in the named
    /// collection.
    Transactional {
        /// Name of the collection holding `{ streamid, version }` documents.
        version_collection: String,
    },
    /// Version tracking with caller-managed (ambient) transactions.
    TransactionalAnnotation {
        /// Name of the collection holding `{ streamid, version }` documents.
        version_collection: String,
    },
}

impl ConsistencyGuarantee {
    /// Store-managed transactions with the default version collection.
    pub fn transactional() -> Self {
        Self::Transactional {
            version_collection: DEFAULT_VERSIONS_COLLECTION.to_string(),
        }
    }

    /// Caller-managed transactions with the default version collection.
    pub fn transactional_annotation() -> Self {
        Self::TransactionalAnnotation {
            version_collection: DEFAULT_VERSIONS_COLLECTION.to_string(),
        }
    }

    pub(crate) fn version_collection_name(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Transactional { version_collection }
            | Self::TransactionalAnnotation { version_collection } => Some(version_collection),
        }
    }
}

impl Default for ConsistencyGuarantee {
    fn default() -> Self {
        Self::transactional()
    }
}

impl MongoEventStore {
    /// Guarantee-free write: one bulk insert, nothing else.
    pub(crate) async fn write_unguarded(&self, documents: Vec<Document>) -> EventStoreResult<()> {
        self.events
            .insert_many(documents, None)
            .await
            .map_err(map_mongo_error)?;
        Ok(())
    }

    /// Transactional write: fetch, evaluate, insert, advance, commit.
    pub(crate) async fn write_transactional(
        &self,
        stream_id: &StreamId,
        condition: WriteCondition,
        documents: Vec<Document>,
        versions: Collection<Document>,
    ) -> EventStoreResult<()> {
        let mut session = self
            .client
            .start_session(None)
            .await
            .map_err(map_mongo_error)?;
        session
            .start_transaction(None)
            .await
            .map_err(map_mongo_error)?;

        let result = self
            .transactional_steps(&mut session, stream_id, &condition, documents, &versions)
            .await;
        match result {
            Ok(()) => session.commit_transaction().await.map_err(map_mongo_error),
            Err(error) => {
                // The original failure wins over any abort failure.
                if let Err(abort_error) = session.abort_transaction().await {
                    debug!(error = %abort_error, "transaction abort failed");
                }
                Err(error)
            }
        }
    }

    async fn transactional_steps(
        &self,
        session: &mut ClientSession,
        stream_id: &StreamId,
        condition: &WriteCondition,
        documents: Vec<Document>,
        versions: &Collection<Document>,
    ) -> EventStoreResult<()> {
        let current = self
            .version_in_session(versions, session, stream_id)
            .await?;
        let actual = current.unwrap_or(0);
        if !condition.eval(actual) {
            return Err(EventStoreError::WriteConditionNotFulfilled {
                condition: condition.clone(),
                actual,
            });
        }

        self.events
            .insert_many_with_session(documents, None, session)
            .await
            .map_err(map_mongo_error)?;

        self.advance_version_in_session(versions, session, stream_id, condition, current)
            .await
    }

    /// Ambient-transaction write: the same logical steps, without opening a
    /// transaction. The version advances before the insert so that, under a
    /// caller transaction, both roll back together; without one, a failed
    /// insert leaves the version ahead of the events.
    pub(crate) async fn write_annotated(
        &self,
        stream_id: &StreamId,
        condition: WriteCondition,
        documents: Vec<Document>,
        versions: Collection<Document>,
    ) -> EventStoreResult<()> {
        let current = self.version_of(&versions, stream_id).await?;
        let actual = current.unwrap_or(0);
        if !condition.eval(actual) {
            return Err(EventStoreError::WriteConditionNotFulfilled {
                condition,
                actual,
            });
        }

        match current {
            None => {
                versions
                    .insert_one(version_document(stream_id, 1), None)
                    .await
                    .map_err(map_mongo_error)?;
            }
            Some(actual) => {
                let filter = guarded_version_filter(stream_id, &condition)?;
                let update = versions
                    .update_one(filter, version_bump(actual)?, None)
                    .await
                    .map_err(map_mongo_error)?;
                if update.matched_count == 0 {
                    return Err(EventStoreError::WriteConditionNotFulfilled { condition, actual });
                }
            }
        }

        self.events
            .insert_many(documents, None)
            .await
            .map_err(map_mongo_error)?;
        Ok(())
    }

    /// Performs a conditional write inside a caller-provided session,
    /// joining whatever transaction is active on it.
    ///
    /// This is the ambient-transaction path of
    /// [`ConsistencyGuarantee::TransactionalAnnotation`]: open a session,
    /// start a transaction, call this for each write, then commit. The step
    /// order matches [`MongoEventStore::write_annotated`].
    pub async fn write_in_session(
        &self,
        session: &mut ClientSession,
        stream_id: &StreamId,
        condition: WriteCondition,
        events: EventBatch,
    ) -> EventStoreResult<()> {
        self.ensure_schema().await?;

        let Some(versions) = self.version_collection() else {
            if !condition.is_any() {
                return Err(EventStoreError::WriteConditionNotSupported { condition });
            }
            let events: Vec<_> = events.collect().await;
            if events.is_empty() {
                return Ok(());
            }
            let documents = self.encode_batch(stream_id, &events)?;
            self.events
                .insert_many_with_session(documents, None, session)
                .await
                .map_err(map_mongo_error)?;
            return Ok(());
        };

        let events: Vec<_> = events.collect().await;
        if events.is_empty() {
            return Ok(());
        }
        let documents = self.encode_batch(stream_id, &events)?;

        let current = self
            .version_in_session(&versions, session, stream_id)
            .await?;
        let actual = current.unwrap_or(0);
        if !condition.eval(actual) {
            return Err(EventStoreError::WriteConditionNotFulfilled { condition, actual });
        }

        self.advance_version_in_session(&versions, session, stream_id, &condition, current)
            .await?;
        self.events
            .insert_many_with_session(documents, None, session)
            .await
            .map_err(map_mongo_error)?;
        Ok(())
    }

    async fn advance_version_in_session(
        &self,
        versions: &Collection<Document>,
        session: &mut ClientSession,
        stream_id: &StreamId,
        condition: &WriteCondition,
        current: Option<u64>,
    ) -> EventStoreResult<()> {
        match current {
            None => {
                versions
                    .insert_one_with_session(version_document(stream_id, 1), None, session)
                    .await
                    .map_err(map_mongo_error)?;
                Ok(())
            }
            Some(actual) => {
                // The lowered condition makes the update itself conditional,
                // re-stating the in-memory evaluation as a server-side guard.
                let filter = guarded_version_filter(stream_id, condition)?;
                let update = versions
                    .update_one_with_session(filter, version_bump(actual)?, None, session)
                    .await
                    .map_err(map_mongo_error)?;
                if update.matched_count == 0 {
                    return Err(EventStoreError::WriteConditionNotFulfilled {
                        condition: condition.clone(),
                        actual,
                    });
                }
                Ok(())
            }
        }
    }

    pub(crate) async fn version_of(
        &self,
        versions: &Collection<Document>,
        stream_id: &StreamId,
    ) -> EventStoreResult<Option<u64>> {
        let document = versions
            .find_one(doc! { "streamid": stream_id.as_ref() }, None)
            .await
            .map_err(map_mongo_error)?;
        document.map(read_version).transpose()
    }

    pub(crate) async fn version_in_session(
        &self,
        versions: &Collection<Document>,
        session: &mut ClientSession,
        stream_id: &StreamId,
    ) -> EventStoreResult<Option<u64>> {
        let document = versions
            .find_one_with_session(doc! { "streamid": stream_id.as_ref() }, None, session)
            .await
            .map_err(map_mongo_error)?;
        document.map(read_version).transpose()
    }
}

fn version_document(stream_id: &StreamId, version: i64) -> Document {
    doc! { "streamid": stream_id.as_ref(), "version": version }
}

fn version_bump(current: u64) -> EventStoreResult<Document> {
    let next = i64::try_from(current + 1)
        .map_err(|_| EventStoreError::Internal("stream version exceeds the i64 range".to_string()))?;
    Ok(doc! { "$set": { "version": next } })
}

fn read_version(document: Document) -> EventStoreResult<u64> {
    let version = document.get_i64("version").map_err(|e| {
        EventStoreError::MalformedDocument(format!("stream version document: {e}"))
    })?;
    u64::try_from(version)
        .map_err(|_| EventStoreError::MalformedDocument("negative stream version".to_string()))
}

fn guarded_version_filter(
    stream_id: &StreamId,
    condition: &WriteCondition,
) -> EventStoreResult<Document> {
    let base = doc! { "streamid": stream_id.as_ref() };
    match condition {
        WriteCondition::AnyStreamVersion => Ok(base),
        WriteCondition::StreamVersion(version_condition) => Ok(doc! {
            "$and": [base, version_condition_to_document("version", version_condition)?]
        }),
    }
}
