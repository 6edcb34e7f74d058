//! Change-stream adapter: MongoDB change events as a stratus change feed.
//!
//! The feed watches the events collection, keeps only inserts, decodes each
//! inserted document through the document mapper, and pairs it with the
//! notification's resume token. Tokens are opaque: they are serialized to
//! bytes for storage and deserialized back when a subscription resumes,
//! never inspected.

use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Document};
use futures::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::options::ChangeStreamOptions;
use mongodb::Collection;

use stratus::{
    ChangeFeed, ChangeFeedCursor, ChangeFeedEvent, EventFormat, Filter, StartAt,
    SubscriptionError, SubscriptionPosition, SubscriptionResult, STREAM_ID_EXTENSION,
    STREAM_POSITION_EXTENSION,
};

use crate::document::{document_to_event, TimeRepresentation};
use crate::query::filter_to_match_document;

/// A change feed over a MongoDB events collection.
#[derive(Clone)]
pub struct MongoChangeFeed {
    events: Collection<Document>,
    format: Arc<dyn EventFormat>,
    time_representation: TimeRepresentation,
}

impl MongoChangeFeed {
    pub(crate) fn new(
        events: Collection<Document>,
        format: Arc<dyn EventFormat>,
        time_representation: TimeRepresentation,
    ) -> Self {
        Self {
            events,
            format,
            time_representation,
        }
    }
}

fn resume_token_to_position(token: &ResumeToken) -> SubscriptionResult<SubscriptionPosition> {
    bson::to_vec(token)
        .map(SubscriptionPosition::from_bytes)
        .map_err(|e| SubscriptionError::Feed(format!("unreadable resume token: {e}")))
}

fn position_to_resume_token(position: &SubscriptionPosition) -> SubscriptionResult<ResumeToken> {
    bson::from_slice(position.as_bytes())
        .map_err(|e| SubscriptionError::Feed(format!("invalid subscription position: {e}")))
}

#[async_trait]
impl ChangeFeed for MongoChangeFeed {
    type Cursor = MongoChangeFeedCursor;

    async fn open(
        &self,
        start_at: &StartAt,
        filter: Option<&Filter>,
    ) -> SubscriptionResult<Self::Cursor> {
        let mut pipeline = vec![doc! { "$match": { "operationType": "insert" } }];
        if let Some(filter) = filter {
            let matcher = filter_to_match_document(filter, self.time_representation)
                .map_err(|e| SubscriptionError::Feed(e.to_string()))?;
            pipeline.push(doc! { "$match": matcher });
        }

        let options = match start_at {
            StartAt::Now => None,
            StartAt::Position(position) => Some(
                ChangeStreamOptions::builder()
                    .start_after(Some(position_to_resume_token(position)?))
                    .build(),
            ),
        };

        let stream = self
            .events
            .watch(pipeline, options)
            .await
            .map_err(|e| SubscriptionError::Feed(e.to_string()))?;

        Ok(MongoChangeFeedCursor {
            stream,
            format: Arc::clone(&self.format),
            time_representation: self.time_representation,
        })
    }

    async fn current_position(&self) -> SubscriptionResult<SubscriptionPosition> {
        // Open a throwaway stream and drain its first (empty) batch; the
        // server then hands back a post-batch resume token marking the
        // current tail.
        let mut stream = self
            .events
            .watch(Vec::new(), None)
            .await
            .map_err(|e| SubscriptionError::Feed(e.to_string()))?;
        let _ = stream
            .next_if_any()
            .await
            .map_err(|e| SubscriptionError::Feed(e.to_string()))?;
        let token = stream.resume_token().ok_or_else(|| {
            SubscriptionError::Feed("change stream produced no resume token".to_string())
        })?;
        resume_token_to_position(&token)
    }
}

/// An open change-stream cursor.
pub struct MongoChangeFeedCursor {
    stream: ChangeStream<ChangeStreamEvent<Document>>,
    format: Arc<dyn EventFormat>,
    time_representation: TimeRepresentation,
}

#[async_trait]
impl ChangeFeedCursor for MongoChangeFeedCursor {
    async fn next(&mut self) -> SubscriptionResult<Option<ChangeFeedEvent>> {
        loop {
            let Some(notification) = self.stream.next().await else {
                return Ok(None);
            };
            let notification =
                notification.map_err(|e| SubscriptionError::Feed(e.to_string()))?;

            // The pipeline already matches inserts; this guards against
            // invalidate events that slip through regardless.
            if notification.operation_type != OperationType::Insert {
                continue;
            }
            let Some(document) = notification.full_document else {
                continue;
            };

            let stream_id = document.get_str(STREAM_ID_EXTENSION).map(str::to_string);
            let position = resume_token_to_position(&notification.id)?;
            let mut event =
                document_to_event(self.format.as_ref(), self.time_representation, document)?;
            if let Ok(stream_id) = stream_id {
                event = event.with_extension(STREAM_ID_EXTENSION, stream_id);
            }
            event = event.with_extension(STREAM_POSITION_EXTENSION, position.to_base64());

            return Ok(Some(ChangeFeedEvent { event, position }));
        }
    }

    fn position(&self) -> Option<SubscriptionPosition> {
        self.stream
            .resume_token()
            .and_then(|token| resume_token_to_position(&token).ok())
    }
}
