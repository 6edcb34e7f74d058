//! Durable subscription positions in a MongoDB collection.
//!
//! One document per subscription id: `{ _id: <subscription id>,
//! position: <binary resume token> }`. Saves are upserts, so overwriting is
//! atomic; each subscription only ever writes its own key.

use async_trait::async_trait;
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use mongodb::options::ReplaceOptions;
use mongodb::{Collection, Database};

use stratus::{
    PositionStorage, SubscriptionError, SubscriptionId, SubscriptionPosition, SubscriptionResult,
};

/// Default name of the subscription position collection.
pub const DEFAULT_POSITIONS_COLLECTION: &str = "subscription-positions";

/// Subscription position storage backed by a MongoDB collection.
#[derive(Clone)]
pub struct MongoPositionStorage {
    positions: Collection<Document>,
}

impl MongoPositionStorage {
    /// Creates position storage over the named collection.
    pub fn new(database: &Database, collection_name: &str) -> Self {
        Self {
            positions: database.collection::<Document>(collection_name),
        }
    }
}

fn storage_error(error: mongodb::error::Error) -> SubscriptionError {
    SubscriptionError::PositionStorage(error.to_string())
}

#[async_trait]
impl PositionStorage for MongoPositionStorage {
    async fn read(&self, id: &SubscriptionId) -> SubscriptionResult<Option<SubscriptionPosition>> {
        let document = self
            .positions
            .find_one(doc! { "_id": id.as_ref() }, None)
            .await
            .map_err(storage_error)?;

        match document.as_ref().and_then(|d| d.get("position")) {
            Some(Bson::Binary(binary)) => {
                Ok(Some(SubscriptionPosition::from_bytes(binary.bytes.clone())))
            }
            Some(_) => Err(SubscriptionError::PositionStorage(format!(
                "subscription '{id}' has a non-binary position"
            ))),
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        id: &SubscriptionId,
        position: &SubscriptionPosition,
    ) -> SubscriptionResult<()> {
        let replacement = doc! {
            "_id": id.as_ref(),
            "position": Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: position.as_bytes().to_vec(),
            }),
        };
        self.positions
            .replace_one(
                doc! { "_id": id.as_ref() },
                replacement,
                ReplaceOptions::builder().upsert(true).build(),
            )
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn delete(&self, id: &SubscriptionId) -> SubscriptionResult<()> {
        self.positions
            .delete_one(doc! { "_id": id.as_ref() }, None)
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}
