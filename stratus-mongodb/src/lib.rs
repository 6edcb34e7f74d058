//! # stratus-mongodb
//!
//! MongoDB backend for the stratus event store: CloudEvents as documents,
//! stream versions guarded by multi-document transactions, and change
//! streams as the subscription feed.
//!
//! ## Pieces
//!
//! - [`MongoEventStore`]: the `EventStore` implementation. Event documents
//!   mirror the CloudEvent JSON plus a `streamid` field; a unique index over
//!   `(streamid, id)` enforces event-id uniqueness per stream.
//! - [`TimeRepresentation`]: whether the `time` attribute is stored as the
//!   RFC 3339 string or a native BSON datetime (millisecond UTC).
//! - [`ConsistencyGuarantee`]: no version tracking, store-managed
//!   transactions, or caller-managed (ambient) transactions via
//!   [`MongoEventStore::write_in_session`].
//! - [`MongoChangeFeed`]: change streams restricted to inserts, decoded into
//!   CloudEvents with opaque resume tokens.
//! - [`MongoPositionStorage`]: durable subscription positions.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mongodb::Client;
//! use stratus::{batch, CloudEvent, EventStore, StreamId, SubscriptionEngine, WriteCondition};
//! use stratus_mongodb::MongoEventStore;
//!
//! let client = Client::with_uri_str("mongodb://localhost:27017").await?;
//! let store = MongoEventStore::new(client, "events-db");
//!
//! let stream_id = StreamId::try_new("name")?;
//! let event = CloudEvent::new("e1", "https://example.org/names", "NameDefined");
//! store
//!     .write_conditionally(&stream_id, WriteCondition::stream_version_eq(0), batch(vec![event]))
//!     .await?;
//!
//! let engine = SubscriptionEngine::new(
//!     store.change_feed(),
//!     store.position_storage("subscription-positions"),
//! );
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod consistency;
mod document;
mod event_store;
mod position;
mod query;

pub use change_feed::{MongoChangeFeed, MongoChangeFeedCursor};
pub use consistency::{ConsistencyGuarantee, DEFAULT_VERSIONS_COLLECTION};
pub use document::{document_to_event, event_to_document, TimeRepresentation};
pub use event_store::{MongoEventStore, MongoEventStoreConfig, DEFAULT_EVENTS_COLLECTION};
pub use position::{MongoPositionStorage, DEFAULT_POSITIONS_COLLECTION};
