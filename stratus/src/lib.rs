//! # stratus
//!
//! An append-only event store for CloudEvents layered over a document
//! database, with position-aware change subscriptions.
//!
//! ## What is stratus?
//!
//! stratus stores domain events packaged as CloudEvents in ordered streams
//! addressed by a stream id, guards concurrent writers with a boolean
//! algebra over the current stream version, and turns the database's change
//! feed into resumable, filterable subscriptions with durable resume points.
//!
//! This crate is the storage-agnostic core: the data model, the store and
//! subscription contracts, and the subscription engine. Backends live in
//! sibling crates: `stratus-mongodb` for MongoDB and `stratus-memory` for
//! tests and development.
//!
//! ## Key pieces
//!
//! - [`CloudEvent`]: the envelope written, stored, and delivered
//! - [`EventStore`]: `write` / `read` / `exists` / `stream_version` over
//!   lazy event sequences
//! - [`WriteCondition`]: optimistic concurrency expressed as a predicate
//!   tree over the stream version
//! - [`SubscriptionEngine`]: tails a [`ChangeFeed`], delivers to callbacks
//!   with retry, and checkpoints through a [`PositionStorage`]
//!
//! ## Writing and reading
//!
//! ```rust,ignore
//! use stratus::{batch, CloudEvent, EventStore, StreamId, WriteCondition};
//!
//! let stream_id = StreamId::try_new("name")?;
//! let event = CloudEvent::new("e1", "https://example.org/names", "NameDefined")
//!     .with_subject("name");
//!
//! store
//!     .write_conditionally(&stream_id, WriteCondition::stream_version_eq(0), batch(vec![event]))
//!     .await?;
//!
//! let stream = store.read(&stream_id).await?;
//! assert_eq!(u64::from(stream.version), 1);
//! let events = stream.collect_events().await?;
//! ```
//!
//! ## Subscribing
//!
//! ```rust,ignore
//! use stratus::{StartAt, SubscriptionEngine, SubscriptionId};
//!
//! let engine = SubscriptionEngine::new(feed, position_storage);
//! engine
//!     .subscribe(SubscriptionId::try_new("projection")?, None, StartAt::now(), action)
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod condition;
mod errors;
mod event;
mod event_store;
mod filter;
mod format;
mod retry;
mod subscription;
mod subscription_engine;
mod types;

pub use condition::{VersionCondition, WriteCondition};
pub use errors::{EventStoreError, EventStoreResult, SubscriptionError, SubscriptionResult};
pub use event::{
    CloudEvent, EventData, ExtensionValue, SPEC_VERSION, STREAM_ID_EXTENSION,
    STREAM_POSITION_EXTENSION,
};
pub use event_store::{batch, EventBatch, EventStore, EventStream};
pub use filter::{Comparison, Filter, FilterValue};
pub use format::{EventFormat, JsonEventFormat};
pub use retry::RetryStrategy;
pub use subscription::{
    ActionError, ChangeFeed, ChangeFeedCursor, ChangeFeedEvent, PositionStorage, StartAt,
    SubscriptionAction, SubscriptionPosition,
};
pub use subscription_engine::{
    PersistencePolicy, SubscriptionEngine, SubscriptionEngineConfig, SubscriptionHandle,
    SubscriptionStatus,
};
pub use types::{StreamId, StreamVersion, SubscriptionId};

/// Commonly used imports.
///
/// ```rust
/// use stratus::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        batch, ChangeFeed, CloudEvent, EventBatch, EventData, EventStore, EventStoreError,
        EventStream, Filter, PositionStorage, StartAt, StreamId, StreamVersion, SubscriptionAction,
        SubscriptionEngine, SubscriptionId, SubscriptionPosition, VersionCondition, WriteCondition,
    };
}
