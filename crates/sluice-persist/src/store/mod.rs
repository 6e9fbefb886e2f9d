//! Document-store interface consumed by the registries.
//!
//! The persistence core does not own a storage engine; it drives any
//! document store that can offer the primitives below. The trait captures
//! exactly what the registries need:
//!
//! - **Collections and indexes**: primary-key access plus single-field and
//!   compound secondary indexes
//! - **Conditional writes**: atomic read-modify-write on one record, with
//!   the changed record returned only when the guard held
//! - **Change-feeds**: `{old, new}` event streams over an equality
//!   selector, with optional initial-state replay and field projection
//!
//! ## Design Principles
//!
//! - **Single-record atomicity**: no multi-record transactions are assumed;
//!   all coordination rides on [`DocumentStore::mutate`]
//! - **Testability**: an in-memory implementation backs every test; a
//!   production implementation talks to the real store over the wire

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use sluice_core::{Error, Result};

/// A stored record: a JSON object keyed by the collection's primary key
/// field.
pub type Document = serde_json::Map<String, Value>;

/// Guard-and-patch closure for [`DocumentStore::mutate`].
///
/// Receives the current record and returns the replacement, or `None` to
/// leave the record untouched (guard failed).
pub type Mutation = Box<dyn FnOnce(&Document) -> Option<Document> + Send>;

/// Encodes a typed record into a document.
pub(crate) fn to_document<T: Serialize>(record: &T) -> Result<Document> {
    match serde_json::to_value(record) {
        Ok(Value::Object(doc)) => Ok(doc),
        Ok(other) => Err(Error::internal(format!(
            "record encoded to non-object JSON: {other}"
        ))),
        Err(err) => Err(Error::internal(format!("record encoding failed: {err}"))),
    }
}

/// Decodes a document into a typed record.
pub(crate) fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T> {
    serde_json::from_value(Value::Object(doc))
        .map_err(|err| Error::internal(format!("record decoding failed: {err}")))
}

/// Secondary index definition: a name plus the document fields it covers.
///
/// A single-field index keys on that field's value; a compound index keys
/// on the array of its fields' values, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    /// Index name, unique within the collection.
    pub name: &'static str,
    /// The document fields the index covers.
    pub fields: &'static [&'static str],
}

/// Collection definition: name, primary key field, and secondary indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSpec {
    /// Collection name, unique within the database.
    pub name: &'static str,
    /// The document field holding the primary key.
    pub primary_key: &'static str,
    /// Secondary indexes to maintain.
    pub indexes: &'static [IndexSpec],
}

/// Behavior when an inserted document's primary key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Fail the insert with a conflict error.
    Error,
    /// Merge the inserted document's top-level fields into the existing
    /// record.
    Merge,
}

/// Outcome of a database-creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseCreated {
    /// The database did not exist and was created.
    Created,
    /// The database already existed; nothing was touched.
    AlreadyExists,
}

impl DatabaseCreated {
    /// Returns true if the database was created by this call.
    #[must_use]
    pub const fn is_created(self) -> bool {
        matches!(self, Self::Created)
    }
}

/// Equality selector over document fields.
///
/// A document matches when every named field is present and equal to the
/// given value. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(BTreeMap<String, Value>);

impl Selector {
    /// Creates an empty selector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an equality requirement on a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Returns true if the document satisfies every requirement.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        self.0
            .iter()
            .all(|(name, value)| doc.get(name) == Some(value))
    }

    /// Returns true if the selector has no requirements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One event on a change-feed: the record before and after the change.
///
/// For a filtered feed, `old`/`new` are present only when the respective
/// value matched the feed's selector; a record entering the watched set
/// arrives with `old` absent, and one leaving it with `new` absent.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// The record before the change, if it existed and matched.
    pub old: Option<Document>,
    /// The record after the change, if it exists and matches.
    pub new: Option<Document>,
}

/// Options for opening a change-feed.
#[derive(Debug, Clone, Default)]
pub struct FeedOptions {
    /// Restricts the feed to matching records.
    pub selector: Selector,
    /// Replays currently-matching records as synthetic creates before any
    /// live event is delivered.
    pub include_initial: bool,
    /// Fields projected out of every delivered record. Changes that only
    /// touch projected-out fields are not delivered at all.
    pub without: Vec<String>,
}

/// Live cursor over a collection's changes.
///
/// Dropping the feed releases the underlying cursor; the store side stops
/// forwarding as soon as it observes the receiver gone.
#[derive(Debug)]
pub struct ChangeFeed {
    rx: mpsc::Receiver<Result<ChangeEvent>>,
}

impl ChangeFeed {
    /// Wraps a delivery channel produced by a store implementation.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<Result<ChangeEvent>>) -> Self {
        Self { rx }
    }

    /// Waits for the next event.
    ///
    /// Returns `Ok(None)` when the store has closed the feed.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed failed (for example, the cursor fell
    /// too far behind the collection's write rate).
    pub async fn next(&mut self) -> Result<Option<ChangeEvent>> {
        match self.rx.recv().await {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// Poll-based variant of [`ChangeFeed::next`], for building `Stream`
    /// adapters on top of the feed.
    pub fn poll_next_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<ChangeEvent>>> {
        self.rx.poll_recv(cx)
    }
}

/// Storage abstraction consumed by the schema manager, the registries, and
/// the chunk coordinator.
///
/// Implementations must provide per-record atomicity for
/// [`DocumentStore::mutate`] and gap-free `include_initial` replay for
/// [`DocumentStore::changefeed`]; everything else is plain keyed access.
/// All methods are `Send + Sync` so one session can serve concurrent
/// request handlers.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates a database, reporting whether it already existed.
    async fn create_database(&self, database: &str) -> Result<DatabaseCreated>;

    /// Creates a collection with its primary key and secondary indexes.
    async fn create_collection(&self, database: &str, spec: CollectionSpec) -> Result<()>;

    /// Waits until the collection and the named indexes are ready.
    ///
    /// Fails if the collection or any named index does not exist.
    async fn wait_ready(&self, database: &str, collection: &str, indexes: &[&str]) -> Result<()>;

    /// Gets a record by primary key.
    async fn get(&self, database: &str, collection: &str, key: &str) -> Result<Option<Document>>;

    /// Inserts documents, applying `on_conflict` when a primary key is
    /// already present.
    async fn insert(
        &self,
        database: &str,
        collection: &str,
        docs: Vec<Document>,
        on_conflict: OnConflict,
    ) -> Result<()>;

    /// Gets all records whose index value equals `key`.
    ///
    /// For a compound index, `key` is the array of field values in the
    /// index's declaration order.
    async fn get_all(
        &self,
        database: &str,
        collection: &str,
        index: &str,
        key: &Value,
    ) -> Result<Vec<Document>>;

    /// Reads every record in the collection.
    async fn scan(&self, database: &str, collection: &str) -> Result<Vec<Document>>;

    /// Deletes a record by primary key. Succeeds if the record is absent.
    async fn delete(&self, database: &str, collection: &str, key: &str) -> Result<()>;

    /// Deletes every record whose index value equals `key`, returning the
    /// number of records removed.
    async fn delete_all_by_index(
        &self,
        database: &str,
        collection: &str,
        index: &str,
        key: &Value,
    ) -> Result<u64>;

    /// Deletes every record in the collection.
    async fn wipe(&self, database: &str, collection: &str) -> Result<()>;

    /// Atomically applies a guard-and-patch mutation to one record.
    ///
    /// Returns the replacement record when the mutation changed it, or
    /// `None` when the record was absent or the guard declined.
    async fn mutate(
        &self,
        database: &str,
        collection: &str,
        key: &str,
        mutation: Mutation,
    ) -> Result<Option<Document>>;

    /// Opens a change-feed over the collection.
    async fn changefeed(
        &self,
        database: &str,
        collection: &str,
        options: FeedOptions,
    ) -> Result<ChangeFeed>;
}
