//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryStore`], a simple in-memory implementation
//! of the [`DocumentStore`] trait suitable for testing and development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process
//!   coordination
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits
//!
//! Writes are serialized through a process-wide lock and change events are
//! published on the same critical section, so `include_initial` replay is
//! gap-free: a feed sees every record either in its snapshot or as a live
//! event, never both, never neither.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use sluice_core::{Error, Result};

use super::{
    ChangeEvent, ChangeFeed, CollectionSpec, DatabaseCreated, Document, DocumentStore, FeedOptions,
    Mutation, OnConflict,
};

/// Buffered events per feed; a cursor that falls further behind fails
/// rather than blocking writers.
const FEED_BUFFER: usize = 1024;

#[derive(Debug)]
struct Collection {
    spec: CollectionSpec,
    docs: BTreeMap<String, Document>,
    bus: broadcast::Sender<ChangeEvent>,
}

impl Collection {
    fn new(spec: CollectionSpec) -> Self {
        let (bus, _) = broadcast::channel(FEED_BUFFER);
        Self {
            spec,
            docs: BTreeMap::new(),
            bus,
        }
    }

    fn index_fields(&self, index: &str) -> Result<&'static [&'static str]> {
        self.spec
            .indexes
            .iter()
            .find(|spec| spec.name == index)
            .map(|spec| spec.fields)
            .ok_or_else(|| Error::not_found("index", index))
    }

    /// The value a document contributes to an index, or `None` when a
    /// covered field is absent (such documents are not indexed).
    fn index_value(fields: &[&str], doc: &Document) -> Option<Value> {
        match fields {
            [field] => doc.get(*field).cloned(),
            _ => {
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(doc.get(*field)?.clone());
                }
                Some(Value::Array(values))
            }
        }
    }

    fn primary_key_of(&self, doc: &Document) -> Result<String> {
        doc.get(self.spec.primary_key)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "document is missing string primary key field {}",
                    self.spec.primary_key
                ))
            })
    }

    fn publish(&self, old: Option<Document>, new: Option<Document>) {
        // No receivers is fine; feeds come and go.
        let _ = self.bus.send(ChangeEvent { old, new });
    }
}

#[derive(Debug, Default)]
struct Database {
    collections: HashMap<String, Collection>,
}

/// In-memory store for testing.
///
/// Provides a simple, thread-safe implementation of the [`DocumentStore`]
/// trait using `RwLock` for synchronization and a broadcast bus per
/// collection for change-feeds.
///
/// ## Example
///
/// ```rust
/// use sluice_persist::store::memory::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// // Use store in tests...
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    databases: RwLock<HashMap<String, Database>>,
}

/// Converts a lock poison error to a store error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::store_unavailable("lock poisoned")
}

fn lookup<'a>(
    databases: &'a HashMap<String, Database>,
    database: &str,
    collection: &str,
) -> Result<&'a Collection> {
    databases
        .get(database)
        .ok_or_else(|| Error::not_found("database", database))?
        .collections
        .get(collection)
        .ok_or_else(|| Error::not_found("collection", collection))
}

fn lookup_mut<'a>(
    databases: &'a mut HashMap<String, Database>,
    database: &str,
    collection: &str,
) -> Result<&'a mut Collection> {
    databases
        .get_mut(database)
        .ok_or_else(|| Error::not_found("database", database))?
        .collections
        .get_mut(collection)
        .ok_or_else(|| Error::not_found("collection", collection))
}

fn project(mut doc: Document, without: &[String]) -> Document {
    for field in without {
        doc.remove(field);
    }
    doc
}

/// Applies a feed's selector and projection to a raw collection event.
///
/// Returns `None` when the event is invisible to the feed: neither side
/// matches the selector, or the change only touched projected-out fields.
fn apply_options(event: ChangeEvent, options: &FeedOptions) -> Option<ChangeEvent> {
    let old = event
        .old
        .filter(|doc| options.selector.matches(doc))
        .map(|doc| project(doc, &options.without));
    let new = event
        .new
        .filter(|doc| options.selector.matches(doc))
        .map(|doc| project(doc, &options.without));
    if old.is_none() && new.is_none() {
        return None;
    }
    if old.is_some() && old == new {
        return None;
    }
    Some(ChangeEvent { old, new })
}

async fn forward_events(
    initial: Vec<ChangeEvent>,
    mut bus: broadcast::Receiver<ChangeEvent>,
    tx: mpsc::Sender<Result<ChangeEvent>>,
    options: FeedOptions,
) {
    for event in initial {
        if tx.send(Ok(event)).await.is_err() {
            return;
        }
    }
    loop {
        let event = tokio::select! {
            () = tx.closed() => return,
            event = bus.recv() => event,
        };
        match event {
            Ok(raw) => {
                if let Some(event) = apply_options(raw, &options) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                let _ = tx
                    .send(Err(Error::store_unavailable(format!(
                        "change-feed lagged by {skipped} events"
                    ))))
                    .await;
                return;
            }
        }
    }
}

impl InMemoryStore {
    /// Creates a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn create_database(&self, database: &str) -> Result<DatabaseCreated> {
        let mut databases = self.databases.write().map_err(poison_err)?;
        if databases.contains_key(database) {
            return Ok(DatabaseCreated::AlreadyExists);
        }
        databases.insert(database.to_owned(), Database::default());
        Ok(DatabaseCreated::Created)
    }

    async fn create_collection(&self, database: &str, spec: CollectionSpec) -> Result<()> {
        let mut databases = self.databases.write().map_err(poison_err)?;
        let db = databases
            .get_mut(database)
            .ok_or_else(|| Error::not_found("database", database))?;
        if db.collections.contains_key(spec.name) {
            return Err(Error::conflict("collection", spec.name));
        }
        db.collections
            .insert(spec.name.to_owned(), Collection::new(spec));
        Ok(())
    }

    async fn wait_ready(&self, database: &str, collection: &str, indexes: &[&str]) -> Result<()> {
        let databases = self.databases.read().map_err(poison_err)?;
        let coll = lookup(&databases, database, collection)?;
        // Memory indexes are ready as soon as they are defined.
        for index in indexes {
            coll.index_fields(index)?;
        }
        Ok(())
    }

    async fn get(&self, database: &str, collection: &str, key: &str) -> Result<Option<Document>> {
        let databases = self.databases.read().map_err(poison_err)?;
        let coll = lookup(&databases, database, collection)?;
        Ok(coll.docs.get(key).cloned())
    }

    async fn insert(
        &self,
        database: &str,
        collection: &str,
        docs: Vec<Document>,
        on_conflict: OnConflict,
    ) -> Result<()> {
        let mut databases = self.databases.write().map_err(poison_err)?;
        let coll = lookup_mut(&mut databases, database, collection)?;
        for doc in docs {
            let key = coll.primary_key_of(&doc)?;
            match (coll.docs.get(&key), on_conflict) {
                (Some(_), OnConflict::Error) => {
                    return Err(Error::conflict(coll.spec.name, key));
                }
                (Some(existing), OnConflict::Merge) => {
                    let mut merged = existing.clone();
                    for (field, value) in doc {
                        merged.insert(field, value);
                    }
                    if merged != *existing {
                        let old = coll.docs.insert(key, merged.clone());
                        coll.publish(old, Some(merged));
                    }
                }
                (None, _) => {
                    coll.docs.insert(key, doc.clone());
                    coll.publish(None, Some(doc));
                }
            }
        }
        Ok(())
    }

    async fn get_all(
        &self,
        database: &str,
        collection: &str,
        index: &str,
        key: &Value,
    ) -> Result<Vec<Document>> {
        let databases = self.databases.read().map_err(poison_err)?;
        let coll = lookup(&databases, database, collection)?;
        let fields = coll.index_fields(index)?;
        Ok(coll
            .docs
            .values()
            .filter(|doc| Collection::index_value(fields, doc).as_ref() == Some(key))
            .cloned()
            .collect())
    }

    async fn scan(&self, database: &str, collection: &str) -> Result<Vec<Document>> {
        let databases = self.databases.read().map_err(poison_err)?;
        let coll = lookup(&databases, database, collection)?;
        Ok(coll.docs.values().cloned().collect())
    }

    async fn delete(&self, database: &str, collection: &str, key: &str) -> Result<()> {
        let mut databases = self.databases.write().map_err(poison_err)?;
        let coll = lookup_mut(&mut databases, database, collection)?;
        if let Some(old) = coll.docs.remove(key) {
            coll.publish(Some(old), None);
        }
        Ok(())
    }

    async fn delete_all_by_index(
        &self,
        database: &str,
        collection: &str,
        index: &str,
        key: &Value,
    ) -> Result<u64> {
        let mut databases = self.databases.write().map_err(poison_err)?;
        let coll = lookup_mut(&mut databases, database, collection)?;
        let fields = coll.index_fields(index)?;
        let keys: Vec<String> = coll
            .docs
            .iter()
            .filter(|(_, doc)| Collection::index_value(fields, doc).as_ref() == Some(key))
            .map(|(key, _)| key.clone())
            .collect();
        let removed = keys.len() as u64;
        for key in keys {
            if let Some(old) = coll.docs.remove(&key) {
                coll.publish(Some(old), None);
            }
        }
        Ok(removed)
    }

    async fn wipe(&self, database: &str, collection: &str) -> Result<()> {
        let mut databases = self.databases.write().map_err(poison_err)?;
        let coll = lookup_mut(&mut databases, database, collection)?;
        let old_docs = std::mem::take(&mut coll.docs);
        for (_, old) in old_docs {
            coll.publish(Some(old), None);
        }
        Ok(())
    }

    async fn mutate(
        &self,
        database: &str,
        collection: &str,
        key: &str,
        mutation: Mutation,
    ) -> Result<Option<Document>> {
        let mut databases = self.databases.write().map_err(poison_err)?;
        let coll = lookup_mut(&mut databases, database, collection)?;
        let Some(current) = coll.docs.get(key) else {
            return Ok(None);
        };
        let Some(next) = mutation(current) else {
            return Ok(None);
        };
        if next == *current {
            return Ok(Some(next));
        }
        let old = coll.docs.insert(key.to_owned(), next.clone());
        coll.publish(old, Some(next.clone()));
        Ok(Some(next))
    }

    async fn changefeed(
        &self,
        database: &str,
        collection: &str,
        options: FeedOptions,
    ) -> Result<ChangeFeed> {
        let (initial, bus) = {
            let databases = self.databases.read().map_err(poison_err)?;
            let coll = lookup(&databases, database, collection)?;
            let bus = coll.bus.subscribe();
            let initial = if options.include_initial {
                coll.docs
                    .values()
                    .filter(|doc| options.selector.matches(doc))
                    .map(|doc| ChangeEvent {
                        old: None,
                        new: Some(project(doc.clone(), &options.without)),
                    })
                    .collect()
            } else {
                Vec::new()
            };
            (initial, bus)
        };
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        tokio::spawn(forward_events(initial, bus, tx, options));
        Ok(ChangeFeed::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IndexSpec, Selector};
    use serde_json::json;

    const DB: &str = "testdb";

    const WIDGETS: CollectionSpec = CollectionSpec {
        name: "widgets",
        primary_key: "id",
        indexes: &[
            IndexSpec {
                name: "color",
                fields: &["color"],
            },
            IndexSpec {
                name: "color_and_size",
                fields: &["color", "size"],
            },
        ],
    };

    fn widget(id: &str, color: &str, size: u64) -> Document {
        match json!({"id": id, "color": color, "size": size}) {
            Value::Object(doc) => doc,
            _ => unreachable!(),
        }
    }

    async fn store_with_widgets() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_database(DB).await.unwrap();
        store.create_collection(DB, WIDGETS).await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_database_reports_existing() {
        let store = InMemoryStore::new();
        assert!(store.create_database(DB).await.unwrap().is_created());
        assert_eq!(
            store.create_database(DB).await.unwrap(),
            DatabaseCreated::AlreadyExists
        );
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let store = store_with_widgets().await;
        store
            .insert(DB, "widgets", vec![widget("w1", "red", 3)], OnConflict::Error)
            .await
            .unwrap();

        let doc = store.get(DB, "widgets", "w1").await.unwrap().unwrap();
        assert_eq!(doc.get("color"), Some(&json!("red")));
        assert!(store.get(DB, "widgets", "w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let store = store_with_widgets().await;
        store
            .insert(DB, "widgets", vec![widget("w1", "red", 3)], OnConflict::Error)
            .await
            .unwrap();
        let err = store
            .insert(DB, "widgets", vec![widget("w1", "blue", 4)], OnConflict::Error)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn merge_updates_only_provided_fields() {
        let store = store_with_widgets().await;
        store
            .insert(DB, "widgets", vec![widget("w1", "red", 3)], OnConflict::Error)
            .await
            .unwrap();

        let patch = match json!({"id": "w1", "color": "blue"}) {
            Value::Object(doc) => doc,
            _ => unreachable!(),
        };
        store
            .insert(DB, "widgets", vec![patch], OnConflict::Merge)
            .await
            .unwrap();

        let doc = store.get(DB, "widgets", "w1").await.unwrap().unwrap();
        assert_eq!(doc.get("color"), Some(&json!("blue")));
        assert_eq!(doc.get("size"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn get_all_by_single_and_compound_index() {
        let store = store_with_widgets().await;
        store
            .insert(
                DB,
                "widgets",
                vec![
                    widget("w1", "red", 3),
                    widget("w2", "red", 4),
                    widget("w3", "blue", 3),
                ],
                OnConflict::Error,
            )
            .await
            .unwrap();

        let red = store
            .get_all(DB, "widgets", "color", &json!("red"))
            .await
            .unwrap();
        assert_eq!(red.len(), 2);

        let red_small = store
            .get_all(DB, "widgets", "color_and_size", &json!(["red", 3]))
            .await
            .unwrap();
        assert_eq!(red_small.len(), 1);
        assert_eq!(red_small[0].get("id"), Some(&json!("w1")));

        let err = store
            .get_all(DB, "widgets", "no_such_index", &json!("red"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_all_by_index_counts() {
        let store = store_with_widgets().await;
        store
            .insert(
                DB,
                "widgets",
                vec![widget("w1", "red", 3), widget("w2", "red", 4)],
                OnConflict::Error,
            )
            .await
            .unwrap();

        let removed = store
            .delete_all_by_index(DB, "widgets", "color", &json!("red"))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.scan(DB, "widgets").await.unwrap().is_empty());

        let removed = store
            .delete_all_by_index(DB, "widgets", "color", &json!("red"))
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn mutate_applies_guarded_patch() {
        let store = store_with_widgets().await;
        store
            .insert(DB, "widgets", vec![widget("w1", "red", 3)], OnConflict::Error)
            .await
            .unwrap();

        // Guard holds: patch applied and returned.
        let changed = store
            .mutate(
                DB,
                "widgets",
                "w1",
                Box::new(|doc| {
                    if doc.get("color") == Some(&json!("red")) {
                        let mut next = doc.clone();
                        next.insert("color".into(), json!("green"));
                        Some(next)
                    } else {
                        None
                    }
                }),
            )
            .await
            .unwrap();
        assert_eq!(changed.unwrap().get("color"), Some(&json!("green")));

        // Guard fails: nothing changed, nothing returned.
        let unchanged = store
            .mutate(
                DB,
                "widgets",
                "w1",
                Box::new(|doc| {
                    if doc.get("color") == Some(&json!("red")) {
                        Some(doc.clone())
                    } else {
                        None
                    }
                }),
            )
            .await
            .unwrap();
        assert!(unchanged.is_none());

        // Missing record: no-op.
        let missing = store
            .mutate(DB, "widgets", "nope", Box::new(|doc| Some(doc.clone())))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn changefeed_replays_initial_then_live() {
        let store = store_with_widgets().await;
        store
            .insert(DB, "widgets", vec![widget("w1", "red", 3)], OnConflict::Error)
            .await
            .unwrap();

        let mut feed = store
            .changefeed(
                DB,
                "widgets",
                FeedOptions {
                    include_initial: true,
                    ..FeedOptions::default()
                },
            )
            .await
            .unwrap();

        let initial = feed.next().await.unwrap().unwrap();
        assert!(initial.old.is_none());
        assert_eq!(initial.new.unwrap().get("id"), Some(&json!("w1")));

        store
            .insert(DB, "widgets", vec![widget("w2", "blue", 1)], OnConflict::Error)
            .await
            .unwrap();
        let live = feed.next().await.unwrap().unwrap();
        assert_eq!(live.new.unwrap().get("id"), Some(&json!("w2")));
    }

    #[tokio::test]
    async fn changefeed_selector_tracks_membership() {
        let store = store_with_widgets().await;
        let mut feed = store
            .changefeed(
                DB,
                "widgets",
                FeedOptions {
                    selector: Selector::new().field("color", "red"),
                    include_initial: true,
                    ..FeedOptions::default()
                },
            )
            .await
            .unwrap();

        // A blue widget is invisible to the feed.
        store
            .insert(DB, "widgets", vec![widget("w1", "blue", 1)], OnConflict::Error)
            .await
            .unwrap();
        // A red widget enters the set.
        store
            .insert(DB, "widgets", vec![widget("w2", "red", 1)], OnConflict::Error)
            .await
            .unwrap();

        let enter = feed.next().await.unwrap().unwrap();
        assert!(enter.old.is_none());
        assert_eq!(enter.new.as_ref().unwrap().get("id"), Some(&json!("w2")));

        // Repainting it blue makes it leave the set: new side absent.
        store
            .mutate(
                DB,
                "widgets",
                "w2",
                Box::new(|doc| {
                    let mut next = doc.clone();
                    next.insert("color".into(), json!("blue"));
                    Some(next)
                }),
            )
            .await
            .unwrap();

        let leave = feed.next().await.unwrap().unwrap();
        assert!(leave.old.is_some());
        assert!(leave.new.is_none());
    }

    #[tokio::test]
    async fn changefeed_projection_suppresses_projected_only_changes() {
        let store = store_with_widgets().await;
        store
            .insert(DB, "widgets", vec![widget("w1", "red", 3)], OnConflict::Error)
            .await
            .unwrap();

        let mut feed = store
            .changefeed(
                DB,
                "widgets",
                FeedOptions {
                    without: vec!["size".into()],
                    ..FeedOptions::default()
                },
            )
            .await
            .unwrap();

        // Size-only change: invisible.
        store
            .mutate(
                DB,
                "widgets",
                "w1",
                Box::new(|doc| {
                    let mut next = doc.clone();
                    next.insert("size".into(), json!(9));
                    Some(next)
                }),
            )
            .await
            .unwrap();
        // Color change: visible, with size projected out.
        store
            .mutate(
                DB,
                "widgets",
                "w1",
                Box::new(|doc| {
                    let mut next = doc.clone();
                    next.insert("color".into(), json!("blue"));
                    Some(next)
                }),
            )
            .await
            .unwrap();

        let event = feed.next().await.unwrap().unwrap();
        let new = event.new.unwrap();
        assert_eq!(new.get("color"), Some(&json!("blue")));
        assert!(!new.contains_key("size"));
    }

    #[tokio::test]
    async fn wipe_emits_deletes() {
        let store = store_with_widgets().await;
        store
            .insert(DB, "widgets", vec![widget("w1", "red", 3)], OnConflict::Error)
            .await
            .unwrap();

        let mut feed = store
            .changefeed(DB, "widgets", FeedOptions::default())
            .await
            .unwrap();

        store.wipe(DB, "widgets").await.unwrap();
        let event = feed.next().await.unwrap().unwrap();
        assert!(event.old.is_some());
        assert!(event.new.is_none());
        assert!(store.scan(DB, "widgets").await.unwrap().is_empty());
    }
}
