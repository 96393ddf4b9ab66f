//! In-process document store for `memory://` targets.
//!
//! Behaves like the subset of MongoDB the data core relies on: collections are
//! created lazily on first insert or index creation, unique indexes reject
//! colliding writes with a duplicate-key error, and updates support `$set`,
//! `$unset` and `$inc`. Failure knobs (handshake latency, refused handshakes, network
//! loss) let tests drive the connection state machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mongodb::bson::{Bson, Document, oid::ObjectId};

use super::{Driver, StoreConnection, StoreError};
use crate::config::ConnectionTarget;
use crate::schema::IndexSpec;

#[derive(Default)]
struct MemoryCollection {
    docs: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

type Databases = HashMap<String, HashMap<String, MemoryCollection>>;

#[derive(Default)]
pub struct MemoryCluster {
    databases: Mutex<Databases>,
    handshakes: AtomicUsize,
    closed: AtomicUsize,
    epoch: AtomicU64,
    refuse: AtomicBool,
    dial_delay: Mutex<Duration>,
}

impl MemoryCluster {
    fn databases(&self) -> MutexGuard<'_, Databases> {
        self.databases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn collection_names(&self, database: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .databases()
            .get(database)
            .map(|db| db.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn documents(&self, database: &str, collection: &str) -> Vec<Document> {
        self.databases()
            .get(database)
            .and_then(|db| db.get(collection))
            .map(|c| c.docs.clone())
            .unwrap_or_default()
    }

    pub fn index_names(&self, database: &str, collection: &str) -> Vec<String> {
        self.databases()
            .get(database)
            .and_then(|db| db.get(collection))
            .map(|c| c.indexes.iter().map(|i| i.name.clone()).collect())
            .unwrap_or_default()
    }
}

/// Driver for `memory://` targets. Clones share one cluster.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    cluster: Arc<MemoryCluster>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster(&self) -> &Arc<MemoryCluster> {
        &self.cluster
    }

    /// Number of handshakes attempted so far.
    pub fn handshakes(&self) -> usize {
        self.cluster.handshakes.load(Ordering::SeqCst)
    }

    /// Number of connections torn down through `close`.
    pub fn closed_connections(&self) -> usize {
        self.cluster.closed.load(Ordering::SeqCst)
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        *self
            .cluster
            .dial_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.cluster.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Breaks every open connection, as if the network dropped.
    pub fn sever(&self) {
        self.cluster.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

#[rocket::async_trait]
impl Driver for MemoryDriver {
    async fn dial(&self, target: &ConnectionTarget) -> Result<Arc<dyn StoreConnection>, StoreError> {
        self.cluster.handshakes.fetch_add(1, Ordering::SeqCst);

        let delay = *self
            .cluster
            .dial_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.cluster.refuse.load(Ordering::SeqCst) {
            return Err(StoreError::Network(format!(
                "connection refused by {}",
                target.authority()
            )));
        }

        Ok(Arc::new(MemoryConnection {
            cluster: Arc::clone(&self.cluster),
            database: target.database().to_string(),
            epoch: self.cluster.epoch.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MemoryConnection {
    cluster: Arc<MemoryCluster>,
    database: String,
    epoch: u64,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn live(&self) -> Result<MutexGuard<'_, Databases>, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Network("connection closed".to_string()));
        }
        if self.cluster.epoch.load(Ordering::SeqCst) != self.epoch {
            return Err(StoreError::Network("connection reset by peer".to_string()));
        }
        Ok(self.cluster.databases())
    }
}

#[rocket::async_trait]
impl StoreConnection for MemoryConnection {
    fn database_name(&self) -> &str {
        &self.database
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.live().map(|_| ())
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let databases = self.live()?;
        let mut names: Vec<String> = databases
            .get(&self.database)
            .map(|db| db.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), StoreError> {
        let mut databases = self.live()?;
        let coll = databases
            .entry(self.database.clone())
            .or_default()
            .entry(collection.to_string())
            .or_default();

        if coll.indexes.iter().any(|i| i.name == index.name) {
            return Ok(());
        }
        if index.unique {
            let mut seen: Vec<Vec<Bson>> = Vec::new();
            for doc in &coll.docs {
                let key = index_key(index, doc);
                if seen.contains(&key) {
                    return Err(StoreError::DuplicateKey(format!(
                        "index {} cannot be built: duplicate {:?}",
                        index.name, key
                    )));
                }
                seen.push(key);
            }
        }
        coll.indexes.push(index.clone());
        Ok(())
    }

    async fn insert_one(&self, collection: &str, mut doc: Document) -> Result<Bson, StoreError> {
        let mut databases = self.live()?;
        let coll = databases
            .entry(self.database.clone())
            .or_default()
            .entry(collection.to_string())
            .or_default();

        let id = match doc.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = Bson::ObjectId(ObjectId::new());
                doc.insert("_id", id.clone());
                id
            }
        };
        if coll.docs.iter().any(|d| d.get("_id") == Some(&id)) {
            return Err(StoreError::DuplicateKey(format!("_id {id}")));
        }
        check_unique(coll, &doc, None)?;

        coll.docs.push(doc);
        Ok(id)
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Option<Document>, StoreError> {
        let databases = self.live()?;
        Ok(collection_ref(&databases, &self.database, collection)
            .and_then(|c| c.docs.iter().find(|d| filter_matches(d, &filter)).cloned()))
    }

    async fn find(&self, collection: &str, filter: Document) -> Result<Vec<Document>, StoreError> {
        let databases = self.live()?;
        Ok(collection_ref(&databases, &self.database, collection)
            .map(|c| {
                c.docs
                    .iter()
                    .filter(|d| filter_matches(d, &filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<u64, StoreError> {
        let mut databases = self.live()?;
        let Some(coll) = databases
            .get_mut(&self.database)
            .and_then(|db| db.get_mut(collection))
        else {
            return Ok(0);
        };
        let Some(position) = coll.docs.iter().position(|d| filter_matches(d, &filter)) else {
            return Ok(0);
        };

        let mut updated = coll.docs[position].clone();
        for (operator, fields) in &update {
            let Bson::Document(fields) = fields else {
                return Err(StoreError::Other(format!("`{operator}` expects a document")));
            };
            match operator.as_str() {
                "$set" => {
                    for (key, value) in fields {
                        updated.insert(key.clone(), value.clone());
                    }
                }
                "$unset" => {
                    for key in fields.keys() {
                        updated.remove(key);
                    }
                }
                "$inc" => {
                    for (key, step) in fields {
                        let value = increment(updated.get(key), step).ok_or_else(|| {
                            StoreError::Other(format!("cannot increment non-numeric `{key}`"))
                        })?;
                        updated.insert(key.clone(), value);
                    }
                }
                other => return Err(StoreError::Other(format!("unsupported operator `{other}`"))),
            }
        }
        check_unique(coll, &updated, Some(position))?;
        coll.docs[position] = updated;
        Ok(1)
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
        let mut databases = self.live()?;
        let Some(coll) = databases
            .get_mut(&self.database)
            .and_then(|db| db.get_mut(collection))
        else {
            return Ok(0);
        };
        let before = coll.docs.len();
        coll.docs.retain(|d| !filter_matches(d, &filter));
        Ok((before - coll.docs.len()) as u64)
    }

    async fn count(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
        let databases = self.live()?;
        Ok(collection_ref(&databases, &self.database, collection)
            .map(|c| c.docs.iter().filter(|d| filter_matches(d, &filter)).count() as u64)
            .unwrap_or(0))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cluster.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn collection_ref<'a>(
    databases: &'a Databases,
    database: &str,
    collection: &str,
) -> Option<&'a MemoryCollection> {
    databases.get(database).and_then(|db| db.get(collection))
}

/// Top-level equality match; a `Null` filter value also matches a missing field.
fn filter_matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| match doc.get(key) {
        Some(actual) => actual == expected,
        None => matches!(expected, Bson::Null),
    })
}

fn increment(current: Option<&Bson>, step: &Bson) -> Option<Bson> {
    match (current, step) {
        (None | Some(Bson::Null), step) => Some(step.clone()),
        (Some(Bson::Int32(a)), Bson::Int32(b)) => Some(Bson::Int32(a + b)),
        (Some(Bson::Int32(a)), Bson::Int64(b)) => Some(Bson::Int64(i64::from(*a) + b)),
        (Some(Bson::Int64(a)), Bson::Int32(b)) => Some(Bson::Int64(a + i64::from(*b))),
        (Some(Bson::Int64(a)), Bson::Int64(b)) => Some(Bson::Int64(a + b)),
        (Some(Bson::Double(a)), Bson::Double(b)) => Some(Bson::Double(a + b)),
        _ => None,
    }
}

fn index_key(index: &IndexSpec, doc: &Document) -> Vec<Bson> {
    index
        .keys
        .iter()
        .map(|key| match doc.get(key) {
            Some(Bson::String(s)) if index.case_insensitive => Bson::String(s.to_lowercase()),
            Some(value) => value.clone(),
            None => Bson::Null,
        })
        .collect()
}

fn check_unique(
    coll: &MemoryCollection,
    doc: &Document,
    skip: Option<usize>,
) -> Result<(), StoreError> {
    for index in coll.indexes.iter().filter(|i| i.unique) {
        let key = index_key(index, doc);
        let clash = coll
            .docs
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != skip)
            .any(|(_, other)| index_key(index, other) == key);
        if clash {
            return Err(StoreError::DuplicateKey(format!(
                "index: {} dup key: {:?}",
                index.name, key
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use mongodb::bson::doc;

    use super::*;
    use crate::config::ConnectionTarget;

    async fn connect(driver: &MemoryDriver) -> Arc<dyn StoreConnection> {
        let target = ConnectionTarget::parse(Some("memory://local"), "clinic").unwrap();
        driver.dial(&target).await.unwrap()
    }

    #[tokio::test]
    async fn collections_appear_on_first_insert() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver).await;
        assert!(conn.list_collections().await.unwrap().is_empty());

        conn.insert_one("doctors", doc! { "email": "a@b.co" })
            .await
            .unwrap();
        conn.delete_many("doctors", doc! { "email": "a@b.co" })
            .await
            .unwrap();

        assert_eq!(conn.list_collections().await.unwrap(), vec!["doctors"]);
        assert_eq!(conn.count("doctors", doc! {}).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn case_insensitive_unique_index() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver).await;
        conn.create_index("doctors", &IndexSpec::unique_case_insensitive("email"))
            .await
            .unwrap();

        conn.insert_one("doctors", doc! { "email": "Ann@Clinic.org" })
            .await
            .unwrap();
        let err = conn
            .insert_one("doctors", doc! { "email": "ann@clinic.org" })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn update_set_and_unset() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver).await;
        conn.insert_one("doctors", doc! { "email": "x@y.io", "fees": 10 })
            .await
            .unwrap();

        let matched = conn
            .update_one(
                "doctors",
                doc! { "email": "x@y.io" },
                doc! { "$set": { "fees": 20 }, "$unset": { "email": "" } },
            )
            .await
            .unwrap();
        assert_eq!(matched, 1);

        let stored = conn.find_one("doctors", doc! { "fees": 20 }).await.unwrap().unwrap();
        assert!(stored.get("email").is_none());
    }

    #[tokio::test]
    async fn inc_creates_then_bumps_counter() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver).await;
        conn.insert_one("doctors", doc! { "email": "x@y.io" })
            .await
            .unwrap();

        for _ in 0..2 {
            conn.update_one(
                "doctors",
                doc! { "email": "x@y.io" },
                doc! { "$inc": { "slots_version": 1_i64 } },
            )
            .await
            .unwrap();
        }

        let stored = conn.find_one("doctors", doc! {}).await.unwrap().unwrap();
        assert_eq!(stored.get_i64("slots_version").unwrap(), 2);

        let err = conn
            .update_one(
                "doctors",
                doc! {},
                doc! { "$inc": { "email": 1_i64 } },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Other(_)));
    }

    #[tokio::test]
    async fn severed_connections_fail_with_network_errors() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver).await;
        driver.sever();
        assert!(conn.ping().await.unwrap_err().is_network());

        let fresh = connect(&driver).await;
        fresh.ping().await.unwrap();
    }
}
