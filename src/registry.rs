//! # Model registry
//!
//! Maps entity names to schema-backed [`Accessor`]s, building each accessor at
//! most once per process. Index construction runs in the background; callers
//! never wait for it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use mongodb::bson::{DateTime as BsonDateTime, Document, doc};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::connection::{Connection, ConnectionManager};
use crate::errors::DbError;
use crate::schema::EntitySchema;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum IndexStatus {
    Pending,
    Built,
    Failed(DbError),
}

/// Reads and writes instances of one entity type through the live connection.
#[derive(Clone)]
pub struct Accessor {
    inner: Arc<AccessorInner>,
}

struct AccessorInner {
    name: String,
    schema: &'static EntitySchema,
    manager: Arc<ConnectionManager>,
    indexes: watch::Sender<IndexStatus>,
}

impl Accessor {
    fn new(name: &str, schema: &'static EntitySchema, manager: Arc<ConnectionManager>) -> Self {
        Self {
            inner: Arc::new(AccessorInner {
                name: name.to_string(),
                schema,
                manager,
                indexes: watch::channel(IndexStatus::Pending).0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn schema(&self) -> &'static EntitySchema {
        self.inner.schema
    }

    pub fn collection(&self) -> &'static str {
        self.inner.schema.collection
    }

    pub fn same_as(&self, other: &Accessor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn index_status(&self) -> IndexStatus {
        self.inner.indexes.borrow().clone()
    }

    /// Waits until the background index build has finished, either way.
    pub async fn wait_for_indexes(&self) -> IndexStatus {
        let mut rx = self.inner.indexes.subscribe();
        match rx.wait_for(|status| *status != IndexStatus::Pending).await {
            Ok(status) => (*status).clone(),
            Err(_) => self.index_status(),
        }
    }

    /// Creates every declared index on the live connection.
    pub async fn build_indexes(&self) -> Result<(), DbError> {
        let conn = self.inner.manager.current()?;
        for index in &self.inner.schema.indexes {
            let result = conn.store().create_index(self.collection(), index).await;
            if let Err(err) = result {
                self.observe(&conn, &err);
                return Err(DbError::IndexBuild {
                    collection: self.collection().to_string(),
                    detail: format!("{}: {err}", index.name),
                });
            }
        }
        Ok(())
    }

    /// Starts a fresh background index build, e.g. after a reconnect when the
    /// previous one failed.
    pub fn rebuild_indexes(&self) {
        self.inner.indexes.send_replace(IndexStatus::Pending);
        self.spawn_index_build();
    }

    fn spawn_index_build(&self) {
        let accessor = self.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            let err = DbError::IndexBuild {
                collection: self.collection().to_string(),
                detail: "no async runtime available".to_string(),
            };
            tracing::warn!(model = %self.name(), error = %err, "index build skipped");
            self.inner.indexes.send_replace(IndexStatus::Failed(err));
            return;
        };

        runtime.spawn(async move {
            let status = match accessor.build_indexes().await {
                Ok(()) => {
                    tracing::info!(model = %accessor.name(), "indexes created");
                    IndexStatus::Built
                }
                Err(err) => {
                    tracing::warn!(model = %accessor.name(), error = %err, "index build failed");
                    IndexStatus::Failed(err)
                }
            };
            accessor.inner.indexes.send_replace(status);
        });
    }

    /// Flips readiness off when `err` means the connection is gone.
    fn observe(&self, conn: &Connection, err: &StoreError) {
        if err.is_network() {
            self.inner.manager.report_lost(conn, err);
        }
    }

    fn fail(&self, conn: &Connection, err: StoreError) -> DbError {
        self.observe(conn, &err);
        DbError::from_store(self.collection(), err)
    }

    /// Validates and stores `doc`, stamping timestamps when the schema asks
    /// for them. Returns the stored document including its `_id`.
    pub async fn insert(&self, mut doc: Document) -> Result<Document, DbError> {
        self.inner.schema.validate(&doc)?;
        if self.inner.schema.timestamps {
            let now = BsonDateTime::now();
            doc.insert("createdAt", now);
            doc.insert("updatedAt", now);
        }

        let conn = self.inner.manager.current()?;
        match conn.store().insert_one(self.collection(), doc.clone()).await {
            Ok(id) => {
                doc.insert("_id", id);
                Ok(doc)
            }
            Err(err) => Err(self.fail(&conn, err)),
        }
    }

    pub async fn list_collections(&self) -> Result<Vec<String>, DbError> {
        let conn = self.inner.manager.current()?;
        conn.store()
            .list_collections()
            .await
            .map_err(|err| self.fail(&conn, err))
    }

    pub async fn find_one(&self, filter: Document) -> Result<Option<Document>, DbError> {
        let conn = self.inner.manager.current()?;
        conn.store()
            .find_one(self.collection(), filter)
            .await
            .map_err(|err| self.fail(&conn, err))
    }

    pub async fn find_one_as<T: DeserializeOwned>(
        &self,
        filter: Document,
    ) -> Result<Option<T>, DbError> {
        self.find_one(filter)
            .await?
            .map(|doc| decode(self.collection(), doc))
            .transpose()
    }

    pub async fn find_as<T: DeserializeOwned>(&self, filter: Document) -> Result<Vec<T>, DbError> {
        let conn = self.inner.manager.current()?;
        let docs = conn
            .store()
            .find(self.collection(), filter)
            .await
            .map_err(|err| self.fail(&conn, err))?;

        docs.into_iter()
            .map(|doc| decode(self.collection(), doc))
            .collect()
    }

    /// Applies `$set` fields to the first match, refreshing `updatedAt`.
    /// Returns whether a record matched.
    pub async fn update_one(&self, filter: Document, set: Document) -> Result<bool, DbError> {
        self.apply_update(filter, set, None).await
    }

    /// Like [`Accessor::update_one`], and also increments the integer
    /// `counter` field, creating it at 1 when absent.
    pub async fn update_one_counted(
        &self,
        filter: Document,
        set: Document,
        counter: &str,
    ) -> Result<bool, DbError> {
        self.apply_update(filter, set, Some(counter)).await
    }

    async fn apply_update(
        &self,
        filter: Document,
        mut set: Document,
        counter: Option<&str>,
    ) -> Result<bool, DbError> {
        if self.inner.schema.timestamps {
            set.insert("updatedAt", BsonDateTime::now());
        }
        let mut update = doc! { "$set": set };
        if let Some(counter) = counter {
            let mut inc = Document::new();
            inc.insert(counter, 1_i64);
            update.insert("$inc", inc);
        }

        let conn = self.inner.manager.current()?;
        conn.store()
            .update_one(self.collection(), filter, update)
            .await
            .map(|matched| matched > 0)
            .map_err(|err| self.fail(&conn, err))
    }

    pub async fn delete_many(&self, filter: Document) -> Result<u64, DbError> {
        let conn = self.inner.manager.current()?;
        conn.store()
            .delete_many(self.collection(), filter)
            .await
            .map_err(|err| self.fail(&conn, err))
    }

    pub async fn count(&self, filter: Document) -> Result<u64, DbError> {
        let conn = self.inner.manager.current()?;
        conn.store()
            .count(self.collection(), filter)
            .await
            .map_err(|err| self.fail(&conn, err))
    }
}

fn decode<T: DeserializeOwned>(collection: &str, doc: Document) -> Result<T, DbError> {
    mongodb::bson::from_document(doc)
        .map_err(|err| DbError::Store(format!("corrupt document in `{collection}`: {err}")))
}

pub struct ModelRegistry {
    manager: Arc<ConnectionManager>,
    models: RwLock<HashMap<String, Accessor>>,
}

impl ModelRegistry {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the accessor for `name`, building it on first call.
    ///
    /// Index construction for a new accessor is spawned in the background and
    /// never awaited here; failures are logged and leave the accessor usable.
    pub fn register(&self, name: &str, schema: &'static EntitySchema) -> Accessor {
        if let Some(existing) = self.lookup(name) {
            tracing::debug!(model = name, "model already registered");
            return existing;
        }

        let accessor = {
            let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = models.get(name) {
                return existing.clone();
            }
            let accessor = Accessor::new(name, schema, Arc::clone(&self.manager));
            models.insert(name.to_string(), accessor.clone());
            accessor
        };

        tracing::info!(
            model = name,
            collection = schema.collection,
            "model registered"
        );
        accessor.spawn_index_build();
        accessor
    }

    pub fn get(&self, name: &str) -> Result<Accessor, DbError> {
        self.lookup(name)
            .ok_or_else(|| DbError::NotRegistered(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn lookup(&self, name: &str) -> Option<Accessor> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}
