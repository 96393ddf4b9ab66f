//! # Collection bootstrap
//!
//! Some stores only create a collection on its first real write. Bootstrap
//! makes that happen up front: when a required collection is missing it
//! inserts the schema's placeholder record and deletes it again by its
//! sentinel key.
//!
//! A duplicate-key error on the placeholder insert means another process is
//! running the same bootstrap, which is as good as success once the collection is
//! confirmed to exist.

use mongodb::bson::Document;

use crate::errors::DbError;
use crate::registry::Accessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    AlreadyPresent,
    Created,
    /// A concurrent bootstrap won the placeholder insert.
    CreatedConcurrently,
}

pub struct Bootstrap {
    accessors: Vec<Accessor>,
}

impl Bootstrap {
    pub fn new(accessors: Vec<Accessor>) -> Self {
        Self { accessors }
    }

    /// Ensures every collection exists and holds no placeholder record.
    pub async fn ensure_collections(&self) -> Result<Vec<BootstrapOutcome>, DbError> {
        let mut outcomes = Vec::with_capacity(self.accessors.len());
        for accessor in &self.accessors {
            outcomes.push(ensure_collection(accessor).await?);
        }
        Ok(outcomes)
    }
}

pub async fn ensure_collection(accessor: &Accessor) -> Result<BootstrapOutcome, DbError> {
    let collection = accessor.collection();
    let schema = accessor.schema();
    let mut sentinel = Document::new();
    sentinel.insert(schema.sentinel.field, schema.sentinel.value);

    let outcome = if collection_exists(accessor).await? {
        BootstrapOutcome::AlreadyPresent
    } else {
        tracing::info!(collection, "creating collection");
        let placeholder = (schema.placeholder)();
        schema.validate(&placeholder)?;

        match accessor.insert(placeholder).await {
            Ok(_) => BootstrapOutcome::Created,
            Err(err) if err.is_duplicate_key() => {
                if !collection_exists(accessor).await? {
                    return Err(DbError::Store(format!(
                        "placeholder for `{collection}` collided but the collection is missing"
                    )));
                }
                tracing::debug!(collection, "concurrent bootstrap detected");
                BootstrapOutcome::CreatedConcurrently
            }
            Err(err) => return Err(err),
        }
    };

    let purged = accessor.delete_many(sentinel).await?;
    match outcome {
        BootstrapOutcome::AlreadyPresent if purged > 0 => {
            tracing::warn!(collection, purged, "removed leftover placeholder records");
        }
        BootstrapOutcome::AlreadyPresent => {
            tracing::info!(collection, "collection present");
        }
        BootstrapOutcome::Created | BootstrapOutcome::CreatedConcurrently => {
            tracing::info!(collection, ?outcome, "collection created and initialised");
        }
    }
    Ok(outcome)
}

async fn collection_exists(accessor: &Accessor) -> Result<bool, DbError> {
    let names = accessor.list_collections().await?;
    tracing::debug!(?names, "available collections");
    Ok(names.iter().any(|name| name == accessor.collection()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, LazyLock};

    use mongodb::bson::Bson;

    use super::*;
    use crate::config::ConnectionTarget;
    use crate::connection::ConnectionManager;
    use crate::connection::tests::URI;
    use crate::models::Doctor;
    use crate::registry::ModelRegistry;
    use crate::schema::{
        DOCTOR, DOCTOR_SENTINEL_EMAIL, DOCTORS_COLLECTION, EntitySchema, IndexSpec,
        doctor_schema,
    };
    use crate::store::memory::MemoryDriver;
    use crate::store::{Driver, StoreConnection, StoreError};

    /// Doctor shape without indexes, so registering does not create the collection.
    static UNINDEXED: LazyLock<EntitySchema> = LazyLock::new(|| {
        let doctor = doctor_schema();
        EntitySchema {
            name: doctor.name,
            collection: doctor.collection,
            fields: doctor.fields.clone(),
            indexes: Vec::new(),
            timestamps: doctor.timestamps,
            placeholder: doctor.placeholder,
            sentinel: doctor.sentinel,
        }
    });

    async fn accessor_for(driver: Arc<dyn Driver>, schema: &'static EntitySchema) -> Accessor {
        let manager = Arc::new(ConnectionManager::new(driver, "prescripto"));
        manager.connect(Some(URI)).await.unwrap();
        let accessor = ModelRegistry::new(manager).register(DOCTOR, schema);
        accessor.wait_for_indexes().await;
        accessor
    }

    fn sentinels(driver: &MemoryDriver) -> usize {
        driver
            .cluster()
            .documents("prescripto", DOCTORS_COLLECTION)
            .iter()
            .filter(|d| matches!(d.get_str("email"), Ok(email) if email == DOCTOR_SENTINEL_EMAIL))
            .count()
    }

    #[tokio::test]
    async fn creates_missing_collection_without_residue() {
        let driver = MemoryDriver::new();
        let accessor = accessor_for(Arc::new(driver.clone()), &UNINDEXED).await;
        assert!(driver.cluster().collection_names("prescripto").is_empty());

        let outcome = ensure_collection(&accessor).await.unwrap();

        assert_eq!(outcome, BootstrapOutcome::Created);
        assert_eq!(
            driver.cluster().collection_names("prescripto"),
            vec![DOCTORS_COLLECTION.to_string()]
        );
        assert_eq!(sentinels(&driver), 0);
    }

    #[tokio::test]
    async fn repeated_runs_are_idempotent() {
        let driver = MemoryDriver::new();
        let accessor = accessor_for(Arc::new(driver.clone()), doctor_schema()).await;
        let bootstrap = Bootstrap::new(vec![accessor]);

        for _ in 0..5 {
            bootstrap.ensure_collections().await.unwrap();
            assert_eq!(sentinels(&driver), 0);
        }
        assert_eq!(
            driver.cluster().collection_names("prescripto"),
            vec![DOCTORS_COLLECTION.to_string()]
        );
    }

    #[tokio::test]
    async fn concurrent_runs_on_empty_store_both_succeed() {
        let driver = MemoryDriver::new();
        let accessor = accessor_for(Arc::new(driver.clone()), &UNINDEXED).await;
        let other = accessor.clone();

        let (a, b) = tokio::join!(ensure_collection(&accessor), ensure_collection(&other));
        a.unwrap();
        b.unwrap();

        assert_eq!(
            driver.cluster().collection_names("prescripto"),
            vec![DOCTORS_COLLECTION.to_string()]
        );
        assert_eq!(sentinels(&driver), 0);
    }

    #[tokio::test]
    async fn leftover_placeholder_is_purged() {
        let driver = MemoryDriver::new();
        let accessor = accessor_for(Arc::new(driver.clone()), doctor_schema()).await;
        accessor.insert(Doctor::placeholder_document()).await.unwrap();
        assert_eq!(sentinels(&driver), 1);

        let outcome = ensure_collection(&accessor).await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::AlreadyPresent);
        assert_eq!(sentinels(&driver), 0);
    }

    #[tokio::test]
    async fn duplicate_key_on_placeholder_counts_as_created() {
        let driver = MemoryDriver::new();
        let lagging = LaggingDriver {
            inner: driver.clone(),
            stale_listings: Arc::new(AtomicUsize::new(0)),
        };
        let stale = Arc::clone(&lagging.stale_listings);
        let accessor = accessor_for(Arc::new(lagging), doctor_schema()).await;

        // Another process is mid-bootstrap: its placeholder is in place, and our
        // listing has not caught up with the new collection yet.
        accessor.insert(Doctor::placeholder_document()).await.unwrap();
        stale.store(1, Ordering::SeqCst);

        let outcome = ensure_collection(&accessor).await.unwrap();

        assert_eq!(outcome, BootstrapOutcome::CreatedConcurrently);
        assert_eq!(sentinels(&driver), 0);
    }

    /// Reports no collections for the next `stale_listings` listings.
    struct LaggingDriver {
        inner: MemoryDriver,
        stale_listings: Arc<AtomicUsize>,
    }

    struct LaggingConnection {
        inner: Arc<dyn StoreConnection>,
        stale_listings: Arc<AtomicUsize>,
    }

    #[rocket::async_trait]
    impl Driver for LaggingDriver {
        async fn dial(
            &self,
            target: &ConnectionTarget,
        ) -> Result<Arc<dyn StoreConnection>, StoreError> {
            Ok(Arc::new(LaggingConnection {
                inner: self.inner.dial(target).await?,
                stale_listings: Arc::clone(&self.stale_listings),
            }))
        }
    }

    #[rocket::async_trait]
    impl StoreConnection for LaggingConnection {
        fn database_name(&self) -> &str {
            self.inner.database_name()
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }

        async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
            let lagging = self
                .stale_listings
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lagging {
                return Ok(Vec::new());
            }
            self.inner.list_collections().await
        }

        async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), StoreError> {
            self.inner.create_index(collection, index).await
        }

        async fn insert_one(&self, collection: &str, doc: Document) -> Result<Bson, StoreError> {
            self.inner.insert_one(collection, doc).await
        }

        async fn find_one(
            &self,
            collection: &str,
            filter: Document,
        ) -> Result<Option<Document>, StoreError> {
            self.inner.find_one(collection, filter).await
        }

        async fn find(&self, collection: &str, filter: Document) -> Result<Vec<Document>, StoreError> {
            self.inner.find(collection, filter).await
        }

        async fn update_one(
            &self,
            collection: &str,
            filter: Document,
            update: Document,
        ) -> Result<u64, StoreError> {
            self.inner.update_one(collection, filter, update).await
        }

        async fn delete_many(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
            self.inner.delete_many(collection, filter).await
        }

        async fn count(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
            self.inner.count(collection, filter).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }
}
