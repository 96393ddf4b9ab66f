//! MongoDB backend.

use std::sync::Arc;
use std::time::Duration;

use mongodb::{
    Client, Collection, Database, IndexModel,
    bson::{Bson, Document, doc},
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::{ClientOptions, Collation, CollationStrength, IndexOptions},
};
use rocket::futures::TryStreamExt;

use super::{Driver, StoreConnection, StoreError};
use crate::config::ConnectionTarget;
use crate::schema::IndexSpec;

const DUPLICATE_KEY_CODE: i32 = 11000;
const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MongoDriver {
    app_name: String,
}

impl Default for MongoDriver {
    fn default() -> Self {
        Self {
            app_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

#[rocket::async_trait]
impl Driver for MongoDriver {
    async fn dial(&self, target: &ConnectionTarget) -> Result<Arc<dyn StoreConnection>, StoreError> {
        let mut options = ClientOptions::parse(target.uri()).await.map_err(map_error)?;
        options.app_name = Some(self.app_name.clone());
        options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);
        options.connect_timeout = Some(SERVER_SELECTION_TIMEOUT);

        let client = Client::with_options(options).map_err(map_error)?;
        let database = client.database(target.database());

        // The driver connects lazily; ping forces the handshake.
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(map_error)?;

        Ok(Arc::new(MongoConnection {
            client,
            database,
            name: target.database().to_string(),
        }))
    }
}

pub struct MongoConnection {
    client: Client,
    database: Database,
    name: String,
}

impl MongoConnection {
    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection::<Document>(name)
    }
}

#[rocket::async_trait]
impl StoreConnection for MongoConnection {
    fn database_name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        self.database
            .list_collection_names()
            .await
            .map_err(map_error)
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), StoreError> {
        let keys: Document = index
            .keys
            .iter()
            .map(|key| (key.clone(), Bson::Int32(1)))
            .collect();

        let collation = index.case_insensitive.then(|| {
            Collation::builder()
                .locale("en")
                .strength(CollationStrength::Secondary)
                .build()
        });

        let options = IndexOptions::builder()
            .name(index.name.clone())
            .unique(index.unique)
            .collation(collation)
            .build();

        let model = IndexModel::builder().keys(keys).options(options).build();

        self.collection(collection)
            .create_index(model)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn insert_one(&self, collection: &str, doc: Document) -> Result<Bson, StoreError> {
        self.collection(collection)
            .insert_one(doc)
            .await
            .map(|result| result.inserted_id)
            .map_err(map_error)
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Option<Document>, StoreError> {
        self.collection(collection)
            .find_one(filter)
            .await
            .map_err(map_error)
    }

    async fn find(&self, collection: &str, filter: Document) -> Result<Vec<Document>, StoreError> {
        let cursor = self
            .collection(collection)
            .find(filter)
            .await
            .map_err(map_error)?;

        cursor.try_collect().await.map_err(map_error)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<u64, StoreError> {
        self.collection(collection)
            .update_one(filter, update)
            .await
            .map(|result| result.matched_count)
            .map_err(map_error)
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
        self.collection(collection)
            .delete_many(filter)
            .await
            .map(|result| result.deleted_count)
            .map_err(map_error)
    }

    async fn count(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
        self.collection(collection)
            .count_documents(filter)
            .await
            .map_err(map_error)
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

fn map_error(err: MongoError) -> StoreError {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY_CODE => {
            StoreError::DuplicateKey(write.message.clone())
        }
        ErrorKind::Command(command) if command.code == DUPLICATE_KEY_CODE => {
            StoreError::DuplicateKey(command.message.clone())
        }
        ErrorKind::InvalidArgument { .. } => StoreError::Other(err.to_string()),
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. } => StoreError::Network(err.to_string()),
        _ => StoreError::Other(err.to_string()),
    }
}
