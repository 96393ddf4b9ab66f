//! # Document store seam
//!
//! The data core treats persistence as an opaque document store reachable by a
//! connection string. [`Driver`] performs the handshake, [`StoreConnection`] is
//! the live handle owned by the connection manager.
//!
//! Two backends are provided:
//! - [`mongo::MongoDriver`] for `mongodb://` and `mongodb+srv://` targets
//! - [`memory::MemoryDriver`] for `memory://` targets (tests, local development)

use std::sync::Arc;

use mongodb::bson::{Bson, Document};
use thiserror::Error;

use crate::config::{ConnectionTarget, Scheme};
use crate::schema::IndexSpec;

pub mod memory;
pub mod mongo;

/// Failure reported by a store backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("operation timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Whether the failure means the connection itself is gone.
    pub fn is_network(&self) -> bool {
        matches!(self, StoreError::Network(_) | StoreError::Timeout)
    }
}

/// A live handle to one logical database.
#[rocket::async_trait]
pub trait StoreConnection: Send + Sync {
    fn database_name(&self) -> &str;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), StoreError>;

    /// Inserts `doc`, creating the collection if needed. Returns the `_id`.
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<Bson, StoreError>;

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Option<Document>, StoreError>;

    async fn find(&self, collection: &str, filter: Document) -> Result<Vec<Document>, StoreError>;

    /// Applies a `$set` / `$unset` / `$inc` update to the first match. Returns the
    /// number of matched documents.
    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<u64, StoreError>;

    async fn delete_many(&self, collection: &str, filter: Document) -> Result<u64, StoreError>;

    async fn count(&self, collection: &str, filter: Document) -> Result<u64, StoreError>;

    /// Tears the connection down. Must be safe to call more than once.
    async fn close(&self);
}

/// Opens connections. One handshake per call.
#[rocket::async_trait]
pub trait Driver: Send + Sync {
    async fn dial(&self, target: &ConnectionTarget) -> Result<Arc<dyn StoreConnection>, StoreError>;
}

/// Dispatches on the target's scheme.
#[derive(Default)]
pub struct DefaultDriver {
    mongo: mongo::MongoDriver,
    memory: memory::MemoryDriver,
}

impl DefaultDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[rocket::async_trait]
impl Driver for DefaultDriver {
    async fn dial(&self, target: &ConnectionTarget) -> Result<Arc<dyn StoreConnection>, StoreError> {
        match target.scheme() {
            Scheme::Mongo | Scheme::MongoSrv => self.mongo.dial(target).await,
            Scheme::Memory => self.memory.dial(target).await,
        }
    }
}
