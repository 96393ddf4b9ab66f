//! # Clinic database
//!
//! Ties the [`ConnectionManager`], the [`ModelRegistry`] and the bootstrap
//! step together. Rocket manages one `Arc<ClinicDb>` and handlers reach the
//! store only through it.
//!
//! ## Configuration
//!
//! - `MONGODB_URI`: connection string (`mongodb://`, `mongodb+srv://` or
//!   `memory://`)
//! - `DATABASE_NAME`: database the connection string is pointed at

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{
    bootstrap::{Bootstrap, BootstrapOutcome},
    config::Settings,
    connection::{Connection, ConnectionManager},
    doctors::Doctors,
    errors::DbError,
    registry::{IndexStatus, ModelRegistry},
    schema::{DOCTOR, doctor_schema},
    store::{DefaultDriver, Driver},
};

pub struct ClinicDb {
    manager: Arc<ConnectionManager>,
    registry: ModelRegistry,
    uri: Option<String>,
    /// Generation of the last connection that completed bootstrap.
    bootstrapped: Mutex<u64>,
}

impl ClinicDb {
    pub fn new(manager: Arc<ConnectionManager>, uri: Option<String>) -> Self {
        Self {
            registry: ModelRegistry::new(Arc::clone(&manager)),
            manager,
            uri,
            bootstrapped: Mutex::new(0),
        }
    }

    /// Builds a database over the default drivers from `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::with_driver(Arc::new(DefaultDriver::default()), settings)
    }

    pub fn with_driver(driver: Arc<dyn Driver>, settings: &Settings) -> Self {
        let manager = ConnectionManager::new(driver, settings.database.clone());
        Self::new(Arc::new(manager), settings.mongodb_uri.clone())
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn is_ready(&self) -> bool {
        self.manager.is_ready()
    }

    /// Connects if needed, registers the models and bootstraps their
    /// collections once per connection generation.
    ///
    /// A failed bootstrap releases the connection so the next call starts
    /// over with a fresh handshake.
    pub async fn ready(&self) -> Result<Connection, DbError> {
        let conn = self.manager.connect(self.uri.as_deref()).await?;
        let doctors = self.registry.register(DOCTOR, doctor_schema());

        let mut bootstrapped = self.bootstrapped.lock().await;
        if *bootstrapped == conn.generation() {
            return Ok(conn);
        }

        if matches!(doctors.index_status(), IndexStatus::Failed(_)) {
            doctors.rebuild_indexes();
        }

        match Bootstrap::new(vec![doctors]).ensure_collections().await {
            Ok(outcomes) => {
                let created = outcomes
                    .iter()
                    .filter(|o| **o != BootstrapOutcome::AlreadyPresent)
                    .count();
                tracing::info!(
                    generation = conn.generation(),
                    created,
                    "database ready"
                );
                *bootstrapped = conn.generation();
                Ok(conn)
            }
            Err(err) => {
                tracing::error!(error = %err, "bootstrap failed");
                drop(bootstrapped);
                self.manager.disconnect().await;
                Err(err)
            }
        }
    }

    pub fn doctors(&self) -> Result<Doctors, DbError> {
        self.registry.get(DOCTOR).map(Doctors::new)
    }

    pub async fn close(&self) {
        self.manager.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::URI;
    use crate::schema::DOCTORS_COLLECTION;
    use crate::store::memory::MemoryDriver;

    fn clinic(driver: &MemoryDriver, uri: Option<&str>) -> ClinicDb {
        let settings = Settings {
            mongodb_uri: uri.map(str::to_string),
            ..Settings::default()
        };
        ClinicDb::with_driver(Arc::new(driver.clone()), &settings)
    }

    #[tokio::test]
    async fn ready_bootstraps_once_per_generation() {
        let driver = MemoryDriver::new();
        let db = clinic(&driver, Some(URI));

        let first = db.ready().await.unwrap();
        let second = db.ready().await.unwrap();

        assert!(first.same_as(&second));
        assert_eq!(driver.handshakes(), 1);
        assert_eq!(first.target().database(), "prescripto");
        assert_eq!(
            driver.cluster().collection_names("prescripto"),
            vec![DOCTORS_COLLECTION.to_string()]
        );
        assert!(db.doctors().is_ok());
    }

    #[tokio::test]
    async fn reconnect_bootstraps_again() {
        let driver = MemoryDriver::new();
        let db = clinic(&driver, Some(URI));

        let first = db.ready().await.unwrap();
        db.close().await;
        assert!(!db.is_ready());

        let second = db.ready().await.unwrap();
        assert!(second.generation() > first.generation());
        assert_eq!(driver.handshakes(), 2);
    }

    #[tokio::test]
    async fn missing_uri_is_a_config_error() {
        let driver = MemoryDriver::new();
        let db = clinic(&driver, None);

        assert!(matches!(db.ready().await, Err(DbError::Config(_))));
        assert_eq!(driver.handshakes(), 0);
        assert!(matches!(db.doctors(), Err(DbError::NotRegistered(_))));
    }

    #[tokio::test]
    async fn refused_handshake_is_a_connection_error() {
        let driver = MemoryDriver::new();
        driver.refuse_connections(true);
        let db = clinic(&driver, Some(URI));

        assert!(matches!(db.ready().await, Err(DbError::Connection(_))));
        assert!(!db.is_ready());
    }
}
