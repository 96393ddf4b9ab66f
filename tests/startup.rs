use std::sync::Arc;
use std::time::Duration;

use prescripto::{
    config::Settings,
    connection::ConnectionState,
    db::ClinicDb,
    errors::DbError,
    models::{Address, NewDoctor},
    schema::{DOCTOR_SENTINEL_EMAIL, DOCTORS_COLLECTION},
    shutdown::{Intake, IntakeError, ShutdownCoordinator},
    store::memory::MemoryDriver,
};

fn settings(uri: &str) -> Settings {
    Settings {
        mongodb_uri: Some(uri.to_string()),
        ..Settings::default()
    }
}

fn sentinel_count(driver: &MemoryDriver) -> usize {
    driver
        .cluster()
        .documents("prescripto", DOCTORS_COLLECTION)
        .iter()
        .filter(|d| matches!(d.get_str("email"), Ok(email) if email == DOCTOR_SENTINEL_EMAIL))
        .count()
}

fn doctor(email: &str) -> NewDoctor {
    NewDoctor {
        name: "Dr. Richard James".into(),
        email: email.into(),
        password_hash: "$2b$10$abcdefabcdefabcdef".into(),
        speciality: "General physician".into(),
        degree: "MBBS".into(),
        experience_label: "4 Years".into(),
        about: "General care.".into(),
        fees: 50.0,
        address: Address {
            line1: "17th Cross, Richmond".into(),
            line2: Some("Circle, Ring Road, London".into()),
        },
        available: None,
    }
}

#[tokio::test]
async fn uri_without_database_gets_it_once() {
    let driver = MemoryDriver::new();
    let db = ClinicDb::with_driver(Arc::new(driver.clone()), &settings("memory://cluster0"));

    let conn = db.ready().await.unwrap();

    assert_eq!(conn.target().uri(), "memory://cluster0/prescripto");
    assert_eq!(conn.target().uri().matches("prescripto").count(), 1);
    assert_eq!(db.manager().state(), ConnectionState::Connected);
}

#[tokio::test]
async fn uri_with_database_is_not_doubled() {
    let driver = MemoryDriver::new();
    let db = ClinicDb::with_driver(
        Arc::new(driver.clone()),
        &settings("memory://cluster0/prescripto?retryWrites=true"),
    );

    let conn = db.ready().await.unwrap();
    assert_eq!(
        conn.target().uri(),
        "memory://cluster0/prescripto?retryWrites=true"
    );
}

#[tokio::test]
async fn separate_processes_bootstrap_the_same_store() {
    let driver = MemoryDriver::new();
    let first = ClinicDb::with_driver(Arc::new(driver.clone()), &settings("memory://shared"));
    let second = ClinicDb::with_driver(Arc::new(driver.clone()), &settings("memory://shared"));

    let (a, b) = tokio::join!(first.ready(), second.ready());
    a.unwrap();
    b.unwrap();

    assert_eq!(
        driver.cluster().collection_names("prescripto"),
        vec![DOCTORS_COLLECTION.to_string()]
    );
    assert_eq!(sentinel_count(&driver), 0);

    for _ in 0..3 {
        first.close().await;
        first.ready().await.unwrap();
        assert_eq!(sentinel_count(&driver), 0);
    }
}

#[tokio::test]
async fn email_uniqueness_ignores_case() {
    let driver = MemoryDriver::new();
    let db = ClinicDb::with_driver(Arc::new(driver.clone()), &settings("memory://clinic"));
    db.ready().await.unwrap();
    let doctors = db.doctors().unwrap();
    doctors.accessor().wait_for_indexes().await;

    let (a, b) = tokio::join!(
        doctors.insert(doctor("Richard.James@Prescripto.io")),
        doctors.insert(doctor("richard.james@prescripto.IO")),
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(DbError::DuplicateKey { .. })))
            .count(),
        1
    );
    assert_eq!(doctors.list(false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn startup_fails_when_store_refuses() {
    let driver = MemoryDriver::new();
    driver.refuse_connections(true);
    let db = ClinicDb::with_driver(Arc::new(driver.clone()), &settings("memory://clinic"));

    assert!(matches!(db.ready().await, Err(DbError::Connection(_))));
    assert_eq!(db.manager().state(), ConnectionState::Disconnected);

    driver.refuse_connections(false);
    db.ready().await.unwrap();
}

struct DrainingServer;

#[rocket::async_trait]
impl Intake for DrainingServer {
    async fn stop_accepting(&self) -> Result<(), IntakeError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_releases_the_connection_once() {
    let driver = MemoryDriver::new();
    let db = ClinicDb::with_driver(Arc::new(driver.clone()), &settings("memory://clinic"));
    db.ready().await.unwrap();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
    let (a, b) = tokio::join!(
        coordinator.shutdown(&DrainingServer, db.manager()),
        coordinator.shutdown(&DrainingServer, db.manager()),
    );

    assert_eq!(a.or(b), Some(0));
    assert!(a.is_none() || b.is_none());
    assert_eq!(driver.closed_connections(), 1);
    assert!(!db.is_ready());
}
