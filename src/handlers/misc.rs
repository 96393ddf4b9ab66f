use std::sync::Arc;

use rocket::{State, get, http::Status, routes as rocket_routes, serde::json::Json};
use serde::{Deserialize, Serialize};

use crate::{db::ClinicDb, schema::DOCTORS_COLLECTION};

#[derive(Serialize, Deserialize, Clone, Default, Debug)]
#[serde(crate = "rocket::serde")]
pub struct CollectionStatus {
    pub doctors: String,
}

#[derive(Serialize, Deserialize, Clone, Default, Debug)]
#[serde(crate = "rocket::serde")]
pub struct HealthStatus {
    pub db_status: String,
    pub collections_status: CollectionStatus,
}

/// Reports store readiness and whether the `doctors` collection exists.
/// Answers 503 when the store is not ready.
#[get("/check-health")]
pub async fn health(db: &State<Arc<ClinicDb>>) -> (Status, Json<HealthStatus>) {
    let mut health = HealthStatus::default();

    if !db.is_ready() {
        health.db_status = format!("database {}", db.manager().state());
        health.collections_status.doctors = "unknown".to_string();
        return (Status::ServiceUnavailable, Json(health));
    }

    let collections = match db.doctors() {
        Ok(doctors) => doctors.accessor().list_collections().await,
        Err(err) => Err(err),
    };

    match collections {
        Ok(names) => {
            health.db_status = "database online".to_string();
            health.collections_status.doctors = if names.iter().any(|c| c == DOCTORS_COLLECTION) {
                "doctors collection online".to_string()
            } else {
                "doctors collection missing".to_string()
            };
            (Status::Ok, Json(health))
        }
        Err(err) => {
            tracing::warn!(error = %err, "health check failed");
            health.db_status = "database offline".to_string();
            health.collections_status.doctors = "unknown".to_string();
            (Status::ServiceUnavailable, Json(health))
        }
    }
}

pub fn routes() -> Vec<rocket::Route> {
    rocket_routes![health]
}
