use rocket::Request;
use rocket::http::{ContentType, Status};
use rocket::response::{self, Responder, Response};
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the data core.
///
/// `Clone` so that every caller sharing a single handshake attempt can
/// observe the same failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("duplicate key in `{collection}`: {detail}")]
    DuplicateKey { collection: String, detail: String },
    #[error("no record `{id}` in `{collection}`")]
    NotFound { collection: String, id: String },
    #[error("model `{0}` is not registered")]
    NotRegistered(String),
    #[error("index build failed for `{collection}`: {detail}")]
    IndexBuild { collection: String, detail: String },
    #[error("invalid `{field}`: {reason}")]
    Validation { field: String, reason: String },
    #[error("store error: {0}")]
    Store(String),
}

impl DbError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        DbError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Maps a store failure raised while working on `collection`.
    pub fn from_store(collection: &str, err: StoreError) -> Self {
        match err {
            StoreError::DuplicateKey(detail) => DbError::DuplicateKey {
                collection: collection.to_string(),
                detail,
            },
            StoreError::Network(msg) => DbError::Connection(msg),
            StoreError::Timeout => DbError::Connection("operation timed out".to_string()),
            StoreError::Other(msg) => DbError::Store(msg),
        }
    }

    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, DbError::DuplicateKey { .. })
    }

    fn status(&self) -> Status {
        match self {
            DbError::Config(_) | DbError::Connection(_) => Status::ServiceUnavailable,
            DbError::DuplicateKey { .. } => Status::Conflict,
            DbError::NotFound { .. } => Status::NotFound,
            DbError::Validation { .. } => Status::BadRequest,
            DbError::NotRegistered(_) | DbError::IndexBuild { .. } | DbError::Store(_) => {
                Status::InternalServerError
            }
        }
    }
}

impl<'r> Responder<'r, 'static> for DbError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        let message = match &self {
            DbError::Validation { .. } | DbError::DuplicateKey { .. } | DbError::NotFound { .. } => {
                self.to_string()
            }
            DbError::Config(_) | DbError::Connection(_) => "Database unavailable".to_string(),
            _ => "Internal server error".to_string(),
        };

        let body = json!({
            "success": false,
            "message": message,
            "status": status.code
        })
        .to_string();

        Response::build()
            .status(status)
            .header(ContentType::JSON)
            .sized_body(body.len(), std::io::Cursor::new(body))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_duplicate_key_keeps_collection() {
        let err = DbError::from_store("doctors", StoreError::DuplicateKey("email".into()));
        assert_eq!(
            err,
            DbError::DuplicateKey {
                collection: "doctors".into(),
                detail: "email".into()
            }
        );
        assert!(err.is_duplicate_key());
    }

    #[test]
    fn network_failures_become_connection_errors() {
        let err = DbError::from_store("doctors", StoreError::Network("reset".into()));
        assert!(matches!(err, DbError::Connection(_)));
        assert_eq!(err.status(), Status::ServiceUnavailable);
    }

    #[rocket::get("/duplicate")]
    fn duplicate() -> Result<&'static str, DbError> {
        Err(DbError::DuplicateKey {
            collection: "doctors".into(),
            detail: "email_1".into(),
        })
    }

    #[rocket::get("/offline")]
    fn offline() -> Result<&'static str, DbError> {
        Err(DbError::Connection("connection reset by peer".into()))
    }

    #[rocket::async_test]
    async fn responds_with_json_body() {
        use rocket::local::asynchronous::Client;

        let rocket = rocket::build().mount("/", rocket::routes![duplicate, offline]);
        let client = Client::untracked(rocket).await.unwrap();

        let response = client.get("/duplicate").dispatch().await;
        assert_eq!(response.status(), Status::Conflict);
        assert_eq!(response.content_type(), Some(ContentType::JSON));
        let body: serde_json::Value = response.into_json().await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["status"], 409);

        // Store internals stay out of the body.
        let response = client.get("/offline").dispatch().await;
        assert_eq!(response.status(), Status::ServiceUnavailable);
        let body: serde_json::Value = response.into_json().await.unwrap();
        assert_eq!(body["message"], "Database unavailable");
    }
}
