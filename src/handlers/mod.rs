use chrono::Utc;
use rocket::{Request, catch, get, http::Status, serde::json::Json};
use serde::Serialize;

pub mod misc;

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
pub struct Liveness {
    pub status: &'static str,
    pub message: &'static str,
    pub timestamp: String,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
pub struct ErrorBody {
    pub success: bool,
    pub message: String,
    pub status: u16,
}

fn error_body(status: Status, message: String) -> Json<ErrorBody> {
    Json(ErrorBody {
        success: false,
        message,
        status: status.code,
    })
}

#[get("/")]
pub fn index() -> Json<Liveness> {
    Json(Liveness {
        status: "ok",
        message: "Backend is running",
        timestamp: Utc::now().to_rfc3339(),
    })
}

#[catch(404)]
pub fn catch404(req: &Request<'_>) -> Json<ErrorBody> {
    error_body(Status::NotFound, format!("No route for {}", req.uri().path()))
}

#[catch(500)]
pub fn catch500(_: &Request<'_>) -> Json<ErrorBody> {
    error_body(Status::InternalServerError, "Internal server error".to_string())
}

#[catch(503)]
pub fn catch503(_: &Request<'_>) -> Json<ErrorBody> {
    error_body(Status::ServiceUnavailable, "Database unavailable".to_string())
}
