use std::sync::Arc;

use rocket::{Build, Rocket, catchers, figment::Figment, http::Method, routes};
use rocket_cors::{AllowedOrigins, CorsOptions};

use crate::{db::ClinicDb, handlers};

/// Assembles the HTTP server around `db`.
pub fn build(figment: Figment, db: Arc<ClinicDb>) -> Result<Rocket<Build>, rocket_cors::Error> {
    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![
                Method::Get,
                Method::Post,
                Method::Patch,
                Method::Put,
                Method::Delete,
            ]
            .into_iter()
            .map(From::from)
            .collect(),
        )
        .allow_credentials(true)
        .to_cors()?;

    Ok(rocket::custom(figment)
        .manage(db)
        .attach(cors)
        .register(
            "/",
            catchers![handlers::catch404, handlers::catch500, handlers::catch503],
        )
        .mount("/", routes![handlers::index])
        .mount("/", handlers::misc::routes()))
}
