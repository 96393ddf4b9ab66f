//! # Prescripto - data core of the Prescripto clinic backend
//!
//! Owns the single document-store connection of the process, the `Doctor`
//! model and its collection, and the ordered shutdown of the HTTP server.
//!
//! ## Environment Variables
//!
//! - `MONGODB_URI`: connection string (`mongodb://`, `mongodb+srv://`, or
//!   `memory://` for the in-process store)
//! - `DATABASE_NAME`: database to use, `prescripto` by default
//! - `PORT`: HTTP port, 4000 by default
//! - `APP_ENV`: deployment environment label
//! - `SHUTDOWN_GRACE_SECS`: time in-flight requests get on shutdown
//! - `LOG_LEVEL` / `RUST_LOG`: log filter

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod connection;
pub mod db;
pub mod doctors;
pub mod errors;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod registry;
pub mod schema;
pub mod server;
pub mod shutdown;
pub mod store;
