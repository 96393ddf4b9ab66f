use clap::{Arg, ArgMatches, Command, value_parser};

use crate::config::DEFAULT_DATABASE;

pub const SERVE: &str = "serve";
pub const ENSURE_COLLECTIONS: &str = "ensure-collections";

pub fn cli() -> Command {
    Command::new("prescripto")
        .about("Prescripto clinic backend")
        .arg(
            Arg::new("uri")
                .long("uri")
                .env("MONGODB_URI")
                .global(true)
                .help("Document store connection string")
                .value_name("URI"),
        )
        .arg(
            Arg::new("database")
                .long("database")
                .env("DATABASE_NAME")
                .global(true)
                .default_value(DEFAULT_DATABASE)
                .help("Database the connection string is pointed at")
                .value_name("NAME"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .env("PORT")
                .global(true)
                .default_value("4000")
                .value_parser(value_parser!(u16))
                .help("HTTP port"),
        )
        .arg(
            Arg::new("env")
                .long("env")
                .env("APP_ENV")
                .global(true)
                .default_value("development")
                .help("Deployment environment label"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .env("LOG_LEVEL")
                .global(true)
                .default_value("info")
                .help("Log filter, overridden by RUST_LOG"),
        )
        .arg(
            Arg::new("shutdown-grace")
                .long("shutdown-grace")
                .env("SHUTDOWN_GRACE_SECS")
                .global(true)
                .default_value("10")
                .value_parser(value_parser!(u64))
                .help("Seconds in-flight requests get to finish on shutdown")
                .value_name("SECS"),
        )
        .subcommand(Command::new(SERVE).about("Connect, bootstrap and serve HTTP (default)"))
        .subcommand(
            Command::new(ENSURE_COLLECTIONS)
                .about("Connect, create missing collections and exit"),
        )
}

/// Subcommand to run; `serve` when none is given.
pub fn command_name(matches: &ArgMatches) -> &str {
    matches.subcommand_name().unwrap_or(SERVE)
}
