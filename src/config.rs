//! # Configuration
//!
//! Runtime settings are read from CLI flags or the environment (a `.env` file is
//! loaded first, see `main.rs`):
//!
//! - `MONGODB_URI`: store connection string (required)
//! - `DATABASE_NAME`: logical database every connection targets (default `prescripto`)
//! - `PORT`: HTTP port (default `4000`)
//! - `APP_ENV`: deployment label used in logs (default `development`)
//! - `SHUTDOWN_GRACE_SECS`: bound on draining in-flight requests (default `10`)
//! - `LOG_LEVEL`: tracing filter when `RUST_LOG` is unset (default `info`)

use std::fmt;
use std::time::Duration;

use clap::ArgMatches;

use crate::errors::DbError;

pub const DEFAULT_DATABASE: &str = "prescripto";
pub const DEFAULT_PORT: u16 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Mongo,
    MongoSrv,
    Memory,
}

impl Scheme {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "mongodb" => Some(Scheme::Mongo),
            "mongodb+srv" => Some(Scheme::MongoSrv),
            "memory" => Some(Scheme::Memory),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Mongo => "mongodb",
            Scheme::MongoSrv => "mongodb+srv",
            Scheme::Memory => "memory",
        }
    }
}

/// A connection string normalised to address exactly one database.
///
/// The database name is configured separately; whatever path segment the
/// caller's string carried is replaced by it, and it is appended when missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    uri: String,
    scheme: Scheme,
    authority: String,
    database: String,
    replaced_database: Option<String>,
}

impl ConnectionTarget {
    pub fn parse(uri: Option<&str>, database: &str) -> Result<Self, DbError> {
        let raw = uri
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DbError::Config("connection string is not set".to_string()))?;

        validate_database_name(database)?;

        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| malformed("missing `://` separator"))?;
        let scheme = Scheme::parse(scheme)
            .ok_or_else(|| malformed(&format!("unsupported scheme `{scheme}`")))?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match location.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (location, ""),
        };

        if authority.is_empty() || authority.chars().any(char::is_whitespace) {
            return Err(malformed("missing or invalid host"));
        }

        let path = path.trim_end_matches('/');
        if path.contains('/') {
            return Err(malformed("path must be a single database segment"));
        }
        let replaced_database = (!path.is_empty() && path != database).then(|| path.to_string());

        let mut normalized = format!("{}://{}/{}", scheme.as_str(), authority, database);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            normalized.push('?');
            normalized.push_str(query);
        }

        Ok(Self {
            uri: normalized,
            scheme,
            authority: authority.to_string(),
            database: database.to_string(),
            replaced_database,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Database name the input string carried when it differed from the configured one.
    pub fn replaced_database(&self) -> Option<&str> {
        self.replaced_database.as_deref()
    }

    /// The connection string with any password masked, for logging.
    pub fn redacted(&self) -> String {
        match self.authority.rsplit_once('@') {
            Some((userinfo, host)) => {
                let user = userinfo.split_once(':').map_or(userinfo, |(user, _)| user);
                let masked = if userinfo.contains(':') {
                    format!("{user}:*****")
                } else {
                    user.to_string()
                };
                self.uri.replacen(
                    &format!("{userinfo}@{host}"),
                    &format!("{masked}@{host}"),
                    1,
                )
            }
            None => self.uri.clone(),
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

fn malformed(reason: &str) -> DbError {
    DbError::Config(format!("malformed connection string: {reason}"))
}

fn validate_database_name(name: &str) -> Result<(), DbError> {
    const FORBIDDEN: &[char] = &['/', '\\', '.', ' ', '"', '$', '*', '<', '>', ':', '|', '?'];

    if name.is_empty() || name.contains(FORBIDDEN) {
        return Err(DbError::Config(format!("invalid database name `{name}`")));
    }
    Ok(())
}

/// Process settings resolved from CLI flags and the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mongodb_uri: Option<String>,
    pub database: String,
    pub port: u16,
    pub environment: String,
    pub log_level: String,
    pub shutdown_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mongodb_uri: None,
            database: DEFAULT_DATABASE.to_string(),
            port: DEFAULT_PORT,
            environment: "development".to_string(),
            log_level: "info".to_string(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Settings {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        let defaults = Self::default();

        Self {
            mongodb_uri: matches.get_one::<String>("uri").cloned(),
            database: matches
                .get_one::<String>("database")
                .cloned()
                .unwrap_or(defaults.database),
            port: matches
                .get_one::<u16>("port")
                .copied()
                .unwrap_or(defaults.port),
            environment: matches
                .get_one::<String>("env")
                .cloned()
                .unwrap_or(defaults.environment),
            log_level: matches
                .get_one::<String>("log-level")
                .cloned()
                .unwrap_or(defaults.log_level),
            shutdown_grace: matches
                .get_one::<u64>("shutdown-grace")
                .map(|secs| Duration::from_secs(*secs))
                .unwrap_or(defaults.shutdown_grace),
        }
    }

    /// Resolves the connection target, failing with `Config` when the URI is
    /// missing or malformed.
    pub fn target(&self) -> Result<ConnectionTarget, DbError> {
        ConnectionTarget::parse(self.mongodb_uri.as_deref(), &self.database)
    }
}
