//! # Connection manager
//!
//! Owns the single live store connection of the process and tracks it with an
//! explicit state machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!                              Connecting --err--> Disconnected
//! Connected --network loss--> Disconnected
//! Connected --disconnect()--> Disconnected
//! ```
//!
//! Concurrent `connect()` calls share one handshake attempt. Transitions are
//! delivered to [`ConnectionObserver`]s.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use crate::config::ConnectionTarget;
use crate::errors::DbError;
use crate::store::{Driver, StoreConnection, StoreError};

/// Bound on a single handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connecting { target: String },
    Connected { generation: u64, target: String },
    Error { message: String },
    Disconnected { reason: DisconnectReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    HandshakeFailed,
    ConnectionLost,
}

/// Receives every state transition of a [`ConnectionManager`].
pub trait ConnectionObserver: Send + Sync {
    fn on_event(&self, event: &ConnectionEvent);
}

/// Default observer: one log line per transition.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ConnectionObserver for TracingObserver {
    fn on_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connecting { target } => {
                tracing::info!(%target, "connecting to document store");
            }
            ConnectionEvent::Connected { generation, target } => {
                tracing::info!(generation, %target, "store connection established");
            }
            ConnectionEvent::Error { message } => {
                tracing::error!(error = %message, "store connection error");
            }
            ConnectionEvent::Disconnected { reason } => {
                tracing::info!(?reason, "store connection closed");
            }
        }
    }
}

/// A handle to the live connection. Clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    generation: u64,
    target: ConnectionTarget,
    store: Arc<dyn StoreConnection>,
}

impl Connection {
    /// Distinct per handshake; later handshakes get larger numbers.
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.inner.target
    }

    pub fn store(&self) -> &dyn StoreConnection {
        self.inner.store.as_ref()
    }

    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("generation", &self.inner.generation)
            .field("target", &self.inner.target.redacted())
            .finish()
    }
}

type AttemptResult = Result<Connection, DbError>;

/// One handshake, shared by every caller that arrives while it is in flight.
struct Attempt {
    generation: u64,
    outcome: watch::Sender<Option<AttemptResult>>,
}

enum State {
    Disconnected,
    Connecting(Arc<Attempt>),
    Connected(Connection),
}

pub struct ConnectionManager {
    driver: Arc<dyn Driver>,
    database: String,
    handshake_timeout: Duration,
    observers: Vec<Arc<dyn ConnectionObserver>>,
    state: Arc<Mutex<State>>,
    generations: AtomicU64,
}

impl ConnectionManager {
    pub fn new(driver: Arc<dyn Driver>, database: impl Into<String>) -> Self {
        Self {
            driver,
            database: database.into(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            observers: vec![Arc::new(TracingObserver)],
            state: Arc::new(Mutex::new(State::Disconnected)),
            generations: AtomicU64::new(0),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.lock() {
            State::Disconnected => ConnectionState::Disconnected,
            State::Connecting(_) => ConnectionState::Connecting,
            State::Connected(_) => ConnectionState::Connected,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The live connection, or a `Connection` error when not ready.
    pub fn current(&self) -> Result<Connection, DbError> {
        match &*self.lock() {
            State::Connected(conn) => Ok(conn.clone()),
            _ => Err(DbError::Connection("not connected".to_string())),
        }
    }

    /// Returns the live connection, opening one with `uri` if needed.
    ///
    /// While connected this returns the existing connection without touching
    /// the network. Callers arriving during a handshake wait for it and get
    /// the same connection or the same error.
    pub async fn connect(&self, uri: Option<&str>) -> Result<Connection, DbError> {
        let (attempt, started) = {
            let mut state = self.lock();
            match &*state {
                State::Connected(conn) => {
                    tracing::debug!(generation = conn.generation(), "reusing store connection");
                    return Ok(conn.clone());
                }
                State::Connecting(attempt) => (Arc::clone(attempt), None),
                State::Disconnected => {
                    let target = ConnectionTarget::parse(uri, &self.database)?;
                    let attempt = Arc::new(Attempt {
                        generation: self.generations.fetch_add(1, Ordering::SeqCst) + 1,
                        outcome: watch::channel(None).0,
                    });
                    *state = State::Connecting(Arc::clone(&attempt));
                    (attempt, Some(target))
                }
            }
        };
        if let Some(target) = started {
            self.emit(ConnectionEvent::Connecting {
                target: target.redacted(),
            });
            self.spawn_handshake(&attempt, target);
        }

        let mut rx = attempt.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(ready) => (*ready)
                .clone()
                .unwrap_or_else(|| Err(DbError::Connection("handshake abandoned".to_string()))),
            Err(_) => Err(DbError::Connection("handshake abandoned".to_string())),
        };

        self.settle(&attempt, outcome).await
    }

    /// Runs the handshake on its own task so it completes even if every
    /// waiting caller is dropped.
    fn spawn_handshake(&self, attempt: &Arc<Attempt>, target: ConnectionTarget) {
        if let Some(previous) = target.replaced_database() {
            tracing::warn!(
                previous,
                database = %self.database,
                "connection string names another database, using the configured one"
            );
        }

        let driver = Arc::clone(&self.driver);
        let timeout = self.handshake_timeout;
        let generation = attempt.generation;
        let task_attempt = Arc::clone(attempt);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, driver.dial(&target)).await {
                Ok(Ok(store)) => Ok(Connection {
                    inner: Arc::new(ConnectionInner {
                        generation,
                        target,
                        store,
                    }),
                }),
                Ok(Err(err)) => Err(DbError::Connection(err.to_string())),
                Err(_) => Err(DbError::Connection(format!(
                    "handshake did not complete within {timeout:?}"
                ))),
            };
            let dialled = outcome.as_ref().ok().cloned();
            task_attempt.outcome.send_replace(Some(outcome));

            // Nobody may be left to settle an attempt that disconnect() cancelled.
            if let Some(conn) = dialled {
                let live = {
                    let state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    match &*state {
                        State::Connecting(current) => current.generation == generation,
                        State::Connected(current) => current.same_as(&conn),
                        State::Disconnected => false,
                    }
                };
                if !live {
                    tracing::debug!(generation, "closing connection of a cancelled handshake");
                    conn.store().close().await;
                }
            }
        });
    }

    /// Moves the state out of `Connecting` for a resolved attempt. Only the
    /// first caller to get here performs the transition; a connection whose
    /// attempt was cancelled by `disconnect()` is closed.
    async fn settle(&self, attempt: &Attempt, outcome: AttemptResult) -> AttemptResult {
        let mut transitioned = false;
        let mut stale = None;
        {
            let mut state = self.lock();
            match (&*state, &outcome) {
                (State::Connecting(current), _) if current.generation == attempt.generation => {
                    *state = match &outcome {
                        Ok(conn) => State::Connected(conn.clone()),
                        Err(_) => State::Disconnected,
                    };
                    transitioned = true;
                }
                (State::Connected(live), Ok(conn)) if live.same_as(conn) => {}
                (_, Ok(conn)) => stale = Some(conn.clone()),
                (_, Err(_)) => {}
            }
        }

        if let Some(conn) = stale {
            conn.store().close().await;
            return Err(DbError::Connection(
                "disconnected while the handshake was in flight".to_string(),
            ));
        }

        if transitioned {
            match &outcome {
                Ok(conn) => self.emit(ConnectionEvent::Connected {
                    generation: conn.generation(),
                    target: conn.target().redacted(),
                }),
                Err(err) => {
                    self.emit(ConnectionEvent::Error {
                        message: err.to_string(),
                    });
                    self.emit(ConnectionEvent::Disconnected {
                        reason: DisconnectReason::HandshakeFailed,
                    });
                }
            }
        }
        outcome
    }

    /// Releases the connection if one is held; otherwise a no-op.
    pub async fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.lock(), State::Disconnected);
        match previous {
            State::Disconnected => {}
            State::Connecting(attempt) => {
                tracing::warn!("disconnect requested during handshake");
                let dialled = {
                    let outcome = attempt.outcome.borrow();
                    match &*outcome {
                        Some(Ok(conn)) => Some(conn.clone()),
                        _ => None,
                    }
                };
                if let Some(conn) = dialled {
                    conn.store().close().await;
                }
                self.emit(ConnectionEvent::Disconnected {
                    reason: DisconnectReason::Requested,
                });
            }
            State::Connected(conn) => {
                conn.store().close().await;
                self.emit(ConnectionEvent::Disconnected {
                    reason: DisconnectReason::Requested,
                });
            }
        }
    }

    /// Records a network failure observed on `conn`. Flips readiness off if
    /// `conn` is still the live connection.
    pub fn report_lost(&self, conn: &Connection, err: &StoreError) {
        let lost = {
            let mut state = self.lock();
            let live = matches!(&*state, State::Connected(c) if c.same_as(conn));
            if live {
                *state = State::Disconnected;
            }
            live
        };

        if lost {
            self.emit(ConnectionEvent::Error {
                message: err.to_string(),
            });
            self.emit(ConnectionEvent::Disconnected {
                reason: DisconnectReason::ConnectionLost,
            });
        }
    }
}
