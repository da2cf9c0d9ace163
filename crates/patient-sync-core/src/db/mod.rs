//! Database layer for the local patient cache.

mod operations;
mod patients;
mod schema;
mod sync_state;

#[allow(unused_imports)]
pub use operations::*;
pub use patients::*;
pub use schema::*;
pub use sync_state::*;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl<T> From<PoisonError<T>> for DbError {
    fn from(e: PoisonError<T>) -> Self {
        DbError::LockPoisoned(e.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Database connection wrapper.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open database at path, creating if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Create in-memory database (for testing).
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Initialize schema.
    fn initialize(&self) -> DbResult<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Get raw connection (for advanced queries).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a single transaction, committing only if it succeeds.
    ///
    /// Must not be nested.
    pub fn atomically<T>(&self, f: impl FnOnce(&Self) -> DbResult<T>) -> DbResult<T> {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Shared handle to the database used by the local store and the operation log.
///
/// All access is serialized through one mutex; critical sections are short
/// synchronous SQLite calls and the guard is never held across an `.await`.
#[derive(Clone)]
pub struct Storage {
    db: Arc<Mutex<Database>>,
}

impl Storage {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Open at `path`, or in memory when `None`.
    pub fn open(path: Option<&Path>) -> DbResult<Self> {
        let db = match path {
            Some(path) => Database::open(path)?,
            None => Database::open_in_memory()?,
        };
        Ok(Self::new(db))
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Database>> {
        Ok(self.db.lock()?)
    }

    /// Run a read against the database.
    pub fn read<T>(&self, f: impl FnOnce(&Database) -> DbResult<T>) -> DbResult<T> {
        let db = self.lock()?;
        f(&db)
    }

    /// Run a write atomically.
    pub fn write<T>(&self, f: impl FnOnce(&Database) -> DbResult<T>) -> DbResult<T> {
        let db = self.lock()?;
        db.atomically(f)
    }
}
