//! SQLite storage layer -- schema, rules, metrics and findings.

pub mod findings;
pub mod metrics;
pub mod rules;
pub mod schema;

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::{Pool as R2D2Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::detect::source::SourceError;
use crate::detect::DetectError;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

fn init_connection(c: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    c.execute_batch(
        "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
    )
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(init_connection);
    let pool = R2D2Pool::new(manager).context("failed to open database pool")?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// A single-connection pool over a private in-memory database. The
/// connection is never recycled: dropping it would drop the database.
pub fn open_memory_pool() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory().with_init(init_connection);
    let pool = R2D2Pool::builder()
        .max_size(1)
        .min_idle(Some(1))
        .max_lifetime(None)
        .idle_timeout(None)
        .build(manager)
        .context("failed to open in-memory database")?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// SQLite-backed rule store, metrics source and findings sink.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(open_memory_pool()?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, SourceError> {
        Ok(self.pool.get()?)
    }
}

impl From<r2d2::Error> for SourceError {
    fn from(e: r2d2::Error) -> Self {
        SourceError::Unavailable(e.to_string())
    }
}

impl From<rusqlite::Error> for DetectError {
    fn from(e: rusqlite::Error) -> Self {
        DetectError::Source(SourceError::Query(e))
    }
}
