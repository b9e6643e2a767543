//! Connection pool creation and configuration.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use thiserror::Error;

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Errors that can occur when creating the database pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to build the connection pool.
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Creates a new SQLite connection pool with WAL mode and foreign keys enabled.
///
/// `db_path` may be `:memory:`, in which case a private shared-cache
/// in-memory database is created for this pool only. The pool keeps at
/// least one idle connection so the database outlives individual checkouts.
///
/// # Errors
///
/// Returns `PoolError::PoolInit` if the connection pool cannot be created.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let in_memory = db_path == ":memory:";
    let target = if in_memory {
        flags |= OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_SHARED_CACHE;
        format!(
            "file:parlance-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        )
    } else {
        db_path.to_string()
    };

    let manager = SqliteConnectionManager::file(target)
        .with_flags(flags)
        .with_init(move |conn| {
            // In-memory databases report "memory", which is acceptable.
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            if journal_mode != "wal" && journal_mode != "memory" {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to set WAL journal mode, got: {}",
                        journal_mode
                    )),
                ));
            }
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {};",
                settings.busy_timeout_ms
            ))
        });

    let builder = Pool::builder().max_size(settings.pool_max_size.max(1));
    let builder = if in_memory {
        builder.min_idle(Some(1)).idle_timeout(None).max_lifetime(None)
    } else {
        builder
    };

    let pool = builder.build(manager)?;
    tracing::debug!(path = db_path, max_size = pool.max_size(), "database pool ready");

    Ok(pool)
}
