//! Database layer for Parlance.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations. Agent configuration, the conversation event
//! log and call usage all live in tables created here.
//!
//! `:memory:` pools are backed by a uniquely named shared-cache database so
//! that every pooled connection sees the same schema and rows.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
