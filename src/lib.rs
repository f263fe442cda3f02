//! Pooled data access layer
//!
//! Generic, typed data access objects over pooled SQLite, PostgreSQL and
//! MySQL connections. Every operation runs in its own unit-of-work scope and
//! hands back detached values; writes can also be pushed to a shared
//! background runtime.

pub mod config;
pub mod dao;
pub mod db;
pub mod error;
pub mod models;
pub mod telemetry;

pub use config::{AcquirePolicy, DaoConfig, PoolOptions};
pub use dao::{BackgroundTask, BlockingDao, Dao, Entity, TableDescriptor};
pub use db::{ConnectionPool, EntityState, PoolRegistry, Scope};
pub use error::{DbError, DbResult};
pub use models::{Direction, Filters, OrderBy, Page, QueryParam, Record};
