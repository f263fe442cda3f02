//! Database layer.
//!
//! This module provides:
//! - Connection pools and the shared pool registry
//! - Unit-of-work scopes over one pooled connection
//! - Entity state tracking inside a scope
//! - SQL generation for the supported backends
//! - Row decoding into JSON records
//! - Database provisioning

pub mod dialect;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod provision;
pub mod scope;
pub mod tracker;
pub mod types;

pub use dialect::{Dialect, Statement, validate_identifier};
pub use pool::{ConnectionPool, DbPool, Lease, PoolRegistry, PoolStats};
pub use provision::ensure_database;
pub use scope::{DbTransaction, Executed, FlushSummary, Scope, run_in_scope};
pub use tracker::{EntityState, Managed};
