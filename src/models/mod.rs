//! Data models shared by the pool, scope and access engine layers.

pub mod connection;
pub mod query;

pub use connection::{DatabaseType, mask_connection_string};
pub use query::{DEFAULT_PAGE_LIMIT, Direction, Filters, OrderBy, Page, QueryParam, Record};
