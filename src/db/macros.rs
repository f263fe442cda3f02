//! Database dispatch macros for reducing code duplication.
//!
//! The pool and transaction wrappers are enums over the three sqlx backends.
//! These macros expand one match arm per backend so the per-backend code
//! stays in one place.

/// Macro for generating database dispatch match arms over `DbPool`.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => p.size(),
///     Postgres(p) => p.size(),
///     SQLite(p) => p.size(),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

/// Expand `$body` once per backend with `$tx` bound to the open sqlx
/// transaction and `$bind` to the matching parameter binder.
///
/// # Example
///
/// ```ignore
/// with_transaction!(txn, |tx, bind| {
///     let mut query = sqlx::query(sql);
///     for param in params {
///         query = bind(query, param);
///     }
///     query.execute(&mut **tx).await?.rows_affected()
/// })
/// ```
#[macro_export]
macro_rules! with_transaction {
    ($txn:expr, |$tx:ident, $bind:ident| $body:expr) => {
        match $txn {
            $crate::db::scope::DbTransaction::MySql($tx) => {
                let $bind = $crate::db::params::bind_mysql_param;
                $body
            }
            $crate::db::scope::DbTransaction::Postgres($tx) => {
                let $bind = $crate::db::params::bind_postgres_param;
                $body
            }
            $crate::db::scope::DbTransaction::SQLite($tx) => {
                let $bind = $crate::db::params::bind_sqlite_param;
                $body
            }
        }
    };
}

pub use impl_db_dispatch;
pub use with_transaction;
