//! Unit-of-work scope.
//!
//! A [`Scope`] owns one pooled connection with an open transaction for its
//! whole lifetime. Rows read through it are tracked by a [`Tracker`]; writes
//! are queued and sent to storage on [`Scope::flush`]. The scope ends with
//! [`Scope::commit`] or [`Scope::rollback`], both of which detach everything
//! still tracked. A scope dropped without either is rolled back by the driver
//! and its connection returned to the pool.

use crate::db::dialect::{Dialect, Statement};
use crate::db::pool::{ConnectionPool, Lease};
use crate::db::tracker::{EntityState, FlushItem, Managed, PendingOp, Tracker, record_key};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Filters, OrderBy, Page, QueryParam, Record};
use crate::with_transaction;
use futures_util::future::BoxFuture;
use sqlx::mysql::MySqlQueryResult;
use sqlx::postgres::PgQueryResult;
use sqlx::sqlite::SqliteQueryResult;
use sqlx::{MySql, Postgres, Sqlite, Transaction};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

// =============================================================================
// Transaction wrapper
// =============================================================================

/// Database-specific transaction wrapper.
pub enum DbTransaction {
    /// MySQL transaction
    MySql(Transaction<'static, MySql>),
    /// PostgreSQL transaction
    Postgres(Transaction<'static, Postgres>),
    /// SQLite transaction
    SQLite(Transaction<'static, Sqlite>),
}

impl DbTransaction {
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbTransaction::MySql(_) => DatabaseType::MySQL,
            DbTransaction::Postgres(_) => DatabaseType::PostgreSQL,
            DbTransaction::SQLite(_) => DatabaseType::SQLite,
        }
    }

    pub async fn commit(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::SQLite(tx) => tx.commit().await.map_err(DbError::from),
        }
    }

    pub async fn rollback(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::SQLite(tx) => tx.rollback().await.map_err(DbError::from),
        }
    }
}

/// Outcome of a statement that returns no rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Executed {
    pub rows_affected: u64,
    /// Key generated by the last insert, where the backend reports one.
    pub last_insert_id: Option<i64>,
}

trait IntoExecuted {
    fn into_executed(self) -> Executed;
}

impl IntoExecuted for MySqlQueryResult {
    fn into_executed(self) -> Executed {
        Executed {
            rows_affected: self.rows_affected(),
            last_insert_id: Some(self.last_insert_id() as i64).filter(|id| *id != 0),
        }
    }
}

impl IntoExecuted for PgQueryResult {
    fn into_executed(self) -> Executed {
        Executed {
            rows_affected: self.rows_affected(),
            last_insert_id: None,
        }
    }
}

impl IntoExecuted for SqliteQueryResult {
    fn into_executed(self) -> Executed {
        Executed {
            rows_affected: self.rows_affected(),
            last_insert_id: Some(self.last_insert_rowid()).filter(|id| *id != 0),
        }
    }
}

/// What one flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub inserted: usize,
    pub updated: usize,
    /// Rows actually removed by queued deletes.
    pub deleted: u64,
}

// =============================================================================
// Scope
// =============================================================================

pub struct Scope {
    tx: Option<DbTransaction>,
    dialect: Dialect,
    query_timeout: Duration,
    tracker: Tracker,
    pool: String,
    _lease: Lease,
}

impl Scope {
    /// Acquire a connection from `pool` and begin a transaction on it.
    pub async fn open(pool: &ConnectionPool) -> DbResult<Self> {
        let (tx, lease) = pool.begin().await?;
        debug!(pool = %pool.name(), "Scope opened");
        Ok(Self {
            dialect: Dialect::new(tx.db_type()),
            tx: Some(tx),
            query_timeout: pool.query_timeout(),
            tracker: Tracker::new(),
            pool: pool.name().to_string(),
            _lease: lease,
        })
    }

    pub fn db_type(&self) -> DatabaseType {
        self.dialect.db_type()
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    fn transaction(&mut self) -> DbResult<&mut DbTransaction> {
        self.tx
            .as_mut()
            .ok_or_else(|| DbError::internal("Scope has already been closed"))
    }

    // -------------------------------------------------------------------------
    // Statement execution
    // -------------------------------------------------------------------------

    async fn fetch_statement(&mut self, stmt: &Statement) -> DbResult<Vec<Record>> {
        let limit = self.query_timeout;
        let txn = self.transaction()?;
        debug!(sql = %stmt.sql, params = stmt.params.len(), "Fetching rows");

        let fut = async {
            let rows = with_transaction!(txn, |tx, bind| {
                let mut query = sqlx::query(&stmt.sql);
                for param in &stmt.params {
                    query = bind(query, param);
                }
                query
                    .fetch_all(&mut **tx)
                    .await?
                    .iter()
                    .map(|row| row.to_record())
                    .collect::<Vec<_>>()
            });
            Ok::<_, sqlx::Error>(rows)
        };

        match timeout(limit, fut).await {
            Ok(result) => result.map_err(DbError::from),
            Err(_) => Err(DbError::timeout("query execution", limit.as_secs() as u32)),
        }
    }

    async fn execute_statement(&mut self, stmt: &Statement) -> DbResult<Executed> {
        let limit = self.query_timeout;
        let txn = self.transaction()?;
        debug!(sql = %stmt.sql, params = stmt.params.len(), "Executing statement");

        let fut = async {
            let executed = with_transaction!(txn, |tx, bind| {
                let mut query = sqlx::query(&stmt.sql);
                for param in &stmt.params {
                    query = bind(query, param);
                }
                query.execute(&mut **tx).await?.into_executed()
            });
            Ok::<_, sqlx::Error>(executed)
        };

        match timeout(limit, fut).await {
            Ok(result) => result.map_err(DbError::from),
            Err(_) => Err(DbError::timeout("write operation", limit.as_secs() as u32)),
        }
    }

    /// Run arbitrary SQL in this scope and return the rows as records.
    ///
    /// Records returned here are plain values; they are not tracked.
    pub async fn fetch(&mut self, sql: &str, params: Vec<QueryParam>) -> DbResult<Vec<Record>> {
        self.autoflush().await?;
        let stmt = Statement {
            sql: sql.to_string(),
            params,
        };
        self.fetch_statement(&stmt).await
    }

    /// Run an arbitrary statement in this scope.
    pub async fn execute(&mut self, sql: &str, params: Vec<QueryParam>) -> DbResult<Executed> {
        self.autoflush().await?;
        let stmt = Statement {
            sql: sql.to_string(),
            params,
        };
        self.execute_statement(&stmt).await
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    async fn autoflush(&mut self) -> DbResult<()> {
        if self.tracker.has_pending() {
            self.flush().await?;
        }
        Ok(())
    }

    fn tracked(&self, table: &str, key: &QueryParam) -> Option<Option<Managed>> {
        let handle = self.tracker.lookup(table, key)?;
        Some((!self.tracker.is_deleted(handle)).then_some(handle))
    }

    /// Load one row by primary key and track it.
    ///
    /// A row this scope already tracks is returned without a round trip; a
    /// row queued for deletion reads as absent. Pending inserts are flushed
    /// before going to storage, so rows added in this scope are found.
    pub async fn find(
        &mut self,
        table: &str,
        pk: &str,
        key: QueryParam,
    ) -> DbResult<Option<Managed>> {
        if key.is_null() {
            return Ok(None);
        }
        if let Some(found) = self.tracked(table, &key) {
            return Ok(found);
        }
        self.autoflush().await?;
        if let Some(found) = self.tracked(table, &key) {
            return Ok(found);
        }

        let stmt = self.dialect.select_by_key(table, pk, key)?;
        let mut rows = self.fetch_statement(&stmt).await?;
        match rows.pop() {
            Some(record) => self.tracker.attach(table, pk, record).map(Some),
            None => Ok(None),
        }
    }

    /// Load one filtered, ordered page and track every row.
    pub async fn find_page(
        &mut self,
        table: &str,
        pk: &str,
        filters: &Filters,
        order: &OrderBy,
        page: Page,
    ) -> DbResult<Vec<Managed>> {
        self.autoflush().await?;
        let stmt = self.dialect.select_page(table, pk, filters, order, page)?;
        let rows = self.fetch_statement(&stmt).await?;
        debug!(table = %table, rows = rows.len(), "Loaded page");
        rows.into_iter()
            .map(|record| self.tracker.attach(table, pk, record))
            .collect()
    }

    pub async fn exists(&mut self, table: &str, pk: &str, key: QueryParam) -> DbResult<bool> {
        if key.is_null() {
            return Ok(false);
        }
        self.autoflush().await?;
        let stmt = self.dialect.exists(table, pk, key)?;
        Ok(!self.fetch_statement(&stmt).await?.is_empty())
    }

    // -------------------------------------------------------------------------
    // Staged writes
    // -------------------------------------------------------------------------

    /// Register a new row; it is inserted on the next flush.
    pub fn add(&mut self, table: &str, pk: &str, fields: Record) -> Managed {
        self.tracker.add(table, pk, fields)
    }

    /// Stage field changes on a tracked row.
    pub fn set(&mut self, handle: Managed, fields: Record) -> DbResult<()> {
        self.tracker.set(handle, fields)
    }

    /// Stage removal of a tracked row.
    pub fn remove(&mut self, handle: Managed) -> DbResult<()> {
        self.tracker.remove(handle)
    }

    /// Current values of a tracked row.
    pub fn values(&self, handle: Managed) -> DbResult<&Record> {
        self.tracker.values(handle)
    }

    pub fn state(&self, handle: Managed) -> EntityState {
        self.tracker.state(handle)
    }

    /// Send every staged write to storage, in the order they were staged.
    ///
    /// Inserted and updated rows are reloaded so storage-computed values
    /// (generated keys, defaults, triggers) show up in their snapshots. On
    /// error the unsent writes stay queued.
    pub async fn flush(&mut self) -> DbResult<FlushSummary> {
        let mut summary = FlushSummary::default();
        let mut items = self.tracker.drain_pending().into_iter();

        while let Some(item) = items.next() {
            if let Err(e) = self.flush_one(&item, &mut summary).await {
                self.tracker
                    .requeue(std::iter::once(item).chain(items).collect());
                return Err(e);
            }
        }

        if summary != FlushSummary::default() {
            debug!(
                pool = %self.pool,
                inserted = summary.inserted,
                updated = summary.updated,
                deleted = summary.deleted,
                "Scope flushed"
            );
        }
        Ok(summary)
    }

    async fn flush_one(&mut self, item: &FlushItem, summary: &mut FlushSummary) -> DbResult<()> {
        match &item.op {
            PendingOp::Insert(fields) => {
                let columns: Vec<(String, QueryParam)> = fields
                    .iter()
                    // A null key is left to the storage default
                    .filter(|(column, value)| !(column.as_str() == item.pk && value.is_null()))
                    .map(|(column, value)| (column.clone(), QueryParam::from_json(value.clone())))
                    .collect();

                let key = if self.dialect.supports_returning() {
                    let stmt = self.dialect.insert(&item.table, &columns, Some(&item.pk))?;
                    let rows = self.fetch_statement(&stmt).await?;
                    rows.first()
                        .and_then(|row| record_key(row, &item.pk))
                        .or_else(|| item.key.clone())
                } else {
                    let stmt = self.dialect.insert(&item.table, &columns, None)?;
                    let executed = self.execute_statement(&stmt).await?;
                    item.key
                        .clone()
                        .or_else(|| executed.last_insert_id.map(QueryParam::Int))
                };

                let key = key.ok_or_else(|| {
                    DbError::internal(format!(
                        "Insert into '{}' did not report a value for '{}'",
                        item.table, item.pk
                    ))
                })?;
                self.tracker.mark_inserted(item.handle, key)?;
                self.reload(item.handle).await?;
                summary.inserted += 1;
            }
            PendingOp::Update(changes) => {
                if changes.is_empty() {
                    return Ok(());
                }
                let key = self.require_key(item)?;
                let columns: Vec<(String, QueryParam)> = changes
                    .iter()
                    .map(|(column, value)| (column.clone(), QueryParam::from_json(value.clone())))
                    .collect();
                let stmt = self.dialect.update(&item.table, &item.pk, key, &columns)?;
                self.execute_statement(&stmt).await?;
                if self.reload(item.handle).await? {
                    summary.updated += 1;
                }
            }
            PendingOp::Delete => {
                let key = self.require_key(item)?;
                let stmt = self.dialect.delete(&item.table, &item.pk, key)?;
                let executed = self.execute_statement(&stmt).await?;
                self.tracker.mark_gone(item.handle)?;
                summary.deleted += executed.rows_affected;
            }
        }
        Ok(())
    }

    fn require_key(&self, item: &FlushItem) -> DbResult<QueryParam> {
        item.key.clone().ok_or_else(|| {
            DbError::internal(format!("Tracked row in '{}' has no primary key", item.table))
        })
    }

    /// Re-read a tracked row. Returns false when the row no longer exists,
    /// in which case it is detached.
    async fn reload(&mut self, handle: Managed) -> DbResult<bool> {
        let (table, pk) = {
            let (table, pk) = self.tracker.table(handle)?;
            (table.to_string(), pk.to_string())
        };
        let Some(key) = self.tracker.key(handle)? else {
            return Ok(false);
        };

        let stmt = self.dialect.select_by_key(&table, &pk, key)?;
        match self.fetch_statement(&stmt).await?.pop() {
            Some(record) => {
                self.tracker.refresh(handle, record)?;
                Ok(true)
            }
            None => {
                warn!(table = %table, "Row vanished while tracked, detaching");
                self.tracker.mark_gone(handle)?;
                Ok(false)
            }
        }
    }

    /// Flush, then re-read a tracked row from storage.
    pub async fn refresh(&mut self, handle: Managed) -> DbResult<bool> {
        if self.tracker.state(handle) != EntityState::Persistent {
            return Err(DbError::detached(self.tracker.table(handle)?.0.to_string()));
        }
        self.autoflush().await?;
        self.reload(handle).await
    }

    // -------------------------------------------------------------------------
    // Detachment and lifecycle
    // -------------------------------------------------------------------------

    /// Stop tracking a row and return an owned copy of its values.
    pub fn detach(&mut self, handle: Managed) -> DbResult<Record> {
        self.tracker.detach(handle)
    }

    pub fn detach_many(&mut self, handles: &[Managed]) -> DbResult<Vec<Record>> {
        handles.iter().map(|h| self.tracker.detach(*h)).collect()
    }

    pub fn detach_all(&mut self) -> usize {
        self.tracker.detach_all()
    }

    /// Flush staged writes and commit. Everything still tracked is detached.
    pub async fn commit(mut self) -> DbResult<()> {
        if let Err(e) = self.flush().await {
            self.abort().await;
            return Err(e);
        }
        let tx = self
            .tx
            .take()
            .ok_or_else(|| DbError::internal("Scope has already been closed"))?;
        let detached = self.tracker.detach_all();
        tx.commit().await?;
        debug!(pool = %self.pool, detached, "Scope committed");
        Ok(())
    }

    /// Discard staged and sent writes.
    pub async fn rollback(mut self) -> DbResult<()> {
        self.tracker.detach_all();
        match self.tx.take() {
            Some(tx) => {
                tx.rollback().await?;
                debug!(pool = %self.pool, "Scope rolled back");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn abort(&mut self) {
        self.tracker.detach_all();
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                warn!(pool = %self.pool, error = %e, "Rollback failed");
            }
        }
    }

    /// Commit when `result` is `Ok`, roll back otherwise. The original error
    /// is returned even when the rollback also fails.
    pub async fn finish<T>(mut self, result: DbResult<T>) -> DbResult<T> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                debug!(pool = %self.pool, error = %e, "Operation failed, rolling back");
                self.abort().await;
                Err(e)
            }
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!(pool = %self.pool, "Scope dropped while open, transaction rolled back");
        }
    }
}

/// Run `f` inside a fresh scope: commit on `Ok`, roll back on `Err`.
///
/// # Example
///
/// ```ignore
/// let total = run_in_scope(&pool, |scope| {
///     Box::pin(async move {
///         let rows = scope.fetch("SELECT COUNT(*) AS n FROM users", vec![]).await?;
///         Ok(rows.len())
///     })
/// })
/// .await?;
/// ```
pub async fn run_in_scope<T, F>(pool: &ConnectionPool, f: F) -> DbResult<T>
where
    F: for<'s> FnOnce(&'s mut Scope) -> BoxFuture<'s, DbResult<T>>,
{
    let mut scope = Scope::open(pool).await?;
    let result = f(&mut scope).await;
    scope.finish(result).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaoConfig;
    use serde_json::json;
    use tempfile::NamedTempFile;

    async fn setup() -> (NamedTempFile, ConnectionPool) {
        let file = NamedTempFile::new().unwrap();
        let config = DaoConfig::parse(&format!("sqlite:{}", file.path().display())).unwrap();
        let pool = ConnectionPool::connect(&config).await.unwrap();
        run_in_scope(&pool, |scope| {
            Box::pin(async move {
                scope
                    .execute(
                        "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, \
                         qty INTEGER NOT NULL DEFAULT 1)",
                        vec![],
                    )
                    .await?;
                Ok(())
            })
        })
        .await
        .unwrap();
        (file, pool)
    }

    fn record(v: serde_json::Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_reloads_defaults() {
        let (_file, pool) = setup().await;
        let mut scope = Scope::open(&pool).await.unwrap();
        let h = scope.add("items", "id", record(json!({"name": "bolt"})));
        assert_eq!(scope.state(h), EntityState::Pending);

        let summary = scope.flush().await.unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(scope.state(h), EntityState::Persistent);
        let values = scope.values(h).unwrap();
        assert_eq!(values["qty"], json!(1));
        assert!(values["id"].as_i64().is_some());

        let snapshot = scope.detach(h).unwrap();
        assert_eq!(scope.state(h), EntityState::Detached);
        scope.commit().await.unwrap();
        assert_eq!(snapshot["name"], json!("bolt"));
    }

    #[tokio::test]
    async fn test_find_uses_identity_map() {
        let (_file, pool) = setup().await;
        let mut scope = Scope::open(&pool).await.unwrap();
        scope.add("items", "id", record(json!({"id": 5, "name": "nut"})));
        scope.flush().await.unwrap();

        let a = scope.find("items", "id", QueryParam::Int(5)).await.unwrap();
        let b = scope.find("items", "id", QueryParam::Int(5)).await.unwrap();
        assert!(a.is_some());
        assert_eq!(a, b);
        assert!(scope.find("items", "id", QueryParam::Int(6)).await.unwrap().is_none());
        scope.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_find_sees_rows_added_in_scope() {
        let (_file, pool) = setup().await;
        let mut scope = Scope::open(&pool).await.unwrap();
        let added = scope.add("items", "id", record(json!({"id": 7, "name": "washer"})));

        let found = scope.find("items", "id", QueryParam::Int(7)).await.unwrap();
        assert_eq!(found, Some(added));
        assert_eq!(scope.state(added), EntityState::Persistent);
        assert!(scope.exists("items", "id", QueryParam::Int(7)).await.unwrap());
        scope.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_writes_only_changed_fields() {
        let (_file, pool) = setup().await;
        let mut scope = Scope::open(&pool).await.unwrap();
        scope.add("items", "id", record(json!({"id": 1, "name": "a", "qty": 3})));
        scope.flush().await.unwrap();

        let h = scope.find("items", "id", QueryParam::Int(1)).await.unwrap().unwrap();
        scope.set(h, record(json!({"name": "b"}))).unwrap();
        let summary = scope.flush().await.unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(scope.values(h).unwrap()["qty"], json!(3));
        assert_eq!(scope.values(h).unwrap()["name"], json!("b"));
        scope.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_delete_reads_as_absent() {
        let (_file, pool) = setup().await;
        let mut scope = Scope::open(&pool).await.unwrap();
        scope.add("items", "id", record(json!({"id": 1, "name": "a"})));
        scope.flush().await.unwrap();

        let h = scope.find("items", "id", QueryParam::Int(1)).await.unwrap().unwrap();
        scope.remove(h).unwrap();
        assert!(scope.find("items", "id", QueryParam::Int(1)).await.unwrap().is_none());
        assert!(!scope.exists("items", "id", QueryParam::Int(1)).await.unwrap());
        scope.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_work_queued() {
        let (_file, pool) = setup().await;
        let mut scope = Scope::open(&pool).await.unwrap();
        // name is NOT NULL
        let h = scope.add("items", "id", record(json!({"qty": 2})));
        assert!(matches!(scope.flush().await, Err(DbError::Database { .. })));
        assert_eq!(scope.state(h), EntityState::Pending);
        scope.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_in_scope_rolls_back_on_error() {
        let (_file, pool) = setup().await;
        let result: DbResult<()> = run_in_scope(&pool, |scope| {
            Box::pin(async move {
                scope
                    .execute(
                        "INSERT INTO items (id, name) VALUES (?, ?)",
                        vec![QueryParam::Int(1), QueryParam::from("lost")],
                    )
                    .await?;
                Err(DbError::invalid_input("abort"))
            })
        })
        .await;
        assert!(matches!(result, Err(DbError::InvalidInput { .. })));

        let rows = run_in_scope(&pool, |scope| {
            Box::pin(async move { scope.fetch("SELECT * FROM items", vec![]).await })
        })
        .await
        .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_scope_releases_connection() {
        let (_file, pool) = setup().await;
        {
            let mut scope = Scope::open(&pool).await.unwrap();
            scope
                .execute(
                    "INSERT INTO items (id, name) VALUES (?, ?)",
                    vec![QueryParam::Int(9), QueryParam::from("dropped")],
                )
                .await
                .unwrap();
        }
        // max_connections is 1 for SQLite, so this only succeeds if the
        // dropped scope gave its connection back
        let exists = run_in_scope(&pool, |scope| {
            Box::pin(async move { scope.exists("items", "id", QueryParam::Int(9)).await })
        })
        .await
        .unwrap();
        assert!(!exists);
    }
}
