//! Generic access engine.
//!
//! Every operation opens its own [`Scope`], does its work, detaches whatever
//! it returns and then commits (or rolls back on error). Nothing handed back
//! to the caller is tied to a connection.

use crate::config::DaoConfig;
use crate::dao::background::{BackgroundTask, submit};
use crate::dao::entity::{Entity, TableDescriptor, entity_from_record, fields_to_record};
use crate::db::pool::{ConnectionPool, PoolRegistry, PoolStats};
use crate::db::scope::{Scope, run_in_scope};
use crate::db::tracker::EntityState;
use crate::error::{DbError, DbResult};
use crate::models::{Filters, OrderBy, Page, QueryParam, Record};
use futures_util::future::BoxFuture;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

struct DaoInner {
    name: String,
    pool: ConnectionPool,
    descriptor: TableDescriptor,
    closed: AtomicBool,
}

/// Data access object for one entity type.
///
/// Cloning is cheap; clones share the pool and the closed flag.
pub struct Dao<E: Entity> {
    inner: Arc<DaoInner>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for Dao<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> std::fmt::Debug for Dao<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dao")
            .field("name", &self.inner.name)
            .field("table", &self.inner.descriptor.table)
            .field("primary_key", &self.inner.descriptor.primary_key)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<E: Entity> Dao<E> {
    /// Connect a dedicated pool for this DAO.
    pub async fn connect(config: &DaoConfig) -> DbResult<Self> {
        let pool = ConnectionPool::connect(config).await?;
        Self::from_parts(config, pool)
    }

    /// Connect through the process-wide registry, sharing the pool with every
    /// other DAO configured under the same name.
    pub async fn shared(config: &DaoConfig) -> DbResult<Self> {
        let pool = PoolRegistry::global().get_or_connect(config).await?;
        Self::from_parts(config, pool)
    }

    fn from_parts(config: &DaoConfig, pool: ConnectionPool) -> DbResult<Self> {
        let dao = Self::with_pool(pool)?;
        match &config.primary_key {
            Some(pk) => dao.with_primary_key(pk.as_str()),
            None => Ok(dao),
        }
    }

    /// Build on an existing pool.
    pub fn with_pool(pool: ConnectionPool) -> DbResult<Self> {
        Ok(Self {
            inner: Arc::new(DaoInner {
                name: pool.name().to_string(),
                pool,
                descriptor: TableDescriptor::for_entity::<E>()?,
                closed: AtomicBool::new(false),
            }),
            _entity: PhantomData,
        })
    }

    /// Use another primary-key column than `E::PRIMARY_KEY`.
    pub fn with_primary_key(self, primary_key: impl Into<String>) -> DbResult<Self> {
        let descriptor = self.inner.descriptor.clone().with_primary_key(primary_key)?;
        Ok(Self {
            inner: Arc::new(DaoInner {
                name: self.inner.name.clone(),
                pool: self.inner.pool.clone(),
                descriptor,
                closed: AtomicBool::new(self.is_closed()),
            }),
            _entity: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.inner.descriptor
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub async fn ping(&self) -> DbResult<Duration> {
        self.ensure_open()?;
        self.inner.pool.ping().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.pool.is_closed()
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }
        Ok(())
    }

    async fn open(&self, operation: &'static str) -> DbResult<Scope> {
        self.ensure_open()?;
        debug!(
            dao = %self.inner.name,
            table = %self.inner.descriptor.table,
            operation,
            "Opening scope"
        );
        Scope::open(&self.inner.pool).await
    }

    // =========================================================================
    // Scope-level building blocks
    // =========================================================================

    async fn find_detached(&self, scope: &mut Scope, key: QueryParam) -> DbResult<Option<E>> {
        let d = &self.inner.descriptor;
        match scope.find(&d.table, &d.primary_key, key).await? {
            Some(handle) => entity_from_record(scope.detach(handle)?).map(Some),
            None => Ok(None),
        }
    }

    async fn insert(&self, scope: &mut Scope, fields: Record) -> DbResult<E> {
        let d = &self.inner.descriptor;
        let handle = scope.add(&d.table, &d.primary_key, fields);
        scope.flush().await?;
        entity_from_record(scope.detach(handle)?)
    }

    /// Apply `changes` to the row at `key`. `None` when there is no such row.
    async fn modify(
        &self,
        scope: &mut Scope,
        key: QueryParam,
        changes: Record,
    ) -> DbResult<Option<E>> {
        let d = &self.inner.descriptor;
        let Some(handle) = scope.find(&d.table, &d.primary_key, key).await? else {
            return Ok(None);
        };
        scope.set(handle, changes)?;
        scope.flush().await?;
        // Deleted by someone else between our read and write
        if scope.state(handle) != EntityState::Persistent {
            return Ok(None);
        }
        entity_from_record(scope.detach(handle)?).map(Some)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fetch one entity by primary key.
    pub async fn get(&self, id: E::Id) -> DbResult<Option<E>> {
        let mut scope = self.open("get").await?;
        let result = self.find_detached(&mut scope, id.into()).await;
        scope.finish(result).await
    }

    /// One page of entities in primary-key order.
    pub async fn list(&self, page: Page) -> DbResult<Vec<E>> {
        self.list_by_ordered(&OrderBy::default(), &Filters::new(), page).await
    }

    /// One page of entities matching every equality filter, in primary-key order.
    pub async fn list_by(&self, filters: &Filters, page: Page) -> DbResult<Vec<E>> {
        self.list_by_ordered(&OrderBy::default(), filters, page).await
    }

    /// One page of matching entities in caller-specified order.
    pub async fn list_by_ordered(
        &self,
        order: &OrderBy,
        filters: &Filters,
        page: Page,
    ) -> DbResult<Vec<E>> {
        let mut scope = self.open("list").await?;
        let d = &self.inner.descriptor;
        let result = async {
            let handles = scope
                .find_page(&d.table, &d.primary_key, filters, order, page)
                .await?;
            scope
                .detach_many(&handles)?
                .into_iter()
                .map(entity_from_record)
                .collect::<DbResult<Vec<E>>>()
        }
        .await;
        scope.finish(result).await
    }

    pub async fn exists(&self, id: E::Id) -> DbResult<bool> {
        let mut scope = self.open("exists").await?;
        let d = &self.inner.descriptor;
        let result = scope.exists(&d.table, &d.primary_key, id.into()).await;
        scope.finish(result).await
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert a new entity and return it as stored, including generated
    /// keys and column defaults.
    pub async fn create(&self, fields: E::Fields) -> DbResult<E> {
        let fields = fields_to_record(&fields)?;
        let mut scope = self.open("create").await?;
        let result = self.insert(&mut scope, fields).await;
        scope.finish(result).await
    }

    /// Update the named fields of an existing entity. A missing id is `None`
    /// and writes nothing.
    pub async fn update(&self, id: E::Id, fields: E::Fields) -> DbResult<Option<E>> {
        let changes = fields_to_record(&fields)?;
        let mut scope = self.open("update").await?;
        let result = self.modify(&mut scope, id.into(), changes).await;
        scope.finish(result).await
    }

    /// Update the entity at `id`, or create it with `id` as its key.
    pub async fn upsert(&self, id: E::Id, fields: E::Fields) -> DbResult<E> {
        let key: QueryParam = id.into();
        let mut changes = fields_to_record(&fields)?;
        let pk = self.inner.descriptor.primary_key.as_str();
        if let Some(given) = changes.get(pk) {
            if QueryParam::from_json(given.clone()) != key {
                return Err(DbError::invalid_input(format!(
                    "Fields name '{}' = {} but the upsert key is {:?}",
                    pk, given, key
                )));
            }
        }

        let mut scope = self.open("upsert").await?;
        let result = async {
            if let Some(updated) = self.modify(&mut scope, key.clone(), changes.clone()).await? {
                return Ok(updated);
            }
            changes.insert(pk.to_string(), key.to_json());
            self.insert(&mut scope, changes).await
        }
        .await;
        scope.finish(result).await
    }

    /// Delete the entity at `id`. True only when a row was removed.
    pub async fn delete(&self, id: E::Id) -> DbResult<bool> {
        let mut scope = self.open("delete").await?;
        let d = &self.inner.descriptor;
        let result = async {
            let Some(handle) = scope.find(&d.table, &d.primary_key, id.into()).await? else {
                return Ok(false);
            };
            scope.remove(handle)?;
            Ok(scope.flush().await?.deleted > 0)
        }
        .await;
        scope.finish(result).await
    }

    // =========================================================================
    // Escape hatch and lifecycle
    // =========================================================================

    /// Run caller logic inside a fresh scope and return its result unchanged.
    ///
    /// The scope commits on `Ok` and rolls back on `Err`. Rows the closure
    /// reads stay tracked until it detaches them; entities it wants to return
    /// must be built from detached records.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let names = dao
    ///     .run_custom(|scope| {
    ///         Box::pin(async move {
    ///             let rows = scope.fetch("SELECT name FROM users WHERE score > ?", vec![10.into()]).await?;
    ///             Ok(rows.into_iter().filter_map(|r| r.get("name").cloned()).collect::<Vec<_>>())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn run_custom<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'s> FnOnce(&'s mut Scope) -> BoxFuture<'s, DbResult<T>>,
    {
        self.ensure_open()?;
        debug!(dao = %self.inner.name, operation = "run_custom", "Opening scope");
        run_in_scope(&self.inner.pool, f).await
    }

    /// Close the pool. Later operations fail with `DbError::PoolClosed`.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.pool.close().await;
        info!(dao = %self.inner.name, table = %self.inner.descriptor.table, "DAO closed");
    }

    // =========================================================================
    // Background variants
    // =========================================================================

    /// [`Dao::create`] on the background runtime.
    pub fn create_ff(&self, fields: E::Fields) -> BackgroundTask<E> {
        let dao = self.clone();
        submit(self.name(), "create", async move { dao.create(fields).await })
    }

    /// [`Dao::update`] on the background runtime.
    pub fn update_ff(&self, id: E::Id, fields: E::Fields) -> BackgroundTask<Option<E>> {
        let dao = self.clone();
        submit(self.name(), "update", async move { dao.update(id, fields).await })
    }

    /// [`Dao::upsert`] on the background runtime.
    pub fn upsert_ff(&self, id: E::Id, fields: E::Fields) -> BackgroundTask<E> {
        let dao = self.clone();
        submit(self.name(), "upsert", async move { dao.upsert(id, fields).await })
    }

    /// [`Dao::delete`] on the background runtime.
    pub fn delete_ff(&self, id: E::Id) -> BackgroundTask<bool> {
        let dao = self.clone();
        submit(self.name(), "delete", async move { dao.delete(id).await })
    }
}
