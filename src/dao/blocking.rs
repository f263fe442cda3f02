//! Synchronous facade over [`Dao`].
//!
//! Each call runs the async operation on the background runtime and blocks
//! the calling thread until it finishes. Do not call these from inside an
//! async task; use [`Dao`] directly there.

use crate::config::DaoConfig;
use crate::dao::background::submit;
use crate::dao::engine::Dao;
use crate::dao::entity::Entity;
use crate::db::pool::PoolStats;
use crate::db::scope::Scope;
use crate::error::DbResult;
use crate::models::{Filters, OrderBy, Page};
use futures_util::future::BoxFuture;
use std::future::Future;
use tracing::error;

pub struct BlockingDao<E: Entity> {
    dao: Dao<E>,
}

impl<E: Entity> Clone for BlockingDao<E> {
    fn clone(&self) -> Self {
        Self {
            dao: self.dao.clone(),
        }
    }
}

impl<E: Entity> std::fmt::Debug for BlockingDao<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BlockingDao").field(&self.dao).finish()
    }
}

impl<E: Entity> Dao<E> {
    /// Synchronous view of this DAO sharing the same pool.
    pub fn blocking(&self) -> BlockingDao<E> {
        BlockingDao { dao: self.clone() }
    }
}

impl<E: Entity> BlockingDao<E> {
    /// Connect a dedicated pool. The pool lives on the background runtime.
    pub fn connect(config: &DaoConfig) -> DbResult<Self> {
        let name = config.name.clone();
        let config = config.clone();
        submit(&name, "connect", async move { Dao::<E>::connect(&config).await })
            .wait()
            .map(|dao| Self { dao })
    }

    fn run<T, Fut>(&self, operation: &'static str, fut: Fut) -> DbResult<T>
    where
        T: Clone + Send + Sync + 'static,
        Fut: Future<Output = DbResult<T>> + Send + 'static,
    {
        submit(self.dao.name(), operation, fut).wait()
    }

    /// The async DAO underneath.
    pub fn as_async(&self) -> &Dao<E> {
        &self.dao
    }

    pub fn stats(&self) -> PoolStats {
        self.dao.stats()
    }

    pub fn get(&self, id: E::Id) -> DbResult<Option<E>> {
        let dao = self.dao.clone();
        self.run("get", async move { dao.get(id).await })
    }

    pub fn list(&self, page: Page) -> DbResult<Vec<E>> {
        let dao = self.dao.clone();
        self.run("list", async move { dao.list(page).await })
    }

    pub fn list_by(&self, filters: Filters, page: Page) -> DbResult<Vec<E>> {
        let dao = self.dao.clone();
        self.run("list_by", async move { dao.list_by(&filters, page).await })
    }

    pub fn list_by_ordered(
        &self,
        order: OrderBy,
        filters: Filters,
        page: Page,
    ) -> DbResult<Vec<E>> {
        let dao = self.dao.clone();
        self.run("list_by_ordered", async move {
            dao.list_by_ordered(&order, &filters, page).await
        })
    }

    pub fn exists(&self, id: E::Id) -> DbResult<bool> {
        let dao = self.dao.clone();
        self.run("exists", async move { dao.exists(id).await })
    }

    pub fn create(&self, fields: E::Fields) -> DbResult<E> {
        self.dao.create_ff(fields).wait()
    }

    pub fn update(&self, id: E::Id, fields: E::Fields) -> DbResult<Option<E>> {
        self.dao.update_ff(id, fields).wait()
    }

    pub fn upsert(&self, id: E::Id, fields: E::Fields) -> DbResult<E> {
        self.dao.upsert_ff(id, fields).wait()
    }

    pub fn delete(&self, id: E::Id) -> DbResult<bool> {
        self.dao.delete_ff(id).wait()
    }

    pub fn run_custom<T, F>(&self, f: F) -> DbResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: for<'s> FnOnce(&'s mut Scope) -> BoxFuture<'s, DbResult<T>> + Send + 'static,
    {
        let dao = self.dao.clone();
        self.run("run_custom", async move { dao.run_custom(f).await })
    }

    /// Close the pool. Errors only if the close could not be run at all.
    pub fn close(&self) -> DbResult<()> {
        let dao = self.dao.clone();
        self.run("close", async move {
            dao.close().await;
            Ok(())
        })
        .inspect_err(|e| error!(dao = %self.dao.name(), error = %e, "Failed to close DAO"))
    }
}
