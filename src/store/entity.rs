//! Generic owner-scoped CRUD store over a [`TableService`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::cache::{QueryCache, QueryState};
use crate::backend::{Filter, Query, TableService};
use crate::error::{Error, Result};

pub const OWNER_COLUMN: &str = "user_id";

/// A row type kept in an owner-scoped table.
pub trait Entity: Clone + Send + Sync + DeserializeOwned + 'static {
    type Draft: Serialize + Send + Sync;
    type Patch: Serialize + Send + Sync;

    const TABLE: &'static str;
    const ORDER_BY: &'static str;
    const ASCENDING: bool;

    fn id(&self) -> &str;
    fn owner(&self) -> &str;
    fn draft_owner(draft: &Self::Draft) -> &str;
}

/// Cached list/create/update/delete for one [`Entity`] type.
pub struct EntityStore<E: Entity> {
    tables: Arc<dyn TableService>,
    cache: Arc<QueryCache<E>>,
}

impl<E: Entity> Clone for EntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            tables: self.tables.clone(),
            cache: self.cache.clone(),
        }
    }
}

fn decode_rows<E: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<E>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(Error::from))
        .collect()
}

impl<E: Entity> EntityStore<E> {
    pub fn new(tables: Arc<dyn TableService>) -> Self {
        Self {
            tables,
            cache: Arc::new(QueryCache::new()),
        }
    }

    /// Observe an owner's collection.
    pub fn watch(&self, owner: &str) -> watch::Receiver<QueryState<E>> {
        self.cache.watch(owner)
    }

    /// Rows owned by `owner`, from cache when fresh. No owner, no rows.
    pub async fn list(&self, owner: Option<&str>) -> Result<Vec<E>> {
        let Some(owner) = owner else {
            return Ok(Vec::new());
        };
        if let Some(rows) = self.cache.fresh(owner) {
            return Ok(rows);
        }
        self.fetch(owner).await
    }

    async fn fetch(&self, owner: &str) -> Result<Vec<E>> {
        let ticket = self.cache.begin_fetch(owner);
        let query = Query::new()
            .eq(OWNER_COLUMN, owner)
            .order(E::ORDER_BY, E::ASCENDING);

        let result = match self.tables.select(E::TABLE, &query).await {
            // Rows of other owners never reach the cache.
            Ok(rows) => decode_rows::<E>(rows).map(|rows| {
                rows.into_iter()
                    .filter(|row| row.owner() == owner)
                    .collect::<Vec<E>>()
            }),
            Err(e) => Err(e),
        };

        match result {
            Ok(rows) => {
                if !self.cache.commit(owner, ticket, Ok(rows.clone())) {
                    debug!(table = E::TABLE, owner, "discarded fetch superseded by invalidation");
                }
                Ok(rows)
            }
            Err(e) => {
                warn!(table = E::TABLE, owner, error = %e, "list failed");
                self.cache.commit(owner, ticket, Err(e.to_string()));
                Err(e)
            }
        }
    }

    pub async fn create(&self, draft: &E::Draft) -> Result<E> {
        let owner = E::draft_owner(draft).to_string();
        let rows = self
            .tables
            .insert(E::TABLE, Value::Array(vec![serde_json::to_value(draft)?]))
            .await
            .map_err(|e| {
                error!(table = E::TABLE, error = %e, "create failed");
                e
            })?;

        self.cache.invalidate(&owner);
        self.refresh_watched(&[owner]).await;

        let created = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::decode(format!("insert into {} returned no row", E::TABLE)))?;
        let created: E = serde_json::from_value(created)?;
        debug!(table = E::TABLE, id = created.id(), "created");
        Ok(created)
    }

    /// Patch one row by id. Returns the rows the service reports as changed.
    pub async fn update(&self, id: &str, patch: &E::Patch) -> Result<Vec<E>> {
        let rows = self
            .tables
            .update(E::TABLE, &[Filter::eq("id", id)], serde_json::to_value(patch)?)
            .await
            .map_err(|e| {
                error!(table = E::TABLE, id, error = %e, "update failed");
                e
            })?;
        self.invalidate_rows(&rows).await;
        decode_rows(rows)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let rows = self
            .tables
            .delete(E::TABLE, &[Filter::eq("id", id)])
            .await
            .map_err(|e| {
                error!(table = E::TABLE, id, error = %e, "delete failed");
                e
            })?;
        self.invalidate_rows(&rows).await;
        Ok(())
    }

    /// Invalidate the owners of `rows`; every owner when none came back.
    async fn invalidate_rows(&self, rows: &[Value]) {
        let owners: BTreeSet<String> = rows
            .iter()
            .filter_map(|row| row.get(OWNER_COLUMN)?.as_str().map(str::to_string))
            .collect();

        if owners.is_empty() {
            self.cache.invalidate_all();
            self.refresh_watched(&self.cache.watched_owners()).await;
        } else {
            let owners: Vec<String> = owners.into_iter().collect();
            for owner in &owners {
                self.cache.invalidate(owner);
            }
            self.refresh_watched(&owners).await;
        }
    }

    /// Refetch the given owners that have watchers; others wait for their
    /// next `list`.
    async fn refresh_watched(&self, owners: &[String]) {
        let watched = self.cache.watched_owners();
        for owner in owners.iter().filter(|o| watched.contains(o)) {
            // Failures are already recorded in the owner's state.
            let _ = self.fetch(owner).await;
        }
    }
}
