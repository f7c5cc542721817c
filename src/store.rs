use tracing::{debug, info};

use crate::db::{Database, StoreTx, TxMode};
use crate::error::FOREIGN_KEY_VIOLATION;
use crate::migrate::LATEST_VERSION;
use crate::model::{Entity, OnDelete};
use crate::stats::{self, StatsSnapshot};
use crate::table::{IndexValue, Table};
use crate::{AppError, AppResult};

mod inventory;
mod maintenance;

/// Typed read/write path over the local database.
///
/// Every write validates the entity, checks the rows it references, applies
/// the delete policy of its dependents and refreshes the stats snapshot when
/// the entity feeds it, all inside one transaction. The `*_in` variants run
/// against a caller-owned transaction so several writes (or an outbox entry)
/// can commit together.
#[derive(Clone)]
pub struct EntityStore {
    db: Database,
}

/// Tables a write of `E` may touch, plus `extra`.
pub fn write_scope<E: Entity>(extra: &[Table]) -> Vec<Table> {
    let mut tables = vec![E::TABLE];
    tables.extend(E::DEPENDENTS.iter().map(|dep| dep.table));
    if E::AFFECTS_STATS {
        tables.extend_from_slice(stats::TABLES);
    }
    tables.extend_from_slice(extra);
    tables.sort();
    tables.dedup();
    tables
}

fn scope_for<E: Entity>(entity: &E) -> Vec<Table> {
    let parents: Vec<Table> = entity.references().iter().map(|r| r.table).collect();
    write_scope::<E>(&parents)
}

fn ensure_id<E: Entity>(entity: &E) -> AppResult<()> {
    if entity.id().trim().is_empty() {
        return Err(AppError::validation("Record id cannot be empty.")
            .with_context("table", E::TABLE.name()));
    }
    Ok(())
}

async fn check_references<E: Entity>(tx: &mut StoreTx, entity: &E) -> AppResult<()> {
    for reference in entity.references() {
        if !tx.exists(reference.table, &reference.id).await? {
            return Err(AppError::new(
                FOREIGN_KEY_VIOLATION,
                "Referenced record does not exist.",
            )
            .with_context("table", E::TABLE.name())
            .with_context("field", reference.field)
            .with_context("references", reference.table.name())
            .with_context("id", reference.id));
        }
    }
    Ok(())
}

impl EntityStore {
    /// Wraps a database opened at the latest schema version.
    pub fn new(db: Database) -> AppResult<Self> {
        if db.version() < LATEST_VERSION {
            return Err(AppError::storage_unavailable(
                "Entity store needs the latest schema version.",
            )
            .with_context("version", db.version().to_string())
            .with_context("required", LATEST_VERSION.to_string()));
        }
        Ok(Self { db })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub async fn begin(&self, tables: &[Table]) -> AppResult<StoreTx> {
        self.db.begin(tables, TxMode::ReadWrite).await
    }

    /// Inserts a new entity; an existing row with the same id is a
    /// `DuplicateId` error, never overwritten.
    pub async fn create_in<E: Entity>(tx: &mut StoreTx, entity: &E) -> AppResult<()> {
        ensure_id(entity)?;
        entity.validate()?;
        check_references(tx, entity).await?;
        tx.insert(entity).await?;
        if E::AFFECTS_STATS {
            stats::refresh(tx).await?;
        }
        debug!(target: "handreceipt", event = "entity_create", table = %E::TABLE, id = %entity.id());
        Ok(())
    }

    /// Replaces an existing entity.
    pub async fn update_in<E: Entity>(tx: &mut StoreTx, entity: &E) -> AppResult<()> {
        ensure_id(entity)?;
        entity.validate()?;
        let previous = tx
            .get::<E>(entity.id())
            .await?
            .ok_or_else(|| AppError::not_found(E::TABLE.name(), entity.id()))?;
        entity.check_update(&previous)?;
        check_references(tx, entity).await?;
        tx.put(entity).await?;
        if E::AFFECTS_STATS {
            stats::refresh(tx).await?;
        }
        debug!(target: "handreceipt", event = "entity_update", table = %E::TABLE, id = %entity.id());
        Ok(())
    }

    /// Upsert with the same checks as create/update.
    pub async fn put_in<E: Entity>(tx: &mut StoreTx, entity: &E) -> AppResult<()> {
        ensure_id(entity)?;
        entity.validate()?;
        if let Some(previous) = tx.get::<E>(entity.id()).await? {
            entity.check_update(&previous)?;
        }
        check_references(tx, entity).await?;
        tx.put(entity).await?;
        if E::AFFECTS_STATS {
            stats::refresh(tx).await?;
        }
        Ok(())
    }

    /// Deletes `id`, cascading to owned children. Restricted dependents make
    /// the delete fail with `ForeignKeyViolation` before anything is removed.
    pub async fn delete_in<E: Entity>(tx: &mut StoreTx, id: &str) -> AppResult<()> {
        if !tx.exists(E::TABLE, id).await? {
            return Err(AppError::not_found(E::TABLE.name(), id));
        }

        for dep in E::DEPENDENTS.iter().filter(|d| d.on_delete == OnDelete::Restrict) {
            let refs = tx.count_by_index(dep.table, dep.index, id).await?;
            if refs > 0 {
                return Err(AppError::new(
                    FOREIGN_KEY_VIOLATION,
                    "Record is still referenced and cannot be deleted.",
                )
                .with_context("table", E::TABLE.name())
                .with_context("id", id)
                .with_context("referenced_by", dep.table.name())
                .with_context("count", refs.to_string()));
            }
        }

        for dep in E::DEPENDENTS.iter().filter(|d| d.on_delete == OnDelete::Cascade) {
            let removed = tx.delete_by_index(dep.table, dep.index, id).await?;
            if removed > 0 {
                info!(
                    target: "handreceipt",
                    event = "entity_cascade_delete",
                    table = %dep.table,
                    parent_table = %E::TABLE,
                    parent_id = %id,
                    removed
                );
            }
        }

        tx.delete(E::TABLE, id).await?;
        if E::AFFECTS_STATS {
            stats::refresh(tx).await?;
        }
        debug!(target: "handreceipt", event = "entity_delete", table = %E::TABLE, id = %id);
        Ok(())
    }

    pub async fn create<E: Entity>(&self, entity: &E) -> AppResult<()> {
        let mut tx = self.begin(&scope_for(entity)).await?;
        let result = Self::create_in(&mut tx, entity).await;
        tx.finish(result).await
    }

    pub async fn update<E: Entity>(&self, entity: &E) -> AppResult<()> {
        let mut tx = self.begin(&scope_for(entity)).await?;
        let result = Self::update_in(&mut tx, entity).await;
        tx.finish(result).await
    }

    pub async fn put<E: Entity>(&self, entity: &E) -> AppResult<()> {
        let mut tx = self.begin(&scope_for(entity)).await?;
        let result = Self::put_in(&mut tx, entity).await;
        tx.finish(result).await
    }

    pub async fn delete<E: Entity>(&self, id: &str) -> AppResult<()> {
        let mut tx = self.begin(&write_scope::<E>(&[])).await?;
        let result = Self::delete_in::<E>(&mut tx, id).await;
        tx.finish(result).await
    }

    /// Fails with `NotFound` when the row is missing; see [`Self::find`].
    pub async fn get<E: Entity>(&self, id: &str) -> AppResult<E> {
        self.find(id)
            .await?
            .ok_or_else(|| AppError::not_found(E::TABLE.name(), id))
    }

    pub async fn find<E: Entity>(&self, id: &str) -> AppResult<Option<E>> {
        self.db.get::<E>(id).await
    }

    pub async fn get_all<E: Entity>(&self) -> AppResult<Vec<E>> {
        self.db.get_all::<E>().await
    }

    pub async fn get_all_by_index<E: Entity>(
        &self,
        index: &str,
        value: impl Into<IndexValue>,
    ) -> AppResult<Vec<E>> {
        self.db.get_all_by_index::<E>(index, value).await
    }

    pub async fn count<E: Entity>(&self) -> AppResult<i64> {
        self.db.count(E::TABLE).await
    }

    /// The stored snapshot, computed and stored first if it was never written.
    pub async fn stats_snapshot(&self) -> AppResult<StatsSnapshot> {
        if let Some(snapshot) = self.db.get::<StatsSnapshot>(stats::SNAPSHOT_ID).await? {
            return Ok(snapshot);
        }
        let mut tx = self.begin(stats::TABLES).await?;
        let result = stats::refresh(&mut tx).await;
        tx.finish(result).await
    }

    /// Full recount over the current rows, independent of the stored snapshot.
    pub async fn recount_stats(&self) -> AppResult<StatsSnapshot> {
        let mut tx = self.db.begin(stats::TABLES, TxMode::ReadOnly).await?;
        let result = stats::recount(&mut tx).await;
        tx.finish(result).await
    }
}
