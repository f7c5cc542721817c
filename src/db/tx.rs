use serde_json::Value;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use tracing::{debug, warn};

use crate::error::{DUPLICATE_ID, TABLE_UNAVAILABLE, TX_READ_ONLY, TX_SCOPE, UNKNOWN_INDEX};
use crate::model::Entity;
use crate::table::{bind_index, IndexDef, IndexValue, Table};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Bounds for an index range scan: `lower` inclusive, `upper` exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRange {
    pub lower: Option<IndexValue>,
    pub upper: Option<IndexValue>,
}

impl IndexRange {
    pub fn below(upper: impl Into<IndexValue>) -> Self {
        Self {
            lower: None,
            upper: Some(upper.into()),
        }
    }

    pub fn between(lower: impl Into<IndexValue>, upper: impl Into<IndexValue>) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: Some(upper.into()),
        }
    }
}

/// A transaction scoped to a fixed set of tables. Either every write made
/// through it commits, or none does.
pub struct StoreTx {
    tx: Option<Transaction<'static, Sqlite>>,
    scope: Vec<Table>,
    mode: TxMode,
    version: i64,
}

fn decode<E: Entity>(table: Table, data: &str) -> AppResult<E> {
    serde_json::from_str(data).map_err(|e| AppError::from(e).with_context("table", table.name()))
}

impl StoreTx {
    pub(crate) fn new(
        tx: Transaction<'static, Sqlite>,
        scope: Vec<Table>,
        mode: TxMode,
        version: i64,
    ) -> Self {
        debug!(target: "handreceipt", event = "db_tx_begin", tables = ?scope, mode = ?mode);
        Self {
            tx: Some(tx),
            scope,
            mode,
            version,
        }
    }

    pub fn mode(&self) -> TxMode {
        self.mode
    }

    pub fn scope(&self) -> &[Table] {
        &self.scope
    }

    fn check(&self, table: Table, write: bool) -> AppResult<()> {
        if !self.scope.contains(&table) {
            return Err(
                AppError::new(TX_SCOPE, "Table is outside this transaction's scope.")
                    .with_context("table", table.name()),
            );
        }
        if write && self.mode == TxMode::ReadOnly {
            return Err(
                AppError::new(TX_READ_ONLY, "Cannot write in a read-only transaction.")
                    .with_context("table", table.name()),
            );
        }
        if table.since() > self.version {
            return Err(
                AppError::new(TABLE_UNAVAILABLE, "Table does not exist at this schema version.")
                    .with_context("table", table.name()),
            );
        }
        Ok(())
    }

    fn index(&self, table: Table, name: &str) -> AppResult<&'static IndexDef> {
        match table.index(name) {
            Some(def) if def.since <= self.version => Ok(def),
            _ => Err(AppError::new(UNKNOWN_INDEX, "Index does not exist.")
                .with_context("table", table.name())
                .with_context("index", name)),
        }
    }

    fn conn(&mut self) -> AppResult<&mut SqliteConnection> {
        match self.tx.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(AppError::storage_unavailable("Transaction already finished.")),
        }
    }

    pub async fn exists(&mut self, table: Table, id: &str) -> AppResult<bool> {
        self.check(table, false)?;
        let sql = format!("SELECT 1 FROM {} WHERE id = ?", table.name());
        let found: Option<i64> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(found.is_some())
    }

    pub async fn get<E: Entity>(&mut self, id: &str) -> AppResult<Option<E>> {
        self.check(E::TABLE, false)?;
        let sql = format!("SELECT data FROM {} WHERE id = ?", E::TABLE.name());
        let data: Option<String> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;
        data.map(|d| decode(E::TABLE, &d)).transpose()
    }

    pub async fn get_all<E: Entity>(&mut self) -> AppResult<Vec<E>> {
        self.check(E::TABLE, false)?;
        let sql = format!("SELECT data FROM {} ORDER BY id", E::TABLE.name());
        let rows: Vec<String> = sqlx::query_scalar(&sql).fetch_all(self.conn()?).await?;
        rows.iter().map(|d| decode(E::TABLE, d)).collect()
    }

    /// Rows whose `index` equals `value`, in id order.
    pub async fn get_all_by_index<E: Entity>(
        &mut self,
        index: &str,
        value: impl Into<IndexValue>,
    ) -> AppResult<Vec<E>> {
        self.check(E::TABLE, false)?;
        let def = self.index(E::TABLE, index)?;
        let value = value.into();
        let rows: Vec<String> = if value == IndexValue::Null {
            let sql = format!(
                "SELECT data FROM {} WHERE {} IS NULL ORDER BY id",
                E::TABLE.name(),
                def.column
            );
            sqlx::query_scalar(&sql).fetch_all(self.conn()?).await?
        } else {
            let sql = format!(
                "SELECT data FROM {} WHERE {} = ? ORDER BY id",
                E::TABLE.name(),
                def.column
            );
            let query = sqlx::query(&sql);
            let query = bind_index(query, &value);
            let rows = query.fetch_all(self.conn()?).await?;
            rows.iter()
                .map(|row| sqlx::Row::try_get::<String, _>(row, "data"))
                .collect::<Result<_, _>>()?
        };
        rows.iter().map(|d| decode(E::TABLE, d)).collect()
    }

    /// Rows whose `index` falls within `range`, ordered by the index then id.
    /// Rows with a NULL index value are never included.
    pub async fn get_all_by_index_range<E: Entity>(
        &mut self,
        index: &str,
        range: IndexRange,
    ) -> AppResult<Vec<E>> {
        self.check(E::TABLE, false)?;
        let def = self.index(E::TABLE, index)?;
        let mut sql = format!(
            "SELECT data FROM {} WHERE {} IS NOT NULL",
            E::TABLE.name(),
            def.column
        );
        if range.lower.is_some() {
            sql.push_str(&format!(" AND {} >= ?", def.column));
        }
        if range.upper.is_some() {
            sql.push_str(&format!(" AND {} < ?", def.column));
        }
        sql.push_str(&format!(" ORDER BY {}, id", def.column));

        let mut query = sqlx::query(&sql);
        if let Some(lower) = &range.lower {
            query = bind_index(query, lower);
        }
        if let Some(upper) = &range.upper {
            query = bind_index(query, upper);
        }
        let rows = query.fetch_all(self.conn()?).await?;
        rows.iter()
            .map(|row| {
                let data: String = sqlx::Row::try_get(row, "data")?;
                decode(E::TABLE, &data)
            })
            .collect()
    }

    /// Upsert: inserts `entity` or replaces the row with the same id.
    pub async fn put<E: Entity>(&mut self, entity: &E) -> AppResult<()> {
        self.check(E::TABLE, true)?;
        let table = E::TABLE;
        let data = serde_json::to_string(entity)?;
        let defs: Vec<&IndexDef> = table.indexes_at(self.version).collect();

        let mut columns = vec!["id", "data"];
        columns.extend(defs.iter().map(|d| d.column));
        let placeholders = vec!["?"; columns.len()].join(", ");
        let updates = columns[1..]
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
            table.name(),
            columns.join(", "),
            placeholders,
            updates
        );

        let values: Vec<IndexValue> = defs.iter().map(|d| entity.index_value(d.column)).collect();
        let mut query = sqlx::query(&sql).bind(entity.id().to_string()).bind(data);
        for value in &values {
            query = bind_index(query, value);
        }
        query.execute(self.conn()?).await?;
        Ok(())
    }

    /// Inserts `entity`, refusing to replace an existing row under the same id.
    pub async fn insert<E: Entity>(&mut self, entity: &E) -> AppResult<()> {
        if self.exists(E::TABLE, entity.id()).await? {
            return Err(
                AppError::new(DUPLICATE_ID, "A record with this id already exists.")
                    .with_context("table", E::TABLE.name())
                    .with_context("id", entity.id().to_string()),
            );
        }
        self.put(entity).await
    }

    pub async fn delete(&mut self, table: Table, id: &str) -> AppResult<bool> {
        self.check(table, true)?;
        let sql = format!("DELETE FROM {} WHERE id = ?", table.name());
        let res = sqlx::query(&sql).bind(id).execute(self.conn()?).await?;
        Ok(res.rows_affected() > 0)
    }

    /// Deletes every row whose `index` equals `value`; returns the count.
    pub async fn delete_by_index(
        &mut self,
        table: Table,
        index: &str,
        value: impl Into<IndexValue>,
    ) -> AppResult<u64> {
        self.check(table, true)?;
        let def = self.index(table, index)?;
        let sql = format!("DELETE FROM {} WHERE {} = ?", table.name(), def.column);
        let value = value.into();
        let query = bind_index(sqlx::query(&sql), &value);
        let res = query.execute(self.conn()?).await?;
        Ok(res.rows_affected())
    }

    pub async fn count(&mut self, table: Table) -> AppResult<i64> {
        self.check(table, false)?;
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let n: i64 = sqlx::query_scalar(&sql).fetch_one(self.conn()?).await?;
        Ok(n)
    }

    pub async fn count_by_index(
        &mut self,
        table: Table,
        index: &str,
        value: impl Into<IndexValue>,
    ) -> AppResult<i64> {
        self.check(table, false)?;
        let def = self.index(table, index)?;
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {} = ?", table.name(), def.column);
        let value = value.into();
        let row = bind_index(sqlx::query(&sql), &value)
            .fetch_one(self.conn()?)
            .await?;
        Ok(sqlx::Row::try_get(&row, 0)?)
    }

    pub async fn get_all_raw(&mut self, table: Table) -> AppResult<Vec<Value>> {
        self.check(table, false)?;
        let sql = format!("SELECT data FROM {} ORDER BY id", table.name());
        let rows: Vec<String> = sqlx::query_scalar(&sql).fetch_all(self.conn()?).await?;
        rows.iter()
            .map(|d| serde_json::from_str(d).map_err(AppError::from))
            .collect()
    }

    pub async fn commit(mut self) -> AppResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            debug!(target: "handreceipt", event = "db_tx_commit", tables = ?self.scope);
        }
        Ok(())
    }

    /// Commits when `result` is `Ok`, otherwise rolls back and hands the
    /// original error back to the caller.
    pub async fn finish<T>(self, result: AppResult<T>) -> AppResult<T> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(
                        target: "handreceipt",
                        event = "db_tx_rollback_failed",
                        error = %rollback_err
                    );
                }
                Err(err)
            }
        }
    }

    pub async fn rollback(mut self) -> AppResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
            debug!(target: "handreceipt", event = "db_tx_rollback", tables = ?self.scope);
        }
        Ok(())
    }
}

impl Drop for StoreTx {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!(
                target: "handreceipt",
                event = "db_tx_rollback",
                reason = "dropped_uncommitted",
                tables = ?self.scope
            );
        }
    }
}
