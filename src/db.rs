use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, SqlitePool};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{TABLE_UNAVAILABLE, VERSION_DOWNGRADE};
use crate::migrate::{self, Migration};
use crate::model::Entity;
use crate::table::{IndexValue, Table};
use crate::{AppError, AppResult};

pub mod coordinator;
pub mod tx;

pub use coordinator::{Registration, SchemaCoordinator};
pub use tx::{IndexRange, StoreTx, TxMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocation {
    File(PathBuf),
    /// Private in-memory database; gone once the handle closes.
    Memory,
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Logical database name; handles sharing a name share the version handshake.
    pub name: String,
    pub location: DbLocation,
    /// How long an upgrade waits for older handles to close.
    pub open_timeout: Duration,
}

impl OpenOptions {
    pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            location: DbLocation::File(path),
            open_timeout: Self::DEFAULT_OPEN_TIMEOUT,
        }
    }

    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: DbLocation::Memory,
            open_timeout: Self::DEFAULT_OPEN_TIMEOUT,
        }
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

struct DatabaseInner {
    name: String,
    version: i64,
    pool: SqlitePool,
    version_change: watch::Receiver<Option<i64>>,
    registration: Mutex<Option<Registration>>,
}

/// An open, migrated database handle. Cheap to clone; every clone shares the
/// same pool and registration.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

async fn open_pool(location: &DbLocation) -> AppResult<SqlitePool> {
    let (options, in_memory) = match location {
        DbLocation::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    tracing::error!(
                        target: "handreceipt",
                        error = %e,
                        event = "data_dir_create_failed",
                        path = %parent.display()
                    );
                    AppError::from(e).with_context("path", parent.display().to_string())
                })?;
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Full);
            (options, false)
        }
        DbLocation::Memory => (SqliteConnectOptions::from_str("sqlite::memory:")?, true),
    };

    let options = options
        .busy_timeout(Duration::from_secs(5))
        .log_statements(log::LevelFilter::Off);

    // One connection per handle: operations from one context commit in
    // program order, and an in-memory database lives exactly as long as it.
    let mut pool_options = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10));
    if in_memory {
        pool_options = pool_options.idle_timeout(None).max_lifetime(None);
    }
    let pool = pool_options.connect_with(options).await?;
    Ok(pool)
}

async fn log_effective_pragmas(pool: &SqlitePool, name: &str, version: i64, from_version: i64) {
    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let busy: (i64,) = sqlx::query_as("PRAGMA busy_timeout;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "handreceipt",
        event = "db_open",
        db = %name,
        version,
        from_version,
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        busy_timeout_ms = %busy.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") && !jm.0.eq_ignore_ascii_case("memory") {
        warn!(
            target: "handreceipt",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

impl Database {
    /// Opens `options.name` at `target_version`, applying the missing
    /// migrations in order. Older live handles on the same name are asked to
    /// close first; see [`SchemaCoordinator`].
    pub async fn open(
        coordinator: &SchemaCoordinator,
        options: &OpenOptions,
        target_version: i64,
        migrations: &[Migration],
    ) -> AppResult<Database> {
        migrate::validate_plan(migrations, target_version)?;
        let registration = coordinator
            .acquire(&options.name, target_version, options.open_timeout)
            .await?;

        let pool = open_pool(&options.location).await?;
        let upgraded = async {
            let from_version = migrate::current_version(&pool).await?;
            if from_version > target_version {
                return Err(AppError::new(
                    VERSION_DOWNGRADE,
                    "Database was created by a newer version of the application.",
                )
                .with_context("stored_version", from_version.to_string())
                .with_context("requested_version", target_version.to_string()));
            }
            let version = migrate::apply_migrations(&pool, migrations, target_version).await?;
            Ok::<_, AppError>((from_version, version))
        }
        .await;

        let (from_version, version) = match upgraded {
            Ok(versions) => versions,
            Err(err) => {
                pool.close().await;
                return Err(err);
            }
        };

        log_effective_pragmas(&pool, &options.name, version, from_version).await;

        Ok(Database {
            inner: Arc::new(DatabaseInner {
                name: options.name.clone(),
                version,
                pool,
                version_change: registration.version_change(),
                registration: Mutex::new(Some(registration)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> i64 {
        self.inner.version
    }

    /// Fires with the requested version when a newer open is waiting for
    /// this handle to close.
    pub fn version_change(&self) -> watch::Receiver<Option<i64>> {
        self.inner.version_change.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    /// Closes the pool and releases the handshake slot. Later operations on
    /// any clone fail with `StorageUnavailable`.
    pub async fn close(&self) {
        self.inner.pool.close().await;
        let registration = self
            .inner
            .registration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(registration);
        info!(target: "handreceipt", event = "db_close", db = %self.inner.name);
    }

    pub fn ensure_available(&self, table: Table) -> AppResult<()> {
        if table.since() <= self.version() {
            Ok(())
        } else {
            Err(
                AppError::new(TABLE_UNAVAILABLE, "Table does not exist at this schema version.")
                    .with_context("table", table.name())
                    .with_context("version", self.version().to_string()),
            )
        }
    }

    /// Starts a transaction over `tables`. Dropping it without `commit`
    /// rolls everything back.
    pub async fn begin(&self, tables: &[Table], mode: TxMode) -> AppResult<StoreTx> {
        for table in tables {
            self.ensure_available(*table)?;
        }
        let tx = self.inner.pool.begin().await?;
        Ok(StoreTx::new(tx, tables.to_vec(), mode, self.version()))
    }

    pub async fn get<E: Entity>(&self, id: &str) -> AppResult<Option<E>> {
        let mut tx = self.begin(&[E::TABLE], TxMode::ReadOnly).await?;
        let found = tx.get::<E>(id).await?;
        tx.commit().await?;
        Ok(found)
    }

    pub async fn get_all<E: Entity>(&self) -> AppResult<Vec<E>> {
        let mut tx = self.begin(&[E::TABLE], TxMode::ReadOnly).await?;
        let rows = tx.get_all::<E>().await?;
        tx.commit().await?;
        Ok(rows)
    }

    pub async fn get_all_by_index<E: Entity>(
        &self,
        index: &str,
        value: impl Into<IndexValue>,
    ) -> AppResult<Vec<E>> {
        let mut tx = self.begin(&[E::TABLE], TxMode::ReadOnly).await?;
        let rows = tx.get_all_by_index::<E>(index, value).await?;
        tx.commit().await?;
        Ok(rows)
    }

    pub async fn get_all_by_index_range<E: Entity>(
        &self,
        index: &str,
        range: IndexRange,
    ) -> AppResult<Vec<E>> {
        let mut tx = self.begin(&[E::TABLE], TxMode::ReadOnly).await?;
        let rows = tx.get_all_by_index_range::<E>(index, range).await?;
        tx.commit().await?;
        Ok(rows)
    }

    /// Upsert.
    pub async fn put<E: Entity>(&self, entity: &E) -> AppResult<()> {
        let mut tx = self.begin(&[E::TABLE], TxMode::ReadWrite).await?;
        tx.put(entity).await?;
        tx.commit().await
    }

    pub async fn delete(&self, table: Table, id: &str) -> AppResult<bool> {
        let mut tx = self.begin(&[table], TxMode::ReadWrite).await?;
        let removed = tx.delete(table, id).await?;
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn count(&self, table: Table) -> AppResult<i64> {
        let mut tx = self.begin(&[table], TxMode::ReadOnly).await?;
        let n = tx.count(table).await?;
        tx.commit().await?;
        Ok(n)
    }

    /// Stored JSON for every row of `table`, in id order.
    pub async fn get_all_raw(&self, table: Table) -> AppResult<Vec<Value>> {
        let mut tx = self.begin(&[table], TxMode::ReadOnly).await?;
        let rows = tx.get_all_raw(table).await?;
        tx.commit().await?;
        Ok(rows)
    }
}
