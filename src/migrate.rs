use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::{Executor, Row, SqlitePool};
use tracing::{error, info};

use crate::error::{DESTRUCTIVE_MIGRATION, MIGRATION_EDITED, MIGRATION_PLAN};
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// One additive schema step, identified by the version it upgrades to.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "0001_core_inventory.sql",
        sql: include_str!("../migrations/0001_core_inventory.sql"),
    },
    Migration {
        version: 2,
        name: "0002_maintenance.sql",
        sql: include_str!("../migrations/0002_maintenance.sql"),
    },
    Migration {
        version: 3,
        name: "0003_outbox.sql",
        sql: include_str!("../migrations/0003_outbox.sql"),
    },
    Migration {
        version: 4,
        name: "0004_consumable_expiration.sql",
        sql: include_str!("../migrations/0004_consumable_expiration.sql"),
    },
];

/// Version the application expects to run against.
pub const LATEST_VERSION: i64 = 4;

static ADD_COLUMN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^ALTER\s+TABLE\s+(\w+)\s+ADD\s+COLUMN\s+(\w+)")
        .expect("add column pattern to compile")
});

static DESTRUCTIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(DROP\b|DELETE\s+FROM\b|TRUNCATE\b|ALTER\s+TABLE\s+\w+\s+(RENAME|DROP)\b)")
        .expect("destructive statement pattern to compile")
});

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.chars().count() > 160 {
        let cut: String = trimmed.chars().take(160).collect();
        format!("{cut}…")
    } else {
        trimmed.to_string()
    }
}

fn cleaned(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn checksum(migration: &Migration) -> String {
    format!("{:x}", Sha256::digest(cleaned(migration.sql).as_bytes()))
}

fn statements(migration: &Migration) -> Vec<String> {
    cleaned(migration.sql)
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| {
            let upper = s.to_ascii_uppercase();
            upper != "BEGIN" && upper != "COMMIT"
        })
        .map(str::to_string)
        .collect()
}

/// Rejects statements that could drop or truncate existing data.
pub fn ensure_additive(migration: &Migration) -> AppResult<()> {
    for stmt in statements(migration) {
        if DESTRUCTIVE_RE.is_match(&stmt) {
            return Err(AppError::new(
                DESTRUCTIVE_MIGRATION,
                "Migrations may only add tables, columns and indexes.",
            )
            .with_context("migration", migration.name)
            .with_context("sql", preview(&stmt)));
        }
    }
    Ok(())
}

/// Checks the plan is a contiguous ledger starting at 1 that reaches `target`.
pub fn validate_plan(migrations: &[Migration], target: i64) -> AppResult<()> {
    for (expected, migration) in (1_i64..).zip(migrations) {
        if migration.version != expected {
            return Err(AppError::new(
                MIGRATION_PLAN,
                "Migration versions must be contiguous from 1.",
            )
            .with_context("expected", expected.to_string())
            .with_context("found", migration.version.to_string()));
        }
        ensure_additive(migration)?;
    }
    let last = migrations.last().map(|m| m.version).unwrap_or(0);
    if target < 1 || target > last {
        return Err(
            AppError::new(MIGRATION_PLAN, "Target version is outside the migration plan.")
                .with_context("target", target.to_string())
                .with_context("latest", last.to_string()),
        );
    }
    Ok(())
}

async fn ensure_ledger(pool: &SqlitePool) -> AppResult<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version    INTEGER PRIMARY KEY,\
           name       TEXT NOT NULL,\
           applied_at INTEGER NOT NULL,\
           checksum   TEXT NOT NULL\
         )",
    )
    .await?;
    Ok(())
}

/// Highest applied version, 0 for a fresh database.
pub async fn current_version(pool: &SqlitePool) -> AppResult<i64> {
    ensure_ledger(pool).await?;
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

/// Applies `migrations[current+1 ..= target]` in order, one transaction per
/// step, and returns the resulting version. Already applied steps are checked
/// against their recorded checksum.
pub async fn apply_migrations(
    pool: &SqlitePool,
    migrations: &[Migration],
    target: i64,
) -> AppResult<i64> {
    validate_plan(migrations, target)?;
    ensure_ledger(pool).await?;

    let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let mut applied: HashMap<i64, String> = HashMap::new();
    for r in rows {
        applied.insert(r.try_get("version")?, r.try_get("checksum")?);
    }

    for migration in migrations.iter().filter(|m| m.version <= target) {
        let sum = checksum(migration);
        if let Some(stored) = applied.get(&migration.version) {
            if stored != &sum {
                return Err(AppError::new(
                    MIGRATION_EDITED,
                    "Migration was edited after it was applied.",
                )
                .with_context("migration", migration.name));
            }
            info!(target: "handreceipt", event = "migration_skip", file = %migration.name);
            continue;
        }

        let mut tx = pool.begin().await?;
        for stmt in statements(migration) {
            if let Some(caps) = ADD_COLUMN_RE.captures(&stmt) {
                let table = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                let col = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                let exists: Option<i64> = sqlx::query_scalar(
                    "SELECT 1 FROM pragma_table_info(?) WHERE name = ?",
                )
                .bind(table)
                .bind(col)
                .fetch_optional(&mut *tx)
                .await?;
                if exists.is_some() {
                    info!(target: "handreceipt", event = "migration_stmt_skip", file = %migration.name, sql = %preview(&stmt));
                    continue;
                }
            }
            info!(target: "handreceipt", event = "migration_stmt", file = %migration.name, sql = %preview(&stmt));
            if let Err(e) = sqlx::query(&stmt).execute(&mut *tx).await {
                error!(target: "handreceipt", event = "migration_stmt_error", file = %migration.name, sql = %preview(&stmt), error = %e);
                return Err(AppError::from(e).with_context("migration", migration.name));
            }
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, name, applied_at, checksum) VALUES (?, ?, ?, ?)",
        )
        .bind(migration.version)
        .bind(migration.name)
        .bind(now_ms())
        .bind(&sum)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(target: "handreceipt", event = "migration_file_applied", file = %migration.name, version = migration.version);
    }

    current_version(pool).await
}
