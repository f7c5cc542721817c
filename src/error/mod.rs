use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

pub const STORAGE_UNAVAILABLE: &str = "STORAGE/UNAVAILABLE";
pub const TABLE_UNAVAILABLE: &str = "DB/TABLE_UNAVAILABLE";
pub const VERSION_DOWNGRADE: &str = "DB/VERSION_DOWNGRADE";
pub const MIGRATION_PLAN: &str = "DB/MIGRATION_PLAN";
pub const MIGRATION_EDITED: &str = "DB/MIGRATION_EDITED";
pub const DESTRUCTIVE_MIGRATION: &str = "DB/DESTRUCTIVE_MIGRATION";
pub const TX_SCOPE: &str = "DB/TX_SCOPE";
pub const TX_READ_ONLY: &str = "DB/TX_READ_ONLY";
pub const UNKNOWN_INDEX: &str = "DB/UNKNOWN_INDEX";

pub const NOT_FOUND: &str = "STORE/NOT_FOUND";
pub const DUPLICATE_ID: &str = "STORE/DUPLICATE_ID";
pub const FOREIGN_KEY_VIOLATION: &str = "STORE/FOREIGN_KEY_VIOLATION";
pub const INVALID_TRANSITION: &str = "MAINTENANCE/INVALID_TRANSITION";
pub const VALIDATION: &str = "VALIDATION/INVALID";
pub const INSUFFICIENT_QUANTITY: &str = "VALIDATION/INSUFFICIENT_QUANTITY";
pub const COMPLETED_DATE_MISMATCH: &str = "VALIDATION/COMPLETED_DATE";

pub const NETWORK_ERROR: &str = "SYNC/NETWORK";
pub const SERVER_ERROR: &str = "SYNC/SERVER";
pub const CLIENT_REJECTED: &str = "SYNC/CLIENT_REJECTED";
pub const IDEMPOTENCY_CONFLICT: &str = "SYNC/IDEMPOTENCY_CONFLICT";
pub const AUTH_REQUIRED: &str = "SYNC/AUTH_REQUIRED";

/// Coarse classification of an [`AppError`] code, used by callers that branch
/// on the failure category rather than the exact code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    StorageUnavailable,
    NotFound,
    DuplicateId,
    ForeignKeyViolation,
    InvalidTransition,
    Validation,
    NetworkError,
    ServerError,
    ClientRejected,
    IdempotencyConflict,
    AuthRequired,
    Other,
}

/// A structured application error that can be serialized and surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human friendly message that can be shown directly to the user.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";

    /// Construct a new application error with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn not_found(table: &str, id: &str) -> Self {
        AppError::new(NOT_FOUND, "Record not found")
            .with_context("table", table)
            .with_context("id", id)
    }

    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        AppError::new(STORAGE_UNAVAILABLE, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        AppError::new(VALIDATION, message)
    }

    /// Returns the error code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the contextual metadata associated with the error.
    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// Returns the nested cause if one is present.
    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Maps the code onto the failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self.code.as_str() {
            STORAGE_UNAVAILABLE | TABLE_UNAVAILABLE | VERSION_DOWNGRADE => {
                ErrorKind::StorageUnavailable
            }
            NOT_FOUND => ErrorKind::NotFound,
            DUPLICATE_ID => ErrorKind::DuplicateId,
            FOREIGN_KEY_VIOLATION => ErrorKind::ForeignKeyViolation,
            INVALID_TRANSITION => ErrorKind::InvalidTransition,
            NETWORK_ERROR => ErrorKind::NetworkError,
            SERVER_ERROR => ErrorKind::ServerError,
            CLIENT_REJECTED => ErrorKind::ClientRejected,
            IDEMPOTENCY_CONFLICT => ErrorKind::IdempotencyConflict,
            AUTH_REQUIRED => ErrorKind::AuthRequired,
            code if code.starts_with("VALIDATION/") => ErrorKind::Validation,
            _ => ErrorKind::Other,
        }
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Extends the context map with additional key/value pairs.
    pub fn with_contexts<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.context
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

// SQLITE_BUSY, SQLITE_LOCKED, SQLITE_FULL (primary result codes).
const SQLITE_UNAVAILABLE_CODES: &[&str] = &["5", "6", "13", "261", "262", "517"];

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => AppError::new(NOT_FOUND, "Record not found"),
            SqlxError::ColumnNotFound(name) => {
                AppError::new("SQLX/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
            }
            SqlxError::PoolTimedOut => AppError::new(
                STORAGE_UNAVAILABLE,
                "Timed out acquiring a database connection",
            ),
            SqlxError::PoolClosed => AppError::new(STORAGE_UNAVAILABLE, "Database pool is closed"),
            SqlxError::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            SqlxError::Database(db) => {
                let raw = db.code().map(|code| code.to_string());
                let code = match raw.as_deref() {
                    Some(c) if SQLITE_UNAVAILABLE_CODES.contains(&c) => {
                        STORAGE_UNAVAILABLE.to_string()
                    }
                    Some(c) => format!("Sqlite/{c}"),
                    None => "SQLX/DATABASE".to_string(),
                };
                let mut app_error = AppError::new(code, db.message().to_string());
                if let Some(raw) = raw {
                    app_error = app_error.with_context("sqlite_code", raw);
                }
                if let Some(constraint) = db.constraint() {
                    app_error = app_error.with_context("constraint", constraint.to_string());
                }
                app_error
            }
            SqlxError::ColumnDecode { index, source } => {
                AppError::new("SQLX/COLUMN_DECODE", source.to_string())
                    .with_context("column_index", index.to_string())
            }
            SqlxError::Decode(decode_err) => AppError::new("SQLX/DECODE", decode_err.to_string()),
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn builds_error_with_context_and_cause() {
        let error = AppError::new("TEST/CODE", "Something went wrong")
            .with_context("table", "consumables")
            .with_context("id", "1234")
            .with_cause(AppError::from("inner failure"));

        assert_eq!(error.code(), "TEST/CODE");
        assert_eq!(error.message(), "Something went wrong");
        assert_eq!(error.context().get("table"), Some(&"consumables".to_string()));
        assert_eq!(error.context().get("id"), Some(&"1234".to_string()));
        let cause = error.cause().expect("cause present");
        assert_eq!(cause.message(), "inner failure");
        assert_eq!(cause.code(), AppError::GENERIC_CODE);
    }

    #[test]
    fn converts_anyhow_error_chain_into_nested_causes() {
        let err = (|| -> anyhow::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
                .context("failed to save file")
        })()
        .unwrap_err();

        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), AppError::UNKNOWN_CODE);
        assert_eq!(app_error.message(), "failed to save file");

        let cause = app_error.cause().expect("io cause present");
        assert!(cause.message().contains("disk full"));
    }

    #[test]
    fn kind_follows_code_namespace() {
        assert_eq!(
            AppError::not_found("properties", "p1").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            AppError::new(TABLE_UNAVAILABLE, "x").kind(),
            ErrorKind::StorageUnavailable
        );
        assert_eq!(
            AppError::new(INSUFFICIENT_QUANTITY, "x").kind(),
            ErrorKind::Validation
        );
        assert_eq!(AppError::from("free form").kind(), ErrorKind::Other);
    }

    #[test]
    fn sqlx_pool_timeout_is_storage_unavailable() {
        let app_error = AppError::from(SqlxError::PoolTimedOut);
        assert_eq!(app_error.kind(), ErrorKind::StorageUnavailable);
    }

    #[test]
    fn sqlx_row_not_found_translates_to_not_found() {
        let app_error = AppError::from(SqlxError::RowNotFound);
        assert_eq!(app_error.code(), NOT_FOUND);
        assert_eq!(app_error.message(), "Record not found");
    }

    #[test]
    fn serde_json_errors_capture_position() {
        let err: SerdeJsonError =
            serde_json::from_str::<serde_json::Value>("{\"foo\": }").expect_err("invalid json");
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "JSON/SYNTAX");
        assert!(app_error.context().contains_key("line"));
        assert!(app_error.context().contains_key("column"));
    }

    #[test]
    fn json_shape_is_flat_struct() {
        let error = AppError::new(INVALID_TRANSITION, "nope").with_context("from", "completed");
        let json = serde_json::to_string(&error).expect("serialize app error");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse serialized error");
        assert_eq!(
            value.get("code").and_then(|v| v.as_str()),
            Some(INVALID_TRANSITION)
        );
        assert_eq!(
            value
                .get("context")
                .and_then(|c| c.get("from"))
                .and_then(|v| v.as_str()),
            Some("completed")
        );
        assert!(value.get("cause").is_none());
    }
}
