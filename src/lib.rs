//! Local persistence and sync layer for hand-receipt, maintenance and supply
//! tracking on intermittently connected clients.

pub mod config;
pub mod db;
pub mod error;
pub mod id;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod outbox;
pub mod seed;
pub mod state;
pub mod stats;
pub mod store;
pub mod table;
pub mod time;

pub use config::{AppConfig, SyncConfig};
pub use db::{Database, DbLocation, IndexRange, OpenOptions, SchemaCoordinator, StoreTx, TxMode};
pub use error::{AppError, AppResult, ErrorKind};
pub use logging::init_logging;
pub use outbox::{Outbox, OutboxEntry, OutboxStatus, RemoteAction};
pub use state::AppState;
pub use stats::StatsSnapshot;
pub use store::EntityStore;
pub use table::{IndexValue, Table};
