use tokio::task::JoinHandle;
use tracing::info;

use crate::config::AppConfig;
use crate::db::{Database, OpenOptions, SchemaCoordinator};
use crate::migrate::{LATEST_VERSION, MIGRATIONS};
use crate::model::Entity;
use crate::outbox::{Outbox, OutboxEntry, RemoteAction};
use crate::seed::{self, SeedReport};
use crate::store::{write_scope, EntityStore};
use crate::table::Table;
use crate::AppResult;

/// Application handle built once at startup and passed to whatever needs
/// storage. Cloning shares the same database.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: SchemaCoordinator,
    pub db: Database,
    pub store: EntityStore,
    pub outbox: Outbox,
}

impl AppState {
    /// Opens the database at `config.db_path()`, recovers interrupted outbox
    /// entries and seeds the demo dataset when enabled.
    pub async fn init(config: &AppConfig) -> AppResult<(AppState, Option<SeedReport>)> {
        let options = OpenOptions::file(config.db_path()).with_open_timeout(config.open_timeout);
        Self::open(SchemaCoordinator::default(), &options, config).await
    }

    /// Like [`AppState::init`] against explicit open options and coordinator.
    pub async fn open(
        coordinator: SchemaCoordinator,
        options: &OpenOptions,
        config: &AppConfig,
    ) -> AppResult<(AppState, Option<SeedReport>)> {
        let db = Database::open(&coordinator, options, LATEST_VERSION, MIGRATIONS).await?;
        let store = EntityStore::new(db.clone())?;
        let outbox = Outbox::new(db.clone(), config.sync.clone()).await?;
        outbox.recover_interrupted().await?;

        let seeded = if config.seed_demo {
            Some(seed::seed_demo(&store).await?)
        } else {
            None
        };

        info!(
            target: "handreceipt",
            event = "app_state_ready",
            db = %db.name(),
            version = db.version()
        );
        Ok((
            AppState {
                coordinator,
                db,
                store,
                outbox,
            },
            seeded,
        ))
    }

    /// Creates `entity` locally and queues `action`; both commit or neither.
    /// Actions without an entity key are keyed to the written entity so
    /// later writes to it replay after this one.
    pub async fn create_synced<E: Entity>(
        &self,
        entity: &E,
        action: RemoteAction,
    ) -> AppResult<OutboxEntry> {
        let tables = synced_scope::<E>(entity);
        let mut tx = self.store.begin(&tables).await?;
        let result = async {
            EntityStore::create_in(&mut tx, entity).await?;
            let action = keyed::<E>(action, entity.id());
            self.outbox.enqueue_in(&mut tx, action).await
        }
        .await;
        let entry = tx.finish(result).await?;
        self.outbox.refresh_status().await?;
        Ok(entry)
    }

    pub async fn update_synced<E: Entity>(
        &self,
        entity: &E,
        action: RemoteAction,
    ) -> AppResult<OutboxEntry> {
        let tables = synced_scope::<E>(entity);
        let mut tx = self.store.begin(&tables).await?;
        let result = async {
            EntityStore::update_in(&mut tx, entity).await?;
            let action = keyed::<E>(action, entity.id());
            self.outbox.enqueue_in(&mut tx, action).await
        }
        .await;
        let entry = tx.finish(result).await?;
        self.outbox.refresh_status().await?;
        Ok(entry)
    }

    pub async fn delete_synced<E: Entity>(
        &self,
        id: &str,
        action: RemoteAction,
    ) -> AppResult<OutboxEntry> {
        let tables = write_scope::<E>(&[Table::Outbox]);
        let mut tx = self.store.begin(&tables).await?;
        let result = async {
            EntityStore::delete_in::<E>(&mut tx, id).await?;
            let action = keyed::<E>(action, id);
            self.outbox.enqueue_in(&mut tx, action).await
        }
        .await;
        let entry = tx.finish(result).await?;
        self.outbox.refresh_status().await?;
        Ok(entry)
    }

    pub async fn shutdown(&self) {
        self.db.close().await;
    }

    /// Spawns a listener that shuts this handle down once a newer schema
    /// version asks for it. The task ends when the handle closes.
    pub fn close_on_version_change(&self) -> JoinHandle<()> {
        let state = self.clone();
        let mut version_change = self.db.version_change();
        tokio::spawn(async move {
            loop {
                let requested = *version_change.borrow_and_update();
                if let Some(requested) = requested {
                    info!(
                        target: "handreceipt",
                        event = "app_state_version_change",
                        db = %state.db.name(),
                        version = state.db.version(),
                        requested_version = requested
                    );
                    state.shutdown().await;
                    return;
                }
                if version_change.changed().await.is_err() {
                    return;
                }
            }
        })
    }
}

fn synced_scope<E: Entity>(entity: &E) -> Vec<Table> {
    let mut extra: Vec<Table> = entity.references().iter().map(|r| r.table).collect();
    extra.push(Table::Outbox);
    write_scope::<E>(&extra)
}

fn keyed<E: Entity>(action: RemoteAction, id: &str) -> RemoteAction {
    if action.entity_key.is_some() {
        action
    } else {
        action.for_entity(E::TABLE, id)
    }
}
