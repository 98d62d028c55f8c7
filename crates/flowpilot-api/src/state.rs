//! Application state wiring the engine to its infrastructure.
//!
//! The engine is generic over its repository and definition resolver;
//! `AppState` pins both to the SQLite store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use flowpilot_core::event::bus::EventBus;
use flowpilot_core::event::notifier::EventBusNotifier;
use flowpilot_core::workflow::dispatcher::NodeDispatcher;
use flowpilot_core::workflow::engine::Engine;
use flowpilot_infra::action::default_registry;
use flowpilot_infra::config::load_engine_config;
use flowpilot_infra::filesystem::{database_url, resolve_data_dir};
use flowpilot_infra::interpolate::TemplateInterpolator;
use flowpilot_infra::sqlite::pool::DatabasePool;
use flowpilot_infra::sqlite::run::SqliteRunStore;
use flowpilot_types::config::EngineConfig;

pub type ConcreteEngine = Engine<SqliteRunStore, SqliteRunStore>;

pub struct AppState {
    pub engine: ConcreteEngine,
    pub store: Arc<SqliteRunStore>,
    pub events: EventBus,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
    db_pool: DatabasePool,
}

impl AppState {
    /// Resolve the data directory, open the database and build the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;

        let db_pool = DatabasePool::new(&database_url(&data_dir))
            .await
            .context("failed to open database")?;
        let store = Arc::new(SqliteRunStore::new(db_pool.clone()));

        let actions = default_registry(&config).context("failed to build action handlers")?;
        let dispatcher =
            NodeDispatcher::new(actions).with_interpolator(Arc::new(TemplateInterpolator::new()));

        let events = EventBus::new(config.event_bus_capacity);
        let engine = Engine::new(store.clone(), store.clone(), Arc::new(dispatcher), config.clone())
            .with_notifier(Arc::new(EventBusNotifier::new(events.clone())));

        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");

        Ok(Self {
            engine,
            store,
            events,
            config,
            data_dir,
            db_pool,
        })
    }

    pub async fn close(&self) {
        self.db_pool.close().await;
    }
}
