//! Wiring of the event store, projections and enforcer over one database

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::event_store::SqliteEventStore;
use crate::projection::ProjectionSynchronizer;
use crate::quota::{QuotaEnforcer, RetryPolicy};
use crate::settings::StaticAllocation;

pub struct QuotaServices {
    pub db: SqlitePool,
    pub store: Arc<SqliteEventStore>,
    pub projections: Arc<ProjectionSynchronizer>,
    pub enforcer: Arc<QuotaEnforcer>,
}

impl QuotaServices {
    /// Open the configured database and initialize its tables
    pub async fn connect(config: &Config) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database.url)?.create_if_missing(true);
        let db = SqlitePoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect_with(options)
            .await?;

        info!("Connected to {}", config.database.url);
        Self::from_pool(db, config).await
    }

    pub async fn from_pool(db: SqlitePool, config: &Config) -> Result<Self> {
        let store = Arc::new(SqliteEventStore::new(db.clone()));
        store.init_db().await?;

        let projections = Arc::new(ProjectionSynchronizer::new(db.clone(), store.clone()));
        projections.init_db().await?;

        let allocation = Arc::new(StaticAllocation::from_config(&config.quota));
        let enforcer = QuotaEnforcer::new(store.clone(), allocation)
            .with_handler(projections.clone())
            .with_retry_policy(RetryPolicy::from_config(&config.quota));

        Ok(Self {
            db,
            store,
            projections,
            enforcer: Arc::new(enforcer),
        })
    }
}
