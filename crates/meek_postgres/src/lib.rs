//! meek_postgres — PostgreSQL implementations of the meek_core store
//! ports. The schema lives in `migrations/0001_init.sql` and is applied
//! by [`apply_schema`] at startup.

pub mod sqlx_types;
pub mod store;

pub use store::{
    PgModelStore, PgNodeStore, PgResultSink, PgStreamStore, PgSubTaskStore, PgTaskStore,
};

use meek_core::error::MeekError;
use sqlx::PgPool;

/// Convenience struct that constructs all Postgres adapters from a single
/// pool.
pub struct PgStores {
    pub tasks: PgTaskStore,
    pub subtasks: PgSubTaskStore,
    pub nodes: PgNodeStore,
    pub streams: PgStreamStore,
    pub models: PgModelStore,
    pub results: PgResultSink,
}

impl PgStores {
    pub fn new(pool: PgPool) -> Self {
        Self {
            tasks: PgTaskStore::new(pool.clone()),
            subtasks: PgSubTaskStore::new(pool.clone()),
            nodes: PgNodeStore::new(pool.clone()),
            streams: PgStreamStore::new(pool.clone()),
            models: PgModelStore::new(pool.clone()),
            results: PgResultSink::new(pool),
        }
    }
}

/// Apply the bundled schema. Statements are idempotent (`IF NOT EXISTS`)
/// so this is safe to run on every boot.
pub async fn apply_schema(pool: &PgPool) -> Result<(), MeekError> {
    sqlx::raw_sql(include_str!("../migrations/0001_init.sql"))
        .execute(pool)
        .await
        .map_err(|e| MeekError::Internal(anyhow::anyhow!("schema apply failed: {e}")))?;
    tracing::info!("database schema ensured");
    Ok(())
}
