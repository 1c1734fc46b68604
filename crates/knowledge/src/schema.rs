//! SQLite schema for the document backend.

use sqlx::SqlitePool;

use crate::error::Result;

/// Apply pending migrations from `migrations/`.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
