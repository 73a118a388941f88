//! Persistent storage backends for the vault.

pub mod postgres;

pub use postgres::PgVaultStore;

use rocket_db_pools::sqlx::{self, PgPool, migrate::Migrator};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply pending schema migrations.
///
/// Idempotent: migrations already recorded in `_sqlx_migrations` are skipped
/// after their checksums are verified.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    log::info!("checking database migration state");
    MIGRATOR.run(pool).await?;
    log::info!("database migrations up to date");
    Ok(())
}
