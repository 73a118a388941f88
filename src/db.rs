use rocket_db_pools::{Database, sqlx};

#[derive(Database)]
#[database("vault_db")]
pub struct VaultDb(sqlx::PgPool);
