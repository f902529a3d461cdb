//! loot-db
//!
//! Persistence for accounts, item instances, claim nonces, the claim ledger
//! and rate-limit buckets. [`Store`] is the seam; [`PgStore`] is the
//! production implementation and [`MemStore`] backs tests and the explicit
//! dev-only `LOOT_STORE=memory` mode.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

mod mem;
mod pg;
mod store;

pub use mem::MemStore;
pub use pg::PgStore;
pub use store::{
    BucketHit, ClaimApply, LedgerInsert, NonceConsume, NonceRejection, Registration, Store,
    StoreError,
};

pub const ENV_DB_URL: &str = "LOOT_DATABASE_URL";

/// Connect to Postgres at `url`.
pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='claim_ledger'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_ledger_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_ledger_table: bool,
}
