#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Sekolah shared crate
//!
//! Common domain enums and database plumbing used by the api, billing and
//! worker crates. Keeps the billing crate free of connection-pool concerns.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub mod status;

pub use status::{BillingCycle, SubscriptionStatus, TransactionStatus};

/// Create the standard connection pool for request-serving binaries.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// Run the embedded migrations.
///
/// Must be called against a direct connection, not a transaction pooler.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}
