//! Application state

use std::sync::Arc;

use sqlx::PgPool;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<sekolah_billing::BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool) -> anyhow::Result<Self> {
        let billing = sekolah_billing::BillingService::from_env(pool)?;
        tracing::info!("Billing service initialized");

        Ok(Self {
            billing: Arc::new(billing),
        })
    }
}
