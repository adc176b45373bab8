//! Billing error taxonomy
//!
//! One enum for the whole crate. The api crate maps these onto HTTP status
//! codes; webhook processing additionally distinguishes security failures
//! (rejected) from business no-ops (acknowledged, never surfaced here).

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Unknown plan, subscription or transaction. 404-equivalent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate active subscription, invalid state transition, or a
    /// tenant-id mismatch between path and authenticated context.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing or malformed caller input, e.g. a virtual-account request
    /// without a bank code.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The request is well-formed but not payable: subscription already
    /// paid, or nothing owed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Payment provider unreachable or returned an invalid response. Always
    /// logged with provider context before being surfaced.
    #[error("payment gateway error: {0}")]
    Gateway(String),

    /// Inbound webhook carried a bad or missing verification token.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

impl BillingError {
    /// Whether this error should be acknowledged as success on the webhook
    /// channel instead of triggering provider retries.
    pub fn is_webhook_noop(&self) -> bool {
        matches!(self, BillingError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: BillingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[test]
    fn only_not_found_is_a_webhook_noop() {
        assert!(BillingError::NotFound("txn".into()).is_webhook_noop());
        assert!(!BillingError::WebhookSignatureInvalid.is_webhook_noop());
        assert!(!BillingError::Gateway("down".into()).is_webhook_noop());
    }
}
