//! Payment gateway adapter
//!
//! Provider-agnostic capability interface for the external payment provider.
//! The ledger and orchestrator only ever see this trait, so the concrete
//! provider can be swapped or mocked without touching billing logic.
//!
//! QRIS, virtual-account and e-wallet payments are three `method` variants of
//! the same `create_payment` call; they differ only in the artifact returned
//! and the provider-side channel code.

pub mod http;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

pub use http::{GatewayConfig, HttpPaymentGateway};

/// Payment channel requested by the tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Qris,
    VirtualAccount,
    Ewallet,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Qris => "qris",
            PaymentMethod::VirtualAccount => "virtual_account",
            PaymentMethod::Ewallet => "ewallet",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything the provider needs to create a charge.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub method: PaymentMethod,
    /// Smallest currency unit, must be positive.
    pub amount: i64,
    /// Locally generated idempotency key, echoed back in notifications.
    pub external_id: String,
    pub description: String,
    pub customer_name: String,
    pub customer_email: Option<String>,
    /// Required for virtual-account payments.
    pub bank_code: Option<String>,
    /// Required for e-wallet payments (provider channel, e.g. "OVO").
    pub ewallet_channel: Option<String>,
    pub expires_at: OffsetDateTime,
}

impl PaymentRequest {
    /// Method-specific field validation, run before any provider call so a
    /// bad request never reaches the network.
    pub fn validate(&self) -> BillingResult<()> {
        if self.amount <= 0 {
            return Err(BillingError::Validation(
                "payment amount must be positive".into(),
            ));
        }
        if self.external_id.trim().is_empty() {
            return Err(BillingError::Validation("external_id is required".into()));
        }
        match self.method {
            PaymentMethod::VirtualAccount => {
                if self.bank_code.as_deref().unwrap_or("").trim().is_empty() {
                    return Err(BillingError::Validation(
                        "bank_code is required for virtual-account payments".into(),
                    ));
                }
            }
            PaymentMethod::Ewallet => {
                if self
                    .ewallet_channel
                    .as_deref()
                    .unwrap_or("")
                    .trim()
                    .is_empty()
                {
                    return Err(BillingError::Validation(
                        "ewallet_channel is required for e-wallet payments".into(),
                    ));
                }
            }
            PaymentMethod::Qris => {}
        }
        Ok(())
    }
}

/// What the tenant actually pays with: the artifact side of a charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayableArtifact {
    Qris {
        qr_payload: String,
    },
    VirtualAccount {
        bank_code: String,
        account_number: String,
    },
    Ewallet {
        reference: String,
        payment_url: Option<String>,
    },
}

/// A successfully created provider-side charge.
#[derive(Debug, Clone)]
pub struct CreatedPayment {
    /// Provider-assigned charge id, when the provider issues one distinct
    /// from our external_id.
    pub provider_reference: Option<String>,
    pub artifact: PayableArtifact,
    pub expires_at: OffsetDateTime,
}

/// Provider-side view of a charge, as returned by a status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Pending,
    Paid { paid_at: Option<OffsetDateTime> },
    Expired,
    Failed { reason: Option<String> },
}

/// Capability interface every concrete provider adapter satisfies.
///
/// Adapter failures surface as `BillingError::Gateway`; an adapter must
/// never report success without a provider artifact, so the orchestrator can
/// safely persist the local row only after a successful return.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Stable provider identifier stored on each transaction row.
    fn provider_name(&self) -> &'static str;

    async fn create_payment(&self, request: &PaymentRequest) -> BillingResult<CreatedPayment>;

    async fn get_status(&self, external_id: &str) -> BillingResult<ProviderStatus>;

    /// Verify an inbound notification token. Default: constant-time compare
    /// against the configured callback token; accept everything when no
    /// token is configured.
    fn verify_notification(&self, inbound_token: Option<&str>) -> bool {
        verify_callback_token(self.configured_callback_token(), inbound_token)
    }

    fn configured_callback_token(&self) -> Option<&str>;
}

/// Constant-time token comparison. A configured token with no (or a
/// mismatched) inbound token is a rejection; no configured token accepts.
pub(crate) fn verify_callback_token(configured: Option<&str>, inbound: Option<&str>) -> bool {
    match configured {
        None => true,
        Some(expected) => match inbound {
            None => false,
            Some(got) => expected.as_bytes().ct_eq(got.as_bytes()).into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn request(method: PaymentMethod) -> PaymentRequest {
        PaymentRequest {
            method,
            amount: 6_100_000,
            external_id: "PAY-abc123".to_string(),
            description: "Subscription charge".to_string(),
            customer_name: "SMA Negeri 1".to_string(),
            customer_email: Some("admin@sman1.sch.id".to_string()),
            bank_code: None,
            ewallet_channel: None,
            expires_at: datetime!(2026-01-02 0:00 UTC),
        }
    }

    #[test]
    fn qris_needs_no_extra_fields() {
        assert!(request(PaymentMethod::Qris).validate().is_ok());
    }

    #[test]
    fn virtual_account_requires_bank_code() {
        let mut req = request(PaymentMethod::VirtualAccount);
        assert!(matches!(
            req.validate(),
            Err(BillingError::Validation(_))
        ));

        req.bank_code = Some("BCA".to_string());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn ewallet_requires_channel() {
        let mut req = request(PaymentMethod::Ewallet);
        assert!(matches!(req.validate(), Err(BillingError::Validation(_))));

        req.ewallet_channel = Some("OVO".to_string());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn non_positive_amount_rejected() {
        let mut req = request(PaymentMethod::Qris);
        req.amount = 0;
        assert!(matches!(req.validate(), Err(BillingError::Validation(_))));
        req.amount = -500;
        assert!(matches!(req.validate(), Err(BillingError::Validation(_))));
    }

    #[test]
    fn callback_token_verification() {
        // No token configured: accept anything.
        assert!(verify_callback_token(None, None));
        assert!(verify_callback_token(None, Some("whatever")));

        // Token configured: exact match only.
        assert!(verify_callback_token(Some("secret"), Some("secret")));
        assert!(!verify_callback_token(Some("secret"), Some("wrong")));
        assert!(!verify_callback_token(Some("secret"), None));
        assert!(!verify_callback_token(Some("secret"), Some("secret ")));
    }
}
