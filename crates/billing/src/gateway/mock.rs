//! In-memory gateway mock for tests.
//!
//! Records every call and returns scripted responses, so orchestrator and
//! webhook tests can assert on provider interaction without a network.

use std::sync::Mutex;

use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

use super::{CreatedPayment, PayableArtifact, PaymentGateway, PaymentRequest, ProviderStatus};

#[derive(Default)]
pub struct MockGateway {
    pub callback_token: Option<String>,
    /// Scripted poll responses keyed by external_id.
    pub statuses: Mutex<std::collections::HashMap<String, ProviderStatus>>,
    /// Every create_payment request seen, in order.
    pub created: Mutex<Vec<PaymentRequest>>,
    /// When set, create_payment fails without recording an artifact.
    pub fail_creation: bool,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(self, external_id: &str, status: ProviderStatus) -> Self {
        self.statuses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(external_id.to_string(), status);
        self
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait::async_trait]
impl PaymentGateway for MockGateway {
    fn provider_name(&self) -> &'static str {
        "mock"
    }

    async fn create_payment(&self, request: &PaymentRequest) -> BillingResult<CreatedPayment> {
        request.validate()?;

        if self.fail_creation {
            return Err(BillingError::Gateway("mock provider unavailable".into()));
        }

        self.created
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());

        let artifact = match request.method {
            super::PaymentMethod::Qris => PayableArtifact::Qris {
                qr_payload: format!("QR:{}", request.external_id),
            },
            super::PaymentMethod::VirtualAccount => PayableArtifact::VirtualAccount {
                bank_code: request.bank_code.clone().unwrap_or_default(),
                account_number: format!("8808{}", request.amount % 1_000_000),
            },
            super::PaymentMethod::Ewallet => PayableArtifact::Ewallet {
                reference: format!("EW-{}", request.external_id),
                payment_url: Some(format!("https://pay.example/{}", request.external_id)),
            },
        };

        Ok(CreatedPayment {
            provider_reference: Some(format!("chg_{}", request.external_id)),
            artifact,
            expires_at: request.expires_at,
        })
    }

    async fn get_status(&self, external_id: &str) -> BillingResult<ProviderStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(external_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("provider has no charge {external_id}")))
    }

    fn configured_callback_token(&self) -> Option<&str> {
        self.callback_token.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PaymentMethod;
    use time::macros::datetime;

    fn request() -> PaymentRequest {
        PaymentRequest {
            method: PaymentMethod::Qris,
            amount: 1_000_000,
            external_id: "PAY-test".to_string(),
            description: "test".to_string(),
            customer_name: "tenant".to_string(),
            customer_email: None,
            bank_code: None,
            ewallet_channel: None,
            expires_at: datetime!(2026-02-01 0:00 UTC),
        }
    }

    #[tokio::test]
    async fn failing_mock_never_records_a_charge() {
        let gateway = MockGateway {
            fail_creation: true,
            ..MockGateway::new()
        };
        let err = gateway.create_payment(&request()).await;
        assert!(matches!(err, Err(BillingError::Gateway(_))));
        assert_eq!(gateway.created_count(), 0);
    }

    #[tokio::test]
    async fn scripted_status_is_returned() {
        let gateway = MockGateway::new().with_status(
            "PAY-test",
            ProviderStatus::Paid {
                paid_at: Some(datetime!(2026-01-15 8:30 UTC)),
            },
        );
        let status = gateway.get_status("PAY-test").await.unwrap();
        assert!(matches!(status, ProviderStatus::Paid { .. }));

        let missing = gateway.get_status("PAY-other").await;
        assert!(matches!(missing, Err(BillingError::NotFound(_))));
    }

    #[tokio::test]
    async fn token_verification_uses_configured_token() {
        let gateway = MockGateway {
            callback_token: Some("cb-secret".to_string()),
            ..MockGateway::new()
        };
        assert!(gateway.verify_notification(Some("cb-secret")));
        assert!(!gateway.verify_notification(Some("nope")));
        assert!(!gateway.verify_notification(None));
    }
}
