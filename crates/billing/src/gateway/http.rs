//! HTTP payment gateway
//!
//! Concrete adapter for a REST payment aggregator. The aggregator exposes a
//! single charge endpoint; QRIS, virtual-account and e-wallet payments are
//! selected by channel code. Every call carries a request timeout so a slow
//! provider can never wedge a request handler.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

use super::{CreatedPayment, PayableArtifact, PaymentGateway, PaymentMethod, PaymentRequest, ProviderStatus};

/// Gateway connection settings, loaded from the environment by the binaries.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    /// Shared secret echoed by the provider in webhook notifications.
    /// `None` disables signature verification (local development only).
    pub callback_token: Option<String>,
    pub timeout: Duration,
}

impl GatewayConfig {
    /// Read `GATEWAY_BASE_URL`, `GATEWAY_API_KEY`, `GATEWAY_CALLBACK_TOKEN`
    /// and optional `GATEWAY_TIMEOUT_SECS` (default 15).
    pub fn from_env() -> BillingResult<Self> {
        let base_url = std::env::var("GATEWAY_BASE_URL")
            .map_err(|_| BillingError::Gateway("GATEWAY_BASE_URL not set".into()))?;
        let api_key = std::env::var("GATEWAY_API_KEY")
            .map_err(|_| BillingError::Gateway("GATEWAY_API_KEY not set".into()))?;
        let callback_token = std::env::var("GATEWAY_CALLBACK_TOKEN").ok();
        let timeout_secs = std::env::var("GATEWAY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(15);

        if callback_token.is_none() {
            tracing::warn!("GATEWAY_CALLBACK_TOKEN not set - webhook signature verification disabled");
        }

        Ok(Self {
            base_url,
            api_key,
            callback_token,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Charge creation body sent to the aggregator.
#[derive(Debug, Serialize)]
struct ChargeBody<'a> {
    external_id: &'a str,
    amount: i64,
    channel: &'a str,
    description: &'a str,
    customer_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer_email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bank_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ewallet_channel: Option<&'a str>,
    expires_at: String,
}

/// Charge object returned by the aggregator on creation and status polls.
#[derive(Debug, Deserialize)]
struct ChargeResponse {
    #[serde(default)]
    id: Option<String>,
    status: String,
    #[serde(default)]
    qr_string: Option<String>,
    #[serde(default)]
    bank_code: Option<String>,
    #[serde(default)]
    account_number: Option<String>,
    #[serde(default)]
    ewallet_reference: Option<String>,
    #[serde(default)]
    payment_url: Option<String>,
    #[serde(default)]
    expires_at: Option<String>,
    #[serde(default)]
    paid_at: Option<String>,
    #[serde(default)]
    failure_reason: Option<String>,
}

/// REST adapter over the aggregator's charge API.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpPaymentGateway {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Gateway(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn channel_code(method: PaymentMethod) -> &'static str {
        match method {
            PaymentMethod::Qris => "QRIS",
            PaymentMethod::VirtualAccount => "VIRTUAL_ACCOUNT",
            PaymentMethod::Ewallet => "EWALLET",
        }
    }

    fn parse_timestamp(raw: Option<&str>) -> Option<OffsetDateTime> {
        raw.and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
    }

    /// Map a provider status string onto the adapter contract. Unknown
    /// strings are treated as still pending rather than failed, since the
    /// provider may add states we have not seen.
    fn map_status(charge: &ChargeResponse) -> ProviderStatus {
        match charge.status.to_ascii_uppercase().as_str() {
            "PAID" | "SETTLED" | "SUCCEEDED" => ProviderStatus::Paid {
                paid_at: Self::parse_timestamp(charge.paid_at.as_deref()),
            },
            "EXPIRED" => ProviderStatus::Expired,
            "FAILED" | "CANCELLED" => ProviderStatus::Failed {
                reason: charge.failure_reason.clone(),
            },
            "PENDING" | "ACTIVE" | "AWAITING_PAYMENT" => ProviderStatus::Pending,
            other => {
                tracing::warn!(provider_status = other, "Unknown provider status, treating as pending");
                ProviderStatus::Pending
            }
        }
    }

    fn artifact_from_charge(
        method: PaymentMethod,
        charge: &ChargeResponse,
    ) -> BillingResult<PayableArtifact> {
        match method {
            PaymentMethod::Qris => {
                let qr_payload = charge.qr_string.clone().ok_or_else(|| {
                    BillingError::Gateway("provider returned QRIS charge without qr_string".into())
                })?;
                Ok(PayableArtifact::Qris { qr_payload })
            }
            PaymentMethod::VirtualAccount => {
                let bank_code = charge.bank_code.clone().ok_or_else(|| {
                    BillingError::Gateway("provider returned VA charge without bank_code".into())
                })?;
                let account_number = charge.account_number.clone().ok_or_else(|| {
                    BillingError::Gateway(
                        "provider returned VA charge without account_number".into(),
                    )
                })?;
                Ok(PayableArtifact::VirtualAccount {
                    bank_code,
                    account_number,
                })
            }
            PaymentMethod::Ewallet => {
                let reference = charge.ewallet_reference.clone().ok_or_else(|| {
                    BillingError::Gateway(
                        "provider returned e-wallet charge without reference".into(),
                    )
                })?;
                Ok(PayableArtifact::Ewallet {
                    reference,
                    payment_url: charge.payment_url.clone(),
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl PaymentGateway for HttpPaymentGateway {
    fn provider_name(&self) -> &'static str {
        "http_aggregator"
    }

    async fn create_payment(&self, request: &PaymentRequest) -> BillingResult<CreatedPayment> {
        request.validate()?;

        let expires_at = request
            .expires_at
            .format(&Rfc3339)
            .map_err(|e| BillingError::Gateway(format!("invalid expiry timestamp: {e}")))?;

        let body = ChargeBody {
            external_id: &request.external_id,
            amount: request.amount,
            channel: Self::channel_code(request.method),
            description: &request.description,
            customer_name: &request.customer_name,
            customer_email: request.customer_email.as_deref(),
            bank_code: request.bank_code.as_deref(),
            ewallet_channel: request.ewallet_channel.as_deref(),
            expires_at,
        };

        let url = format!("{}/v1/charges", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(external_id = %request.external_id, error = %e, "Charge creation request failed");
                BillingError::Gateway(format!("charge creation failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            tracing::error!(
                external_id = %request.external_id,
                http_status = %status,
                provider_response = %detail,
                "Provider rejected charge creation"
            );
            return Err(BillingError::Gateway(format!(
                "provider rejected charge creation (HTTP {status})"
            )));
        }

        let charge: ChargeResponse = response.json().await.map_err(|e| {
            BillingError::Gateway(format!("invalid charge creation response: {e}"))
        })?;

        let artifact = Self::artifact_from_charge(request.method, &charge)?;
        let expires_at =
            Self::parse_timestamp(charge.expires_at.as_deref()).unwrap_or(request.expires_at);

        tracing::info!(
            external_id = %request.external_id,
            provider_reference = ?charge.id,
            method = %request.method,
            amount = request.amount,
            "Provider charge created"
        );

        Ok(CreatedPayment {
            provider_reference: charge.id,
            artifact,
            expires_at,
        })
    }

    async fn get_status(&self, external_id: &str) -> BillingResult<ProviderStatus> {
        let url = format!(
            "{}/v1/charges/{}",
            self.config.base_url.trim_end_matches('/'),
            external_id
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(external_id = %external_id, error = %e, "Status poll request failed");
                BillingError::Gateway(format!("status poll failed: {e}"))
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BillingError::NotFound(format!(
                "provider has no charge {external_id}"
            )));
        }

        let status = response.status();
        if !status.is_success() {
            return Err(BillingError::Gateway(format!(
                "status poll rejected (HTTP {status})"
            )));
        }

        let charge: ChargeResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("invalid status response: {e}")))?;

        Ok(Self::map_status(&charge))
    }

    fn configured_callback_token(&self) -> Option<&str> {
        self.config.callback_token.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn charge(status: &str) -> ChargeResponse {
        ChargeResponse {
            id: Some("chg_1".to_string()),
            status: status.to_string(),
            qr_string: None,
            bank_code: None,
            account_number: None,
            ewallet_reference: None,
            payment_url: None,
            expires_at: None,
            paid_at: Some("2026-01-15T08:30:00Z".to_string()),
            failure_reason: None,
        }
    }

    #[test]
    fn provider_status_mapping() {
        assert!(matches!(
            HttpPaymentGateway::map_status(&charge("PAID")),
            ProviderStatus::Paid { paid_at: Some(_) }
        ));
        assert_eq!(
            HttpPaymentGateway::map_status(&charge("EXPIRED")),
            ProviderStatus::Expired
        );
        assert!(matches!(
            HttpPaymentGateway::map_status(&charge("FAILED")),
            ProviderStatus::Failed { .. }
        ));
        assert_eq!(
            HttpPaymentGateway::map_status(&charge("PENDING")),
            ProviderStatus::Pending
        );
        // Unknown statuses stay pending instead of failing the transaction.
        assert_eq!(
            HttpPaymentGateway::map_status(&charge("SOMETHING_NEW")),
            ProviderStatus::Pending
        );
    }

    #[test]
    fn status_mapping_is_case_insensitive() {
        assert!(matches!(
            HttpPaymentGateway::map_status(&charge("paid")),
            ProviderStatus::Paid { .. }
        ));
    }

    #[test]
    fn artifact_requires_method_fields() {
        let mut c = charge("PENDING");
        // QRIS charge without a QR payload is a provider contract violation.
        let err = HttpPaymentGateway::artifact_from_charge(PaymentMethod::Qris, &c);
        assert!(matches!(err, Err(BillingError::Gateway(_))));

        c.qr_string = Some("00020101021226...".to_string());
        let artifact = HttpPaymentGateway::artifact_from_charge(PaymentMethod::Qris, &c).unwrap();
        assert!(matches!(artifact, PayableArtifact::Qris { .. }));
    }

    #[test]
    fn channel_codes() {
        assert_eq!(HttpPaymentGateway::channel_code(PaymentMethod::Qris), "QRIS");
        assert_eq!(
            HttpPaymentGateway::channel_code(PaymentMethod::VirtualAccount),
            "VIRTUAL_ACCOUNT"
        );
        assert_eq!(
            HttpPaymentGateway::channel_code(PaymentMethod::Ewallet),
            "EWALLET"
        );
    }
}
