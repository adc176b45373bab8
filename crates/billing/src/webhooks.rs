//! Payment webhook reconciliation
//!
//! Handles inbound provider notifications. Delivery is at-least-once and may
//! race the lazy poll path, so processing is a chain of defensive steps:
//! signature check, event classification with an explicit unrecognized
//! fallback, idempotent lookup by the provider's join key, and the
//! terminal-state gate in the orchestrator.
//!
//! Business no-ops (unknown transaction, already-terminal, unrecognized
//! event) are acknowledged as success so the provider stops retrying; only
//! the signature check and genuine processing failures surface as errors.

use std::sync::Arc;

use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use sekolah_shared::TransactionStatus;

use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::payments::{PaymentOrchestrator, ReconcileOutcome};

/// Raw provider payload shape. Providers vary in where they put the invoice
/// object, so both the nested and the flattened layout decode.
#[derive(Debug, Default, Deserialize)]
struct RawNotification {
    #[serde(default, alias = "event_type")]
    event: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    external_id: Option<String>,
    #[serde(default)]
    paid_at: Option<String>,
    #[serde(default)]
    failure_reason: Option<String>,
    #[serde(default, alias = "invoice")]
    data: Option<RawInvoice>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInvoice {
    #[serde(default)]
    external_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    paid_at: Option<String>,
    #[serde(default)]
    failure_reason: Option<String>,
}

/// Classified notification: the tagged union the rest of the handler works
/// with, never the raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    Paid {
        external_id: String,
        paid_at: Option<OffsetDateTime>,
    },
    Expired {
        external_id: String,
    },
    Failed {
        external_id: String,
        reason: Option<String>,
    },
    /// Event type we do not handle; logged and acknowledged.
    Unrecognized {
        event: String,
    },
}

/// Map a raw payload onto a known event variant.
///
/// The event name takes precedence; when absent, the invoice status field
/// decides. Anything else is `Unrecognized`.
fn classify(raw: &RawNotification) -> WebhookEvent {
    let invoice = raw.data.as_ref();

    let external_id = raw
        .external_id
        .clone()
        .or_else(|| invoice.and_then(|i| i.external_id.clone()));

    let label = raw
        .event
        .clone()
        .or_else(|| raw.status.clone())
        .or_else(|| invoice.and_then(|i| i.status.clone()))
        .unwrap_or_default();

    let paid_at = raw
        .paid_at
        .clone()
        .or_else(|| invoice.and_then(|i| i.paid_at.clone()))
        .and_then(|s| OffsetDateTime::parse(&s, &Rfc3339).ok());

    let failure_reason = raw
        .failure_reason
        .clone()
        .or_else(|| invoice.and_then(|i| i.failure_reason.clone()));

    let Some(external_id) = external_id else {
        return WebhookEvent::Unrecognized {
            event: format!("{label} (missing external_id)"),
        };
    };

    let normalized = label.to_ascii_lowercase();
    match normalized.as_str() {
        "paid" | "settled" | "succeeded" | "payment.paid" | "payment.succeeded"
        | "invoice.paid" => WebhookEvent::Paid {
            external_id,
            paid_at,
        },
        "expired" | "payment.expired" | "invoice.expired" => {
            WebhookEvent::Expired { external_id }
        }
        "failed" | "cancelled" | "payment.failed" | "invoice.failed" => WebhookEvent::Failed {
            external_id,
            reason: failure_reason,
        },
        _ => WebhookEvent::Unrecognized { event: label },
    }
}

/// Acknowledgment returned to the webhook endpoint. Both variants are a
/// success toward the provider; `Ignored` records that nothing changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    Processed,
    Ignored,
}

pub struct WebhookHandler {
    gateway: Arc<dyn PaymentGateway>,
    orchestrator: Arc<PaymentOrchestrator>,
}

impl WebhookHandler {
    pub fn new(gateway: Arc<dyn PaymentGateway>, orchestrator: Arc<PaymentOrchestrator>) -> Self {
        Self {
            gateway,
            orchestrator,
        }
    }

    /// Process one inbound notification.
    ///
    /// The signature check is a hard boundary: a bad token rejects the
    /// request before any payload inspection. Everything after that point
    /// prefers acknowledging a no-op over giving the provider a reason to
    /// retry.
    pub async fn handle_notification(
        &self,
        payload: &str,
        token: Option<&str>,
    ) -> BillingResult<WebhookAck> {
        if !self.gateway.verify_notification(token) {
            tracing::warn!("Webhook rejected: signature token mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let raw: RawNotification = match serde_json::from_str(payload) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "Webhook payload did not decode, ignoring");
                return Ok(WebhookAck::Ignored);
            }
        };

        let event = classify(&raw);
        tracing::info!(event = ?event, "Webhook notification classified");

        let (external_id, status, paid_at, failure_reason) = match event {
            WebhookEvent::Paid {
                external_id,
                paid_at,
            } => (external_id, TransactionStatus::Paid, paid_at, None),
            WebhookEvent::Expired { external_id } => {
                (external_id, TransactionStatus::Expired, None, None)
            }
            WebhookEvent::Failed {
                external_id,
                reason,
            } => (external_id, TransactionStatus::Failed, None, reason),
            WebhookEvent::Unrecognized { event } => {
                tracing::info!(event = %event, "Unrecognized webhook event, ignoring");
                return Ok(WebhookAck::Ignored);
            }
        };

        // Lookup is by the provider's join key only; a missing transaction
        // may be a stale or foreign notification and is not an error.
        let Some(txn) = self.orchestrator.find_by_external_id(&external_id).await? else {
            tracing::info!(
                external_id = %external_id,
                "Webhook for unknown transaction, ignoring"
            );
            return Ok(WebhookAck::Ignored);
        };

        match self
            .orchestrator
            .apply_terminal_status(txn.id, status, paid_at, failure_reason)
            .await?
        {
            ReconcileOutcome::Applied => Ok(WebhookAck::Processed),
            ReconcileOutcome::AlreadyTerminal => Ok(WebhookAck::Ignored),
        }
    }
}
