//! Notification collaborator
//!
//! Fire-and-forget hooks into the platform's notification/email module. The
//! billing core does not manage delivery or retries; a failed delivery is
//! logged and dropped. When no endpoint is configured the notifier runs in
//! log-only mode, which is also what tests use.

use serde::Serialize;
use uuid::Uuid;

/// Event names understood by the notification module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentSucceeded,
    TrialConverted,
    SubscriptionExpiring,
    SubscriptionExpired,
}

#[derive(Debug, Serialize)]
struct NotificationBody {
    kind: NotificationKind,
    tenant_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    days_remaining: Option<i64>,
}

/// Client for the notification collaborator.
#[derive(Clone)]
pub struct BillingNotifier {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl BillingNotifier {
    /// Read `NOTIFICATION_ENDPOINT`; absent means log-only mode.
    pub fn from_env() -> Self {
        let endpoint = std::env::var("NOTIFICATION_ENDPOINT").ok();
        if endpoint.is_none() {
            tracing::warn!("NOTIFICATION_ENDPOINT not set - notifications will only be logged");
        }
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    /// Log-only notifier for tests and minimal deployments.
    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: None,
        }
    }

    pub async fn payment_succeeded(&self, tenant_id: Uuid, amount: i64) {
        self.deliver(NotificationBody {
            kind: NotificationKind::PaymentSucceeded,
            tenant_id,
            amount: Some(amount),
            days_remaining: None,
        })
        .await;
    }

    pub async fn trial_converted(&self, tenant_id: Uuid) {
        self.deliver(NotificationBody {
            kind: NotificationKind::TrialConverted,
            tenant_id,
            amount: None,
            days_remaining: None,
        })
        .await;
    }

    pub async fn subscription_expiring(&self, tenant_id: Uuid, days_remaining: i64) {
        self.deliver(NotificationBody {
            kind: NotificationKind::SubscriptionExpiring,
            tenant_id,
            amount: None,
            days_remaining: Some(days_remaining),
        })
        .await;
    }

    pub async fn subscription_expired(&self, tenant_id: Uuid) {
        self.deliver(NotificationBody {
            kind: NotificationKind::SubscriptionExpired,
            tenant_id,
            amount: None,
            days_remaining: None,
        })
        .await;
    }

    async fn deliver(&self, body: NotificationBody) {
        tracing::info!(
            kind = ?body.kind,
            tenant_id = %body.tenant_id,
            "Billing notification"
        );

        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };

        // Fire and forget: delivery must never block or fail the caller.
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.post(&endpoint).json(&body).send().await {
                tracing::warn!(error = %e, "Notification delivery failed");
            }
        });
    }
}
