//! Lifecycle enums shared across crates.
//!
//! All three enums round-trip through their lowercase database
//! representation; unknown strings are rejected rather than defaulted so a
//! bad row surfaces loudly instead of silently changing meaning.

use serde::{Deserialize, Serialize};

/// Subscription lifecycle state.
///
/// Transitions are enforced by the ledger, not here; this type only knows
/// which states exist, which are terminal, and which count as "occupying"
/// the single-active-subscription slot for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Suspended,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// Cancelled is the only state with no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled)
    }

    /// Whether a subscription in this state blocks creation of another one
    /// for the same tenant.
    pub fn occupies_tenant_slot(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }

    /// Valid transition table for the ledger state machine.
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        match (self, next) {
            // Trial converts or is cancelled outright.
            (Trial, Active) | (Trial, Cancelled) => true,
            // Active can be suspended, cancelled, or lapse.
            (Active, Suspended) | (Active, Cancelled) | (Active, Expired) => true,
            // Suspended recovers after payment or is cancelled.
            (Suspended, Active) | (Suspended, Cancelled) => true,
            // Expired subscriptions can be revived by payment.
            (Expired, Active) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing cycle of a subscription. Pricing is per student per year, so
/// monthly cycles simply bill the annual amount across shorter periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment transaction state.
///
/// A transaction is created `Pending` and moves exactly once to one of the
/// terminal states. Terminal states are final; reconciliation treats "already
/// terminal" as its sole idempotency gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Paid,
    Expired,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Paid => "paid",
            TransactionStatus::Expired => "expired",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
