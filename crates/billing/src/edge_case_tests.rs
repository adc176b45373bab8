#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Boundary-condition tests for the billing crate.
//!
//! Covers:
//! - Threshold billing sequences (BILL-T01 to BILL-T05)
//! - Subscription state machine (BILL-S01 to BILL-S04)
//! - Webhook handling (BILL-W01 to BILL-W04)

mod threshold_sequence_tests {
    use crate::calculator::evaluate_count_update;
    use crate::plans::SubscriptionPlan;

    fn plan() -> SubscriptionPlan {
        SubscriptionPlan {
            id: 1,
            name: "Standard".to_string(),
            description: None,
            price_per_student_per_year: 100_000,
            billing_threshold: 10,
            is_free: false,
            is_active: true,
            display_order: 0,
        }
    }

    // =========================================================================
    // BILL-T01: Gradual growth 50 -> 55 -> 59 -> 61 - single charge at the end
    // =========================================================================
    #[test]
    fn test_gradual_growth_charges_once_at_crossing() {
        let p = plan();
        let at_billing = 50;

        let step1 = evaluate_count_update(at_billing, 55, &p);
        assert_eq!(step1.threshold_charge, None);
        assert_eq!(step1.pending_increase, 5);

        let step2 = evaluate_count_update(at_billing, 59, &p);
        assert_eq!(step2.threshold_charge, None);
        assert_eq!(step2.pending_increase, 9);

        let step3 = evaluate_count_update(at_billing, 61, &p);
        assert_eq!(step3.threshold_charge, Some(6_100_000));
        assert_eq!(step3.pending_increase, 0);
    }

    // =========================================================================
    // BILL-T02: After a charge the baseline moves - pending restarts from 0
    // =========================================================================
    #[test]
    fn test_baseline_moves_after_charge() {
        let p = plan();

        let charged = evaluate_count_update(50, 61, &p);
        assert!(charged.threshold_charge.is_some());

        // Next update is measured against the new baseline of 61.
        let after = evaluate_count_update(charged.new_student_count, 65, &p);
        assert_eq!(after.pending_increase, 4);
        assert_eq!(after.threshold_charge, None);
    }

    // =========================================================================
    // BILL-T03: Oscillation around the baseline never accumulates
    // =========================================================================
    #[test]
    fn test_oscillating_count_never_charges() {
        let p = plan();
        for count in [55, 48, 52, 45, 59, 50] {
            let update = evaluate_count_update(50, count, &p);
            assert_eq!(update.threshold_charge, None, "count {count} must not charge");
        }
    }

    // =========================================================================
    // BILL-T04: Huge single jump - one charge for the full new count
    // =========================================================================
    #[test]
    fn test_large_jump_single_full_charge() {
        let p = plan();
        let update = evaluate_count_update(50, 500, &p);
        assert_eq!(update.threshold_charge, Some(50_000_000));
        assert_eq!(update.pending_increase, 0);
        assert_eq!(update.next_billing_amount, 50_000_000);
    }

    // =========================================================================
    // BILL-T05: Shrink below baseline then grow back - threshold measured
    // against the old baseline, not the trough
    // =========================================================================
    #[test]
    fn test_shrink_then_grow_uses_original_baseline() {
        let p = plan();

        let shrunk = evaluate_count_update(50, 40, &p);
        assert_eq!(shrunk.pending_increase, 0);

        // Growing back to 58 is only +8 over the billing baseline of 50.
        let grown = evaluate_count_update(50, 58, &p);
        assert_eq!(grown.pending_increase, 8);
        assert_eq!(grown.threshold_charge, None);

        let crossed = evaluate_count_update(50, 60, &p);
        assert_eq!(crossed.threshold_charge, Some(6_000_000));
    }
}

mod state_machine_tests {
    use sekolah_shared::SubscriptionStatus;

    // =========================================================================
    // BILL-S01: Cancelled is the only terminal state
    // =========================================================================
    #[test]
    fn test_cancelled_is_terminal() {
        for status in [
            SubscriptionStatus::Trial,
            SubscriptionStatus::Active,
            SubscriptionStatus::Suspended,
            SubscriptionStatus::Expired,
        ] {
            assert!(!status.is_terminal(), "{status:?} must not be terminal");
        }
        assert!(SubscriptionStatus::Cancelled.is_terminal());
        for target in [
            SubscriptionStatus::Trial,
            SubscriptionStatus::Active,
            SubscriptionStatus::Suspended,
            SubscriptionStatus::Expired,
        ] {
            assert!(!SubscriptionStatus::Cancelled.can_transition_to(target));
        }
    }

    // =========================================================================
    // BILL-S02: The transition table allows recovery into ACTIVE from both
    // SUSPENDED and EXPIRED (settlement gates the expired path on the
    // period still being open)
    // =========================================================================
    #[test]
    fn test_payment_recovery_paths() {
        assert!(SubscriptionStatus::Suspended.can_transition_to(SubscriptionStatus::Active));
        assert!(SubscriptionStatus::Expired.can_transition_to(SubscriptionStatus::Active));
    }

    // =========================================================================
    // BILL-S03: No path back into trial
    // =========================================================================
    #[test]
    fn test_trial_is_entry_only() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Suspended,
            SubscriptionStatus::Expired,
            SubscriptionStatus::Cancelled,
        ] {
            assert!(!status.can_transition_to(SubscriptionStatus::Trial));
        }
    }

    // =========================================================================
    // BILL-S04: Only active subscriptions hold the per-tenant slot
    // =========================================================================
    #[test]
    fn test_only_active_occupies_slot() {
        assert!(SubscriptionStatus::Active.occupies_tenant_slot());
        for status in [
            SubscriptionStatus::Trial,
            SubscriptionStatus::Suspended,
            SubscriptionStatus::Expired,
            SubscriptionStatus::Cancelled,
        ] {
            assert!(!status.occupies_tenant_slot());
        }
    }
}

mod webhook_tests {
    use std::sync::Arc;

    use crate::error::BillingError;
    use crate::gateway::mock::MockGateway;
    use crate::notifications::BillingNotifier;
    use crate::payments::PaymentOrchestrator;
    use crate::subscriptions::SubscriptionLedger;
    use crate::webhooks::{WebhookAck, WebhookHandler};

    // A lazy pool never connects; fine for paths that stop before the DB.
    fn handler(gateway: MockGateway) -> WebhookHandler {
        let pool = sqlx::PgPool::connect_lazy("postgres://unused@localhost/unused").unwrap();
        let gateway: Arc<dyn crate::gateway::PaymentGateway> = Arc::new(gateway);
        let ledger = Arc::new(SubscriptionLedger::new(pool.clone()));
        let orchestrator = Arc::new(PaymentOrchestrator::new(
            pool,
            gateway.clone(),
            ledger,
            BillingNotifier::disabled(),
        ));
        WebhookHandler::new(gateway, orchestrator)
    }

    // =========================================================================
    // BILL-W01: Bad signature token rejects before payload inspection
    // =========================================================================
    #[tokio::test]
    async fn test_bad_token_rejected() {
        let handler = handler(MockGateway {
            callback_token: Some("cb-secret".to_string()),
            ..MockGateway::new()
        });

        let result = handler
            .handle_notification("this is not even json", Some("wrong"))
            .await;
        assert!(matches!(
            result,
            Err(BillingError::WebhookSignatureInvalid)
        ));

        let result = handler.handle_notification("{}", None).await;
        assert!(matches!(
            result,
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    // =========================================================================
    // BILL-W02: Malformed payload is acknowledged, not retried forever
    // =========================================================================
    #[tokio::test]
    async fn test_malformed_payload_ignored() {
        let handler = handler(MockGateway::new());
        let ack = handler
            .handle_notification("{not json", None)
            .await
            .unwrap();
        assert_eq!(ack, WebhookAck::Ignored);
    }

    // =========================================================================
    // BILL-W03: Unrecognized event types are acknowledged as no-ops
    // =========================================================================
    #[tokio::test]
    async fn test_unrecognized_event_ignored() {
        let handler = handler(MockGateway::new());
        let ack = handler
            .handle_notification(
                r#"{"event": "payment.refunded", "external_id": "PAY-abc"}"#,
                None,
            )
            .await
            .unwrap();
        assert_eq!(ack, WebhookAck::Ignored);
    }

    // =========================================================================
    // BILL-W04: Correct token passes the signature gate
    // =========================================================================
    #[tokio::test]
    async fn test_correct_token_reaches_classification() {
        let handler = handler(MockGateway {
            callback_token: Some("cb-secret".to_string()),
            ..MockGateway::new()
        });

        // Unrecognized event so the handler stops before the DB lookup.
        let ack = handler
            .handle_notification(r#"{"event": "ping"}"#, Some("cb-secret"))
            .await
            .unwrap();
        assert_eq!(ack, WebhookAck::Ignored);
    }
}
