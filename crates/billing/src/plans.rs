//! Plan catalog
//!
//! Static reference data managed by platform administrators and read-only to
//! the ledger. Editing a plan never rewrites billing history that was issued
//! under the old price; history rows carry the amounts they were billed at.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::{BillingError, BillingResult};

/// A subscription plan as stored in `subscription_plans`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionPlan {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Smallest currency unit per student per year.
    pub price_per_student_per_year: i64,
    /// Student-count delta that triggers an incremental charge. 0 disables
    /// threshold billing for the plan.
    pub billing_threshold: i32,
    pub is_free: bool,
    pub is_active: bool,
    pub display_order: i32,
}

/// Admin input for creating or updating a plan.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanInput {
    pub name: String,
    pub description: Option<String>,
    pub price_per_student_per_year: i64,
    pub billing_threshold: i32,
    #[serde(default)]
    pub is_free: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub display_order: i32,
}

fn default_true() -> bool {
    true
}

impl PlanInput {
    fn validate(&self) -> BillingResult<()> {
        if self.name.trim().is_empty() {
            return Err(BillingError::Validation("plan name is required".into()));
        }
        if self.price_per_student_per_year < 0 {
            return Err(BillingError::Validation(
                "price_per_student_per_year must be non-negative".into(),
            ));
        }
        if self.billing_threshold < 0 {
            return Err(BillingError::Validation(
                "billing_threshold must be non-negative".into(),
            ));
        }
        if self.is_free && self.price_per_student_per_year != 0 {
            return Err(BillingError::Validation(
                "a free plan must have a zero price".into(),
            ));
        }
        Ok(())
    }
}

/// CRUD over the plan catalog.
pub struct PlanService {
    pool: PgPool,
}

impl PlanService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_plan(&self, input: PlanInput) -> BillingResult<SubscriptionPlan> {
        input.validate()?;

        let plan: SubscriptionPlan = sqlx::query_as(
            r#"
            INSERT INTO subscription_plans
                (name, description, price_per_student_per_year, billing_threshold,
                 is_free, is_active, display_order)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, name, description, price_per_student_per_year,
                      billing_threshold, is_free, is_active, display_order
            "#,
        )
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.price_per_student_per_year)
        .bind(input.billing_threshold)
        .bind(input.is_free)
        .bind(input.is_active)
        .bind(input.display_order)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(plan_id = plan.id, name = %plan.name, "Subscription plan created");
        Ok(plan)
    }

    /// Administrative edit. Does not retroactively alter already-issued
    /// billing history; only future calculations see the new values.
    pub async fn update_plan(&self, plan_id: i64, input: PlanInput) -> BillingResult<SubscriptionPlan> {
        input.validate()?;

        let plan: Option<SubscriptionPlan> = sqlx::query_as(
            r#"
            UPDATE subscription_plans
            SET name = $2,
                description = $3,
                price_per_student_per_year = $4,
                billing_threshold = $5,
                is_free = $6,
                is_active = $7,
                display_order = $8,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, description, price_per_student_per_year,
                      billing_threshold, is_free, is_active, display_order
            "#,
        )
        .bind(plan_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.price_per_student_per_year)
        .bind(input.billing_threshold)
        .bind(input.is_free)
        .bind(input.is_active)
        .bind(input.display_order)
        .fetch_optional(&self.pool)
        .await?;

        let plan = plan.ok_or_else(|| BillingError::NotFound(format!("plan {plan_id}")))?;
        tracing::info!(plan_id = plan.id, "Subscription plan updated");
        Ok(plan)
    }

    pub async fn get_plan(&self, plan_id: i64) -> BillingResult<SubscriptionPlan> {
        let plan: Option<SubscriptionPlan> = sqlx::query_as(
            r#"
            SELECT id, name, description, price_per_student_per_year,
                   billing_threshold, is_free, is_active, display_order
            FROM subscription_plans
            WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or_else(|| BillingError::NotFound(format!("plan {plan_id}")))
    }

    /// Active plans in display order, for plan-selection surfaces.
    pub async fn list_active_plans(&self) -> BillingResult<Vec<SubscriptionPlan>> {
        let plans: Vec<SubscriptionPlan> = sqlx::query_as(
            r#"
            SELECT id, name, description, price_per_student_per_year,
                   billing_threshold, is_free, is_active, display_order
            FROM subscription_plans
            WHERE is_active = TRUE
            ORDER BY display_order, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(plans)
    }

    /// All plans including retired ones, for the admin catalog view.
    pub async fn list_all_plans(&self) -> BillingResult<Vec<SubscriptionPlan>> {
        let plans: Vec<SubscriptionPlan> = sqlx::query_as(
            r#"
            SELECT id, name, description, price_per_student_per_year,
                   billing_threshold, is_free, is_active, display_order
            FROM subscription_plans
            ORDER BY display_order, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> PlanInput {
        PlanInput {
            name: "Standard".to_string(),
            description: None,
            price_per_student_per_year: 100_000,
            billing_threshold: 10,
            is_free: false,
            is_active: true,
            display_order: 1,
        }
    }

    #[test]
    fn valid_input_passes() {
        assert!(input().validate().is_ok());
    }

    #[test]
    fn blank_name_rejected() {
        let mut i = input();
        i.name = "  ".to_string();
        assert!(matches!(i.validate(), Err(BillingError::Validation(_))));
    }

    #[test]
    fn negative_price_rejected() {
        let mut i = input();
        i.price_per_student_per_year = -1;
        assert!(matches!(i.validate(), Err(BillingError::Validation(_))));
    }

    #[test]
    fn free_plan_with_price_rejected() {
        let mut i = input();
        i.is_free = true;
        assert!(matches!(i.validate(), Err(BillingError::Validation(_))));
    }

    #[test]
    fn free_plan_with_zero_price_allowed() {
        let mut i = input();
        i.is_free = true;
        i.price_per_student_per_year = 0;
        assert!(i.validate().is_ok());
    }
}
