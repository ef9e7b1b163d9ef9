use crate::config::PlanPolicy;
use crate::domain::clock::Clock;
use crate::domain::money::Amount;
use crate::domain::payment::{NewPayment, PaymentStatus};
use crate::domain::plan::{CustomerId, NewPlan, OrderId, PlanId, PlanStatus};
use crate::domain::ports::{OrderJournal, PlanTransaction, SharedPlanStore};
use crate::domain::split::{Installment, split_installments};
use crate::error::{BillingError, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What [`PlanCreationService::create`] did with an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanCreation {
    Created(PlanId),
    /// The order already had a plan; nothing was written.
    Existing(PlanId),
    /// The total is under the policy minimum; the order is paid in full.
    BelowThreshold,
}

impl PlanCreation {
    pub fn plan_id(&self) -> Option<PlanId> {
        match self {
            PlanCreation::Created(id) | PlanCreation::Existing(id) => Some(*id),
            PlanCreation::BelowThreshold => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanCreation::Created(_) => "created",
            PlanCreation::Existing(_) => "existing",
            PlanCreation::BelowThreshold => "below_threshold",
        }
    }
}

/// Turns a checked-out order into a plan and its installment rows.
///
/// The plan and every payment are written in one store transaction: either all
/// rows become visible or none do.
pub struct PlanCreationService {
    plans: SharedPlanStore,
    journal: Arc<dyn OrderJournal>,
    clock: Arc<dyn Clock>,
    policy: PlanPolicy,
}

impl PlanCreationService {
    pub fn new(
        plans: SharedPlanStore,
        journal: Arc<dyn OrderJournal>,
        clock: Arc<dyn Clock>,
        policy: PlanPolicy,
    ) -> Self {
        Self {
            plans,
            journal,
            clock,
            policy,
        }
    }

    pub async fn create(
        &self,
        order_id: OrderId,
        customer_id: CustomerId,
        total_amount: Decimal,
    ) -> Result<PlanCreation> {
        if order_id == 0 {
            return Err(BillingError::Validation("Order id is missing".to_string()));
        }
        if customer_id == 0 {
            return Err(BillingError::Validation(format!(
                "Order {} has no customer",
                order_id
            )));
        }
        let total = Amount::positive(total_amount)?;

        if total < self.policy.min_total {
            debug!(order_id, %total, min_total = %self.policy.min_total, "Order below plan threshold");
            return Ok(PlanCreation::BelowThreshold);
        }

        if let Some(existing) = self.plans.find_by_order(order_id).await? {
            debug!(order_id, plan_id = existing.id, "Order already has a plan");
            return Ok(PlanCreation::Existing(existing.id));
        }

        let now = self.clock.now();
        let schedule = split_installments(
            total,
            self.policy.installments_count,
            self.policy.frequency_days,
            now,
        )?;

        // a single installment is collected at checkout, so nothing is left to charge
        let status = if schedule.iter().all(|i| i.status == PaymentStatus::Paid) {
            PlanStatus::Completed
        } else {
            PlanStatus::Active
        };
        let new_plan = NewPlan {
            order_id,
            customer_id,
            total_amount: total,
            installments_count: self.policy.installments_count,
            status,
            created_at: now,
        };

        let mut tx = self.plans.begin().await?;
        let plan_id = match Self::stage(tx.as_mut(), new_plan, &schedule).await {
            Ok(plan_id) => plan_id,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(order_id, error = %rollback_err, "Rollback failed");
                }
                warn!(order_id, error = %e, "Plan creation aborted");
                return Err(e);
            }
        };
        if let Err(e) = tx.commit().await {
            // lost a race with a concurrent hook for the same order
            if let Some(existing) = self.plans.find_by_order(order_id).await? {
                debug!(order_id, plan_id = existing.id, "Concurrent plan creation won");
                return Ok(PlanCreation::Existing(existing.id));
            }
            return Err(e);
        }

        info!(
            order_id,
            plan_id,
            installments = self.policy.installments_count,
            %total,
            "Payment plan created"
        );
        let note = format!(
            "Payment plan created: {} installments.",
            self.policy.installments_count
        );
        self.journal.add_note(order_id, &note).await;

        Ok(PlanCreation::Created(plan_id))
    }

    async fn stage(
        tx: &mut dyn PlanTransaction,
        new_plan: NewPlan,
        schedule: &[Installment],
    ) -> Result<PlanId> {
        let plan = tx.insert_plan(new_plan).await?;
        for installment in schedule {
            tx.insert_payment(NewPayment {
                plan_id: plan.id,
                amount: installment.amount,
                due_date: installment.due_date,
                status: installment.status,
            })
            .await?;
        }
        Ok(plan.id)
    }
}
