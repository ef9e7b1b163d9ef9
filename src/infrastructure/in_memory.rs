use crate::domain::payment::{AttemptRecord, NewPayment, Payment, PaymentId, PaymentStatus};
use crate::domain::plan::{NewPlan, OrderId, Plan, PlanId};
use crate::domain::ports::{PaymentStore, PlanStore, PlanTransaction, Settlement};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    plans: BTreeMap<PlanId, Plan>,
    payments: BTreeMap<PaymentId, Payment>,
}

#[derive(Default)]
struct Sequences {
    plan: AtomicU64,
    payment: AtomicU64,
}

impl Sequences {
    fn next_plan(&self) -> PlanId {
        self.plan.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_payment(&self) -> PaymentId {
        self.payment.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// A thread-safe in-memory store for plans and their payments.
///
/// Both tables sit behind one `RwLock` so a committed plan and its payments
/// become visible in a single step. Ids come from sequences that, like SQL
/// auto-increment columns, are not reused after a rollback.
#[derive(Default, Clone)]
pub struct InMemoryBillingStore {
    tables: Arc<RwLock<Tables>>,
    sequences: Arc<Sequences>,
}

impl InMemoryBillingStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn plan_count(&self) -> usize {
        self.tables.read().await.plans.len()
    }

    pub async fn payment_count(&self) -> usize {
        self.tables.read().await.payments.len()
    }
}

/// Rows staged by an uncommitted [`InMemoryBillingStore`] transaction.
pub struct InMemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    sequences: Arc<Sequences>,
    plans: Vec<Plan>,
    payments: Vec<Payment>,
}

#[async_trait]
impl PlanTransaction for InMemoryTransaction {
    async fn insert_plan(&mut self, plan: NewPlan) -> Result<Plan> {
        if plan.installments_count == 0 || !plan.total_amount.is_positive() {
            return Err(BillingError::Validation(format!(
                "Rejected plan row for order {}",
                plan.order_id
            )));
        }
        let plan = plan.into_plan(self.sequences.next_plan());
        self.plans.push(plan.clone());
        Ok(plan)
    }

    async fn insert_payment(&mut self, payment: NewPayment) -> Result<Payment> {
        let staged = self.plans.iter().any(|p| p.id == payment.plan_id);
        if !staged && !self.tables.read().await.plans.contains_key(&payment.plan_id) {
            return Err(BillingError::Storage(format!(
                "Payment references unknown plan {}",
                payment.plan_id
            )));
        }
        let payment = payment.into_payment(self.sequences.next_payment());
        self.payments.push(payment.clone());
        Ok(payment)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut tables = this.tables.write().await;

        for plan in &this.plans {
            if tables.plans.values().any(|p| p.order_id == plan.order_id) {
                return Err(BillingError::Storage(format!(
                    "A plan already exists for order {}",
                    plan.order_id
                )));
            }
        }

        for plan in this.plans {
            tables.plans.insert(plan.id, plan);
        }
        for payment in this.payments {
            tables.payments.insert(payment.id, payment);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PlanStore for InMemoryBillingStore {
    async fn begin(&self) -> Result<Box<dyn PlanTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            tables: self.tables.clone(),
            sequences: self.sequences.clone(),
            plans: Vec::new(),
            payments: Vec::new(),
        }))
    }

    async fn get(&self, plan_id: PlanId) -> Result<Option<Plan>> {
        let tables = self.tables.read().await;
        Ok(tables.plans.get(&plan_id).cloned())
    }

    async fn find_by_order(&self, order_id: OrderId) -> Result<Option<Plan>> {
        let tables = self.tables.read().await;
        Ok(tables
            .plans
            .values()
            .find(|p| p.order_id == order_id)
            .cloned())
    }
}

#[async_trait]
impl PaymentStore for InMemoryBillingStore {
    async fn get(&self, payment_id: PaymentId) -> Result<Option<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables.payments.get(&payment_id).cloned())
    }

    async fn list_for_plan(&self, plan_id: PlanId) -> Result<Vec<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .values()
            .filter(|p| p.plan_id == plan_id)
            .cloned()
            .collect())
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        after: Option<PaymentId>,
        limit: usize,
    ) -> Result<Vec<Payment>> {
        let tables = self.tables.read().await;
        let start = after.map_or(0, |id| id + 1);
        Ok(tables
            .payments
            .range(start..)
            .map(|(_, payment)| payment)
            .filter(|payment| payment.is_due(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim(
        &self,
        payment_id: PaymentId,
        expected_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<Payment>> {
        let mut tables = self.tables.write().await;
        let payment = tables
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", payment_id)))?;
        if !payment.is_due(now) || payment.attempts != expected_attempts {
            return Ok(None);
        }
        payment.status = PaymentStatus::Processing;
        payment.claimed_at = Some(now);
        Ok(Some(payment.clone()))
    }

    async fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let mut released = 0;
        for payment in tables.payments.values_mut() {
            if payment.status == PaymentStatus::Processing
                && payment.claimed_at.is_none_or(|at| at < claimed_before)
            {
                payment.status = PaymentStatus::Pending;
                payment.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn record_attempt(
        &self,
        payment_id: PaymentId,
        attempt: AttemptRecord,
    ) -> Result<Settlement> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;

        let payment = tables
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", payment_id)))?;
        payment.apply_attempt(&attempt);
        let payment = payment.clone();

        let siblings = tables
            .payments
            .values()
            .filter(|p| p.plan_id == payment.plan_id)
            .map(|p| p.status);
        let plan = tables.plans.get_mut(&payment.plan_id).map(|plan| {
            plan.status = plan.status.settle(payment.status, siblings);
            plan.clone()
        });

        Ok(Settlement { payment, plan })
    }
}
