use super::money::Amount;
use super::payment::{AttemptRecord, NewPayment, Payment, PaymentId};
use super::plan::{CustomerId, NewPlan, OrderId, Plan, PlanId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A unit of work that creates a plan together with its payments.
///
/// Nothing staged becomes visible until [`commit`](PlanTransaction::commit)
/// succeeds. Dropping the transaction without committing discards it.
#[async_trait]
pub trait PlanTransaction: Send {
    async fn insert_plan(&mut self, plan: NewPlan) -> Result<Plan>;
    async fn insert_payment(&mut self, payment: NewPayment) -> Result<Payment>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn PlanTransaction>>;
    async fn get(&self, plan_id: PlanId) -> Result<Option<Plan>>;
    async fn find_by_order(&self, order_id: OrderId) -> Result<Option<Plan>>;
}

/// Rows as they stand right after [`PaymentStore::record_attempt`].
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub payment: Payment,
    /// `None` when the plan row has disappeared.
    pub plan: Option<Plan>,
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn get(&self, payment_id: PaymentId) -> Result<Option<Payment>>;
    async fn list_for_plan(&self, plan_id: PlanId) -> Result<Vec<Payment>>;

    /// Pending payments due at or before `now` with id greater than `after`,
    /// ordered by id, at most `limit` of them.
    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        after: Option<PaymentId>,
        limit: usize,
    ) -> Result<Vec<Payment>>;

    /// Atomically moves a payment from `pending` to `processing`.
    ///
    /// The swap only happens while the payment is still due at `now` and still
    /// has `expected_attempts` attempts, i.e. nobody charged it since it was
    /// fetched. Returns the claimed row, or `None` when another run got there first.
    async fn claim(
        &self,
        payment_id: PaymentId,
        expected_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<Payment>>;

    /// Returns `processing` payments claimed before `claimed_before` to `pending`.
    async fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64>;

    /// Persists a charge attempt and its resolution in one write.
    ///
    /// The same write moves the owning plan to `breach` when the payment is
    /// abandoned, or to `completed` once every payment of an active plan is paid.
    async fn record_attempt(
        &self,
        payment_id: PaymentId,
        attempt: AttemptRecord,
    ) -> Result<Settlement>;
}

pub type SharedPlanStore = Arc<dyn PlanStore>;
pub type SharedPaymentStore = Arc<dyn PaymentStore>;

/// A single off-session charge.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeRequest {
    pub amount: Amount,
    pub customer_ref: String,
    /// Stable per attempt, so a resent request cannot charge twice.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeOutcome {
    pub success: bool,
    pub provider_ref: String,
    pub error: Option<String>,
}

impl ChargeOutcome {
    pub fn succeeded(provider_ref: impl Into<String>) -> Self {
        Self {
            success: true,
            provider_ref: provider_ref.into(),
            error: None,
        }
    }

    pub fn declined(provider_ref: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            provider_ref: provider_ref.into(),
            error: Some(error.into()),
        }
    }
}

/// External payment processor.
///
/// A decline is a successful call returning `success == false`; `Err` is reserved
/// for the processor being unreachable or answering nonsense.
#[async_trait]
pub trait ChargeProcessor: Send + Sync {
    fn name(&self) -> &'static str;
    async fn charge(&self, request: ChargeRequest) -> Result<ChargeOutcome>;
}

/// Everything a downstream system needs to chase an abandoned installment.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalFailure {
    pub payment: Payment,
    pub plan: Plan,
}

/// Receives permanent payment failures. Must not block the caller.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn payment_failed_final(&self, failure: FinalFailure);
}

/// Looks up customer contact details in the host system.
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn email(&self, customer_id: CustomerId) -> Option<String>;
}

/// Audit trail on the host order.
#[async_trait]
pub trait OrderJournal: Send + Sync {
    async fn add_note(&self, order_id: OrderId, note: &str);
}
