use super::money::Amount;
use super::payment::PaymentStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type PlanId = u64;
pub type OrderId = u64;
pub type CustomerId = u64;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    #[default]
    Active,
    /// Every installment has been collected.
    Completed,
    /// An installment exhausted its retries. Terminal.
    Breach,
}

impl PlanStatus {
    /// `completed` and `breach` are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Breach)
    }

    /// Status the plan moves to once a payment reached `payment_status`, given
    /// the statuses of all of the plan's payments after that write.
    pub fn settle<I>(self, payment_status: PaymentStatus, all: I) -> PlanStatus
    where
        I: IntoIterator<Item = PaymentStatus>,
    {
        if self.is_terminal() {
            return self;
        }
        match payment_status {
            PaymentStatus::FailedFinal => PlanStatus::Breach,
            PaymentStatus::Paid if all.into_iter().all(|s| s == PaymentStatus::Paid) => {
                PlanStatus::Completed
            }
            _ => self,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Active => "active",
            PlanStatus::Completed => "completed",
            PlanStatus::Breach => "breach",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A customer's agreement to pay an order total across several scheduled charges.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Plan {
    pub id: PlanId,
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub total_amount: Amount,
    pub installments_count: u32,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

/// Plan row as staged in a transaction, before the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPlan {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub total_amount: Amount,
    pub installments_count: u32,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

impl NewPlan {
    pub fn into_plan(self, id: PlanId) -> Plan {
        Plan {
            id,
            order_id: self.order_id,
            customer_id: self.customer_id,
            total_amount: self.total_amount,
            installments_count: self.installments_count,
            status: self.status,
            created_at: self.created_at,
        }
    }
}
