use super::money::Amount;
use super::plan::PlanId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type PaymentId = u64;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    /// Claimed by a scheduler run that is charging it right now.
    Processing,
    Paid,
    FailedFinal,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Paid => "paid",
            PaymentStatus::FailedFinal => "failed_final",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled installment of a [`Plan`](super::plan::Plan).
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Payment {
    pub id: PaymentId,
    pub plan_id: PlanId,
    /// Empty until a charge attempt returned a provider id.
    pub provider_reference_id: String,
    pub amount: Amount,
    pub due_date: DateTime<Utc>,
    pub status: PaymentStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Pending && self.due_date <= now
    }

    /// Applies the result of one charge attempt together with its resolution.
    /// Releases the claim.
    pub fn apply_attempt(&mut self, attempt: &AttemptRecord) {
        match attempt.resolution {
            Resolution::Paid => self.status = PaymentStatus::Paid,
            Resolution::RetryAt(due_date) => {
                self.status = PaymentStatus::Pending;
                self.due_date = due_date;
            }
            Resolution::FailedFinal => self.status = PaymentStatus::FailedFinal,
        }
        self.attempts += 1;
        if let Some(reference) = attempt.provider_reference_id.as_deref()
            && !reference.is_empty()
        {
            self.provider_reference_id = reference.to_string();
        }
        if let Some(error) = &attempt.error {
            self.last_error = Some(error.clone());
        }
        self.claimed_at = None;
    }
}

/// Payment row as staged in a transaction, before the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub plan_id: PlanId,
    pub amount: Amount,
    pub due_date: DateTime<Utc>,
    pub status: PaymentStatus,
}

impl NewPayment {
    pub fn into_payment(self, id: PaymentId) -> Payment {
        Payment {
            id,
            plan_id: self.plan_id,
            provider_reference_id: String::new(),
            amount: self.amount,
            due_date: self.due_date,
            status: self.status,
            attempts: 0,
            last_error: None,
            claimed_at: None,
        }
    }
}

/// Where a payment goes once an attempt has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Paid,
    /// Declined with retries left: back to `pending`, due again at this date.
    RetryAt(DateTime<Utc>),
    /// Declined with no retries left. The plan goes into breach.
    FailedFinal,
}

/// Outcome of a single charge attempt, as persisted on the payment.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub provider_reference_id: Option<String>,
    pub error: Option<String>,
    pub resolution: Resolution,
}

impl AttemptRecord {
    pub fn paid(provider_reference_id: impl Into<String>) -> Self {
        Self {
            provider_reference_id: Some(provider_reference_id.into()),
            error: None,
            resolution: Resolution::Paid,
        }
    }

    pub fn retry(
        provider_reference_id: Option<String>,
        error: impl Into<String>,
        due_date: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_reference_id,
            error: Some(error.into()),
            resolution: Resolution::RetryAt(due_date),
        }
    }

    pub fn abandoned(provider_reference_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            provider_reference_id,
            error: Some(error.into()),
            resolution: Resolution::FailedFinal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn pending_payment() -> Payment {
        NewPayment {
            plan_id: 1,
            amount: Amount::new(dec!(33.33)),
            due_date: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            status: PaymentStatus::Pending,
        }
        .into_payment(7)
    }

    #[test]
    fn test_is_due() {
        let payment = pending_payment();
        assert!(payment.is_due(payment.due_date));
        assert!(payment.is_due(payment.due_date + Duration::hours(1)));
        assert!(!payment.is_due(payment.due_date - Duration::seconds(1)));

        let mut paid = payment.clone();
        paid.status = PaymentStatus::Paid;
        assert!(!paid.is_due(paid.due_date));
    }

    #[test]
    fn test_apply_retry_reschedules_and_keeps_previous_reference() {
        let mut payment = pending_payment();
        let retry_at = payment.due_date + Duration::days(3);
        payment.status = PaymentStatus::Processing;
        payment.apply_attempt(&AttemptRecord::retry(
            Some("pi_1".to_string()),
            "insufficient_funds",
            retry_at,
        ));
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.due_date, retry_at);
        assert_eq!(payment.attempts, 1);
        assert_eq!(payment.provider_reference_id, "pi_1");

        payment.apply_attempt(&AttemptRecord::abandoned(None, "charge timed out"));
        assert_eq!(payment.status, PaymentStatus::FailedFinal);
        assert_eq!(payment.due_date, retry_at);
        assert_eq!(payment.attempts, 2);
        assert_eq!(payment.provider_reference_id, "pi_1");
        assert_eq!(payment.last_error.as_deref(), Some("charge timed out"));
    }

    #[test]
    fn test_apply_paid_attempt() {
        let mut payment = pending_payment();
        payment.status = PaymentStatus::Processing;
        payment.claimed_at = Some(payment.due_date);
        payment.apply_attempt(&AttemptRecord::paid("pi_ok"));
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(payment.attempts, 1);
        assert!(payment.last_error.is_none());
        assert!(payment.claimed_at.is_none());
    }
}
