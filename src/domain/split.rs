use super::money::Amount;
use super::payment::PaymentStatus;
use crate::error::{BillingError, Result};
use chrono::{DateTime, Duration, Utc};

pub const DEFAULT_FREQUENCY_DAYS: u32 = 30;

/// One entry of a computed installment schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct Installment {
    pub amount: Amount,
    pub due_date: DateTime<Utc>,
    pub status: PaymentStatus,
}

/// Splits `total` into `count` installments spaced `frequency_days` apart.
///
/// Works in integer cents: every installment gets `total / count` cents and the
/// first `total % count` installments get one extra cent, so the amounts always
/// add back up to `total` exactly. Installment 0 is due `now` and is already
/// `paid` (collected at checkout); the rest start `pending`.
pub fn split_installments(
    total: Amount,
    count: u32,
    frequency_days: u32,
    now: DateTime<Utc>,
) -> Result<Vec<Installment>> {
    if count < 1 {
        return Err(BillingError::Validation(
            "Installment count must be at least 1".to_string(),
        ));
    }
    if !total.is_positive() {
        return Err(BillingError::Validation(format!(
            "Total amount must be positive, got {}",
            total
        )));
    }

    let total_cents = total.cents()?;
    let divisor = i64::from(count);
    let base = total_cents.div_euclid(divisor);
    let remainder = total_cents.rem_euclid(divisor);

    let schedule = (0..count)
        .map(|index| {
            let extra = if i64::from(index) < remainder { 1 } else { 0 };
            let offset = Duration::days(i64::from(index) * i64::from(frequency_days));
            Installment {
                amount: Amount::from_cents(base + extra),
                due_date: now + offset,
                status: if index == 0 {
                    PaymentStatus::Paid
                } else {
                    PaymentStatus::Pending
                },
            }
        })
        .collect();

    Ok(schedule)
}
