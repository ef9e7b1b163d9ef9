use crate::error::BillingError;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::Add;

/// Number of decimal places every stored amount carries.
pub const SCALE: u32 = 2;

/// A currency amount with exactly 2 decimal places.
///
/// Wraps `rust_decimal::Decimal` so that installment arithmetic is done on exact
/// values and never drifts the way binary floating point would.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Self = Self(Decimal::ZERO);

    /// Builds an amount, rounding half away from zero to 2 decimal places.
    pub fn new(value: Decimal) -> Self {
        let mut rounded = value.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointAwayFromZero);
        rounded.rescale(SCALE);
        Self(rounded)
    }

    /// Builds a strictly positive amount.
    pub fn positive(value: Decimal) -> Result<Self, BillingError> {
        let amount = Self::new(value);
        if amount.0 > Decimal::ZERO {
            Ok(amount)
        } else {
            Err(BillingError::Validation(format!(
                "Amount must be positive, got {}",
                value
            )))
        }
    }

    pub fn from_cents(cents: i64) -> Self {
        Self(Decimal::new(cents, SCALE))
    }

    /// Integer minor units. Exact because the value always has scale 2.
    ///
    /// Fails for amounts whose cents do not fit in an `i64`.
    pub fn cents(&self) -> Result<i64, BillingError> {
        let mut value = self.0;
        value.rescale(SCALE);
        i64::try_from(value.mantissa()).map_err(|_| {
            BillingError::Validation(format!("Amount {} is out of range", self.0))
        })
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = BillingError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::positive(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl Add for Amount {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
