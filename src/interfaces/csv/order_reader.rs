use crate::domain::plan::{CustomerId, OrderId};
use crate::error::{BillingError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// A completed order handed over by the host shop.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub total: Decimal,
}

/// Reads completed orders from a CSV source with an
/// `order_id, customer_id, total` header.
///
/// Whitespace around fields is trimmed; rows are deserialized lazily.
pub struct OrderReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> OrderReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    pub fn orders(self) -> impl Iterator<Item = Result<OrderRecord>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(BillingError::from))
    }
}
