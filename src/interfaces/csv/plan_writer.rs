use crate::domain::plan::{OrderId, PlanId};
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

/// One line of `create-plans` output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanOutcomeRow {
    /// 1-based position of the order among the input's data rows.
    pub record: u64,
    /// Empty when the input row could not be read.
    pub order_id: Option<OrderId>,
    pub plan_id: Option<PlanId>,
    pub outcome: String,
}

pub struct PlanWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> PlanWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write(&mut self, row: &PlanOutcomeRow) -> Result<()> {
        self.writer.serialize(row)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
