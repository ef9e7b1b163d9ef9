#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use installments::domain::money::Amount;
use installments::domain::payment::{NewPayment, PaymentStatus};
use installments::domain::plan::{NewPlan, OrderId, Plan, PlanStatus};
use installments::domain::ports::{FailureNotifier, FinalFailure, PlanStore};
use installments::infrastructure::in_memory::InMemoryBillingStore;
use rust_decimal::Decimal;
use std::io::Error;
use std::path::Path;
use std::sync::Mutex;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 1, 6, 0, 0).unwrap()
}

/// Commits a plan whose payments are all worth `amount`, one per entry of
/// `schedule` (days after [`start`], status).
pub async fn seed_plan(
    store: &InMemoryBillingStore,
    order_id: OrderId,
    amount: Decimal,
    schedule: &[(i64, PaymentStatus)],
) -> Plan {
    let mut tx = store.begin().await.unwrap();
    let plan = tx
        .insert_plan(NewPlan {
            order_id,
            customer_id: 42,
            total_amount: Amount::new(amount * Decimal::from(schedule.len() as u64)),
            installments_count: schedule.len() as u32,
            status: PlanStatus::Active,
            created_at: start(),
        })
        .await
        .unwrap();
    for (days, status) in schedule {
        tx.insert_payment(NewPayment {
            plan_id: plan.id,
            amount: Amount::new(amount),
            due_date: start() + Duration::days(*days),
            status: *status,
        })
        .await
        .unwrap();
    }
    tx.commit().await.unwrap();
    plan
}

#[derive(Default)]
pub struct CollectingNotifier {
    failures: Mutex<Vec<FinalFailure>>,
}

impl CollectingNotifier {
    pub fn failures(&self) -> Vec<FinalFailure> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl FailureNotifier for CollectingNotifier {
    async fn payment_failed_final(&self, failure: FinalFailure) {
        self.failures.lock().unwrap().push(failure);
    }
}

pub fn write_orders_csv(path: &Path, rows: &[(u64, u64, &str)]) -> Result<(), Error> {
    let mut wtr = csv::WriterBuilder::new().from_path(path)?;
    wtr.write_record(["order_id", "customer_id", "total"])?;
    for (order_id, customer_id, total) in rows {
        wtr.write_record([order_id.to_string(), customer_id.to_string(), total.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}
