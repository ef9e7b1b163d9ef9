use crate::config::SchedulerConfig;
use crate::domain::clock::Clock;
use crate::domain::payment::{AttemptRecord, Payment, PaymentId, Resolution};
use crate::domain::plan::{Plan, PlanStatus};
use crate::domain::ports::{
    ChargeProcessor, ChargeRequest, FailureNotifier, FinalFailure, SharedPaymentStore,
    SharedPlanStore,
};
use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tally of one scheduler run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Stale `processing` claims returned to `pending` before the run.
    pub released: u64,
    pub examined: usize,
    pub paid: usize,
    pub rescheduled: usize,
    pub failed_final: usize,
    /// Due payments whose plan no longer exists.
    pub orphaned: usize,
    /// Payments another run claimed first.
    pub skipped: usize,
    /// Payments abandoned mid-way because of a store error.
    pub errored: usize,
    pub cancelled: bool,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "examined={} paid={} rescheduled={} failed_final={} orphaned={} skipped={} errored={} released={} cancelled={}",
            self.examined,
            self.paid,
            self.rescheduled,
            self.failed_final,
            self.orphaned,
            self.skipped,
            self.errored,
            self.released,
            self.cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Paid,
    Rescheduled,
    FailedFinal,
    Orphaned,
    Skipped,
}

/// Charges every due installment once per run.
///
/// Each payment is claimed before it is charged, so two overlapping runs never
/// charge the same installment. A failure on one payment is logged and the run
/// moves on to the next.
pub struct DuePaymentScheduler {
    plans: SharedPlanStore,
    payments: SharedPaymentStore,
    processor: Arc<dyn ChargeProcessor>,
    notifier: Arc<dyn FailureNotifier>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl DuePaymentScheduler {
    pub fn new(
        plans: SharedPlanStore,
        payments: SharedPaymentStore,
        processor: Arc<dyn ChargeProcessor>,
        notifier: Arc<dyn FailureNotifier>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            plans,
            payments,
            processor,
            notifier,
            clock,
            config,
        }
    }

    /// Runs on its own task.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<Result<RunReport>> {
        tokio::spawn(async move { self.run(&cancel).await })
    }

    /// Processes everything due at the start of the run.
    ///
    /// Only a failure to read the due set aborts the run; per-payment failures are
    /// counted in the report.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport> {
        let mut report = RunReport::default();
        let started = self.clock.now();

        let stale_before = ChronoDuration::from_std(self.config.claim_ttl)
            .ok()
            .and_then(|ttl| started.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        report.released = self.payments.release_stale_claims(stale_before).await?;
        if report.released > 0 {
            warn!(count = report.released, "Released stale payment claims");
        }

        info!(processor = self.processor.name(), %started, "Scheduler run started");

        let batch_size = self.config.batch_size.max(1);
        let mut cursor: Option<PaymentId> = None;
        'pages: loop {
            let page = self
                .payments
                .fetch_due(started, cursor, batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.id);
            let exhausted = page.len() < batch_size;

            for payment in page {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'pages;
                }
                report.examined += 1;
                let payment_id = payment.id;
                match self.process(payment).await {
                    Ok(Disposition::Paid) => report.paid += 1,
                    Ok(Disposition::Rescheduled) => report.rescheduled += 1,
                    Ok(Disposition::FailedFinal) => report.failed_final += 1,
                    Ok(Disposition::Orphaned) => report.orphaned += 1,
                    Ok(Disposition::Skipped) => report.skipped += 1,
                    Err(e) => {
                        error!(payment_id, error = %e, "Failed to process payment");
                        report.errored += 1;
                    }
                }
            }

            if exhausted {
                break;
            }
        }

        if report.cancelled {
            warn!(%report, "Scheduler run cancelled");
        } else {
            info!(%report, "Scheduler run finished");
        }
        Ok(report)
    }

    async fn process(&self, payment: Payment) -> Result<Disposition> {
        let Some(plan) = self.plans.get(payment.plan_id).await? else {
            error!(
                payment_id = payment.id,
                plan_id = payment.plan_id,
                "Payment references a missing plan"
            );
            return Ok(Disposition::Orphaned);
        };

        let Some(claimed) = self
            .payments
            .claim(payment.id, payment.attempts, self.clock.now())
            .await?
        else {
            debug!(payment_id = payment.id, "Payment already claimed or charged");
            return Ok(Disposition::Skipped);
        };

        let attempt = self.charge(&claimed, &plan).await;
        let resolution = attempt.resolution;
        let settlement = self.payments.record_attempt(claimed.id, attempt).await?;
        let updated = settlement.payment;

        match resolution {
            Resolution::Paid => {
                info!(
                    payment_id = updated.id,
                    plan_id = plan.id,
                    amount = %updated.amount,
                    reference = %updated.provider_reference_id,
                    "Installment paid"
                );
                if let Some(settled) = settlement.plan
                    && settled.status == PlanStatus::Completed
                    && plan.status != PlanStatus::Completed
                {
                    info!(plan_id = settled.id, order_id = settled.order_id, "Plan completed");
                }
                Ok(Disposition::Paid)
            }
            Resolution::RetryAt(retry_at) => {
                info!(
                    payment_id = updated.id,
                    attempts = updated.attempts,
                    %retry_at,
                    error = updated.last_error.as_deref().unwrap_or_default(),
                    "Installment rescheduled"
                );
                Ok(Disposition::Rescheduled)
            }
            Resolution::FailedFinal => {
                let plan = settlement.plan.unwrap_or(Plan {
                    status: PlanStatus::Breach,
                    ..plan
                });
                warn!(
                    payment_id = updated.id,
                    plan_id = plan.id,
                    order_id = plan.order_id,
                    attempts = updated.attempts,
                    "Installment abandoned, plan in breach"
                );
                self.notifier
                    .payment_failed_final(FinalFailure {
                        payment: updated,
                        plan,
                    })
                    .await;
                Ok(Disposition::FailedFinal)
            }
        }
    }

    /// Charges a claimed payment and decides where it goes next.
    ///
    /// The idempotency key comes from the claimed row, so it names the attempt
    /// that is actually being made.
    async fn charge(&self, payment: &Payment, plan: &Plan) -> AttemptRecord {
        let attempt = payment.attempts + 1;
        let request = ChargeRequest {
            amount: payment.amount,
            customer_ref: format!("{}{}", self.config.customer_ref_prefix, plan.customer_id),
            idempotency_key: format!("payment-{}-attempt-{}", payment.id, attempt),
        };

        let (reference, error) = match tokio::time::timeout(
            self.config.charge_timeout,
            self.processor.charge(request),
        )
        .await
        {
            Ok(Ok(outcome)) if outcome.success => return AttemptRecord::paid(outcome.provider_ref),
            Ok(Ok(outcome)) => (
                Some(outcome.provider_ref).filter(|r| !r.is_empty()),
                outcome.error.unwrap_or_else(|| "declined".to_string()),
            ),
            Ok(Err(e)) => {
                warn!(payment_id = payment.id, error = %e, "Charge call failed");
                (None, e.to_string())
            }
            Err(_) => {
                warn!(
                    payment_id = payment.id,
                    timeout = ?self.config.charge_timeout,
                    "Charge timed out"
                );
                (None, "charge timed out".to_string())
            }
        };

        match self
            .config
            .retry_policy
            .next_retry_date(attempt, self.clock.now())
        {
            Some(retry_at) => AttemptRecord::retry(reference, error, retry_at),
            None => AttemptRecord::abandoned(reference, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::domain::money::Amount;
    use crate::domain::payment::{NewPayment, PaymentStatus};
    use crate::domain::plan::NewPlan;
    use crate::domain::ports::{PaymentStore, PlanStore};
    use crate::infrastructure::charge::{ScriptedCharge, ScriptedChargeProcessor};
    use crate::infrastructure::in_memory::InMemoryBillingStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingNotifier {
        failures: Mutex<Vec<FinalFailure>>,
    }

    #[async_trait]
    impl FailureNotifier for CollectingNotifier {
        async fn payment_failed_final(&self, failure: FinalFailure) {
            self.failures.lock().unwrap().push(failure);
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    async fn seed(store: &InMemoryBillingStore, statuses: &[PaymentStatus]) -> Plan {
        let mut tx = store.begin().await.unwrap();
        let plan = tx
            .insert_plan(NewPlan {
                order_id: 900,
                customer_id: 42,
                total_amount: Amount::new(dec!(150)),
                installments_count: statuses.len() as u32,
                status: PlanStatus::Active,
                created_at: start(),
            })
            .await
            .unwrap();
        for status in statuses {
            tx.insert_payment(NewPayment {
                plan_id: plan.id,
                amount: Amount::new(dec!(50)),
                due_date: start(),
                status: *status,
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();
        plan
    }

    fn scheduler(
        store: &InMemoryBillingStore,
        processor: Arc<ScriptedChargeProcessor>,
        notifier: Arc<CollectingNotifier>,
        clock: &ManualClock,
    ) -> DuePaymentScheduler {
        DuePaymentScheduler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            processor,
            notifier,
            Arc::new(clock.clone()),
            SchedulerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_successful_charge_marks_paid() {
        let store = InMemoryBillingStore::new();
        let plan = seed(&store, &[PaymentStatus::Paid, PaymentStatus::Pending]).await;
        let clock = ManualClock::new(start());
        let processor = Arc::new(ScriptedChargeProcessor::always(ScriptedCharge::Succeed));
        let scheduler = scheduler(
            &store,
            processor.clone(),
            Arc::new(CollectingNotifier::default()),
            &clock,
        );

        let report = scheduler.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.paid, 1);

        let payment = PaymentStore::get(&store, 2).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(payment.attempts, 1);
        assert_eq!(payment.provider_reference_id, "pi_scripted_0001");

        let requests = processor.requests();
        assert_eq!(requests[0].customer_ref, "cus_42");
        assert_eq!(requests[0].idempotency_key, "payment-2-attempt-1");

        let plan = PlanStore::get(&store, plan.id).await.unwrap().unwrap();
        assert_eq!(plan.status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn test_decline_reschedules_with_backoff() {
        let store = InMemoryBillingStore::new();
        seed(&store, &[PaymentStatus::Paid, PaymentStatus::Pending]).await;
        let clock = ManualClock::new(start());
        let processor = Arc::new(ScriptedChargeProcessor::always(ScriptedCharge::Decline(
            "insufficient_funds".to_string(),
        )));
        let scheduler = scheduler(
            &store,
            processor,
            Arc::new(CollectingNotifier::default()),
            &clock,
        );

        let report = scheduler.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.rescheduled, 1);

        let payment = PaymentStore::get(&store, 2).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.attempts, 1);
        assert_eq!(payment.due_date, start() + Duration::days(3));
        assert_eq!(payment.last_error.as_deref(), Some("insufficient_funds"));

        let again = scheduler.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(again.examined, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_breach_plan_and_notify() {
        let store = InMemoryBillingStore::new();
        let plan = seed(&store, &[PaymentStatus::Paid, PaymentStatus::Pending]).await;
        let clock = ManualClock::new(start());
        let notifier = Arc::new(CollectingNotifier::default());
        let processor = Arc::new(ScriptedChargeProcessor::always(ScriptedCharge::Decline(
            "card_declined".to_string(),
        )));
        let scheduler = scheduler(&store, processor.clone(), notifier.clone(), &clock);

        for days in [0, 3, 7, 14] {
            clock.advance(Duration::days(days));
            scheduler.run(&CancellationToken::new()).await.unwrap();
        }

        let payment = PaymentStore::get(&store, 2).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::FailedFinal);
        assert_eq!(payment.attempts, 4);
        let plan = PlanStore::get(&store, plan.id).await.unwrap().unwrap();
        assert_eq!(plan.status, PlanStatus::Breach);

        let failures = notifier.failures.lock().unwrap().clone();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].payment.status, PaymentStatus::FailedFinal);
        assert_eq!(failures[0].plan.status, PlanStatus::Breach);

        let keys: Vec<_> = processor
            .requests()
            .into_iter()
            .map(|r| r.idempotency_key)
            .collect();
        assert_eq!(
            keys,
            vec![
                "payment-2-attempt-1",
                "payment-2-attempt-2",
                "payment-2-attempt-3",
                "payment-2-attempt-4"
            ]
        );
    }

    #[tokio::test]
    async fn test_processor_error_counts_as_failed_attempt() {
        let store = InMemoryBillingStore::new();
        seed(&store, &[PaymentStatus::Pending, PaymentStatus::Pending]).await;
        let clock = ManualClock::new(start());
        let processor = Arc::new(ScriptedChargeProcessor::new([ScriptedCharge::Error(
            "connection reset".to_string(),
        )]));
        let scheduler = scheduler(
            &store,
            processor,
            Arc::new(CollectingNotifier::default()),
            &clock,
        );

        let report = scheduler.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.rescheduled, 1);
        assert_eq!(report.paid, 1);

        let first = PaymentStore::get(&store, 1).await.unwrap().unwrap();
        assert_eq!(first.attempts, 1);
        assert!(
            first
                .last_error
                .as_deref()
                .unwrap()
                .contains("connection reset")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_processor_times_out() {
        let store = InMemoryBillingStore::new();
        seed(&store, &[PaymentStatus::Pending]).await;
        let clock = ManualClock::new(start());
        let processor = Arc::new(ScriptedChargeProcessor::new([ScriptedCharge::Hang]));
        let scheduler = scheduler(
            &store,
            processor,
            Arc::new(CollectingNotifier::default()),
            &clock,
        );

        let report = scheduler.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.rescheduled, 1);
        let payment = PaymentStore::get(&store, 1).await.unwrap().unwrap();
        assert_eq!(payment.last_error.as_deref(), Some("charge timed out"));
        assert_eq!(payment.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancelled_run_charges_nothing() {
        let store = InMemoryBillingStore::new();
        seed(&store, &[PaymentStatus::Pending, PaymentStatus::Pending]).await;
        let clock = ManualClock::new(start());
        let processor = Arc::new(ScriptedChargeProcessor::always(ScriptedCharge::Succeed));
        let scheduler = scheduler(
            &store,
            processor.clone(),
            Arc::new(CollectingNotifier::default()),
            &clock,
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = scheduler.run(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.examined, 0);
        assert!(processor.requests().is_empty());
    }

    #[tokio::test]
    async fn test_stale_claim_is_released_and_charged() {
        let store = InMemoryBillingStore::new();
        seed(&store, &[PaymentStatus::Pending]).await;
        assert!(store.claim(1, 0, start()).await.unwrap().is_some());

        let clock = ManualClock::new(start() + Duration::hours(1));
        let scheduler = scheduler(
            &store,
            Arc::new(ScriptedChargeProcessor::always(ScriptedCharge::Succeed)),
            Arc::new(CollectingNotifier::default()),
            &clock,
        );

        let report = scheduler.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(report.paid, 1);
    }

    #[test]
    fn test_report_display() {
        let report = RunReport {
            examined: 3,
            paid: 2,
            rescheduled: 1,
            ..RunReport::default()
        };
        assert_eq!(
            report.to_string(),
            "examined=3 paid=2 rescheduled=1 failed_final=0 orphaned=0 skipped=0 errored=0 released=0 cancelled=false"
        );
    }
}
