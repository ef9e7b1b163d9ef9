use crate::domain::payment::{AttemptRecord, NewPayment, Payment, PaymentId, PaymentStatus};
use crate::domain::plan::{NewPlan, OrderId, Plan, PlanId};
use crate::domain::ports::{PaymentStore, PlanStore, PlanTransaction, Settlement};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Column Family for plan rows.
pub const CF_PLANS: &str = "plans";
/// Column Family for payment rows.
pub const CF_PAYMENTS: &str = "payments";
/// Column Family for id sequences and secondary indexes.
pub const CF_META: &str = "meta";

const PLAN_SEQUENCE: &[u8] = b"seq:plan";
const PAYMENT_SEQUENCE: &[u8] = b"seq:payment";
/// `order:{order_id}` -> plan id.
const ORDER_INDEX: &[u8] = b"order:";
/// `plan:{plan_id}{payment_id}` -> empty, one entry per payment of the plan.
const PLAN_PAYMENTS_INDEX: &[u8] = b"plan:";

struct Inner {
    db: DB,
    plan_seq: AtomicU64,
    payment_seq: AtomicU64,
    /// Serializes read-modify-write cycles so status transitions are atomic.
    write_lock: Mutex<()>,
}

/// A persistent store implementation using RocksDB.
///
/// Plans and payments live in separate Column Families keyed by big-endian id,
/// so iteration order is id order. The `meta` Column Family holds the id
/// sequences plus the order and plan indexes. Every write that touches more
/// than one row goes through a single `WriteBatch`.
///
/// This struct is thread-safe (`Clone` shares the underlying database).
#[derive(Clone)]
pub struct RocksDbBillingStore {
    inner: Arc<Inner>,
}

impl RocksDbBillingStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families exist and restores the id
    /// sequences from the `meta` column family.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = [CF_PLANS, CF_PAYMENTS, CF_META]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        let plan_seq = read_sequence(&db, PLAN_SEQUENCE)?;
        let payment_seq = read_sequence(&db, PAYMENT_SEQUENCE)?;

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                plan_seq: AtomicU64::new(plan_seq),
                payment_seq: AtomicU64::new(payment_seq),
                write_lock: Mutex::new(()),
            }),
        })
    }

    fn get_row<T: DeserializeOwned>(&self, cf_name: &str, id: u64) -> Result<Option<T>> {
        let cf = cf_handle(&self.inner.db, cf_name)?;
        match self.inner.db.get_cf(cf, id.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_row<T: Serialize>(&self, cf_name: &str, id: u64, row: &T) -> Result<()> {
        let cf = cf_handle(&self.inner.db, cf_name)?;
        let value = serde_json::to_vec(row)?;
        self.inner.db.put_cf(cf, id.to_be_bytes(), value)?;
        Ok(())
    }

    fn plan_for_order(&self, order_id: OrderId) -> Result<Option<PlanId>> {
        let meta = cf_handle(&self.inner.db, CF_META)?;
        match self
            .inner
            .db
            .get_cf(meta, index_key(ORDER_INDEX, &[order_id]))?
        {
            Some(bytes) => Ok(Some(decode_id(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Payment ids of a plan, in id order, read from the plan index.
    fn payment_ids(&self, plan_id: PlanId) -> Result<Vec<PaymentId>> {
        let meta = cf_handle(&self.inner.db, CF_META)?;
        let prefix = index_key(PLAN_PAYMENTS_INDEX, &[plan_id]);
        let iter = self
            .inner
            .db
            .iterator_cf(meta, IteratorMode::From(&prefix, Direction::Forward));

        let mut ids = Vec::new();
        for item in iter {
            let (key, _) = item?;
            let Some(payment_id) = key.strip_prefix(prefix.as_slice()) else {
                break;
            };
            ids.push(decode_id(payment_id)?);
        }
        Ok(ids)
    }
}

fn cf_handle<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| BillingError::Storage(format!("Column family '{}' not found", name)))
}

fn index_key(prefix: &[u8], ids: &[u64]) -> Vec<u8> {
    let mut key = prefix.to_vec();
    for id in ids {
        key.extend_from_slice(&id.to_be_bytes());
    }
    key
}

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| BillingError::Storage("Corrupt id in meta column family".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

fn read_sequence(db: &DB, key: &[u8]) -> Result<u64> {
    let cf = cf_handle(db, CF_META)?;
    match db.get_cf(cf, key)? {
        Some(bytes) => decode_id(&bytes),
        None => Ok(0),
    }
}

/// Rows staged by an uncommitted [`RocksDbBillingStore`] transaction.
pub struct RocksDbTransaction {
    store: RocksDbBillingStore,
    plans: Vec<Plan>,
    payments: Vec<Payment>,
}

#[async_trait]
impl PlanTransaction for RocksDbTransaction {
    async fn insert_plan(&mut self, plan: NewPlan) -> Result<Plan> {
        if plan.installments_count == 0 || !plan.total_amount.is_positive() {
            return Err(BillingError::Validation(format!(
                "Rejected plan row for order {}",
                plan.order_id
            )));
        }
        let id = self.store.inner.plan_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let plan = plan.into_plan(id);
        self.plans.push(plan.clone());
        Ok(plan)
    }

    async fn insert_payment(&mut self, payment: NewPayment) -> Result<Payment> {
        let staged = self.plans.iter().any(|p| p.id == payment.plan_id);
        if !staged && self.store.get_row::<Plan>(CF_PLANS, payment.plan_id)?.is_none() {
            return Err(BillingError::Storage(format!(
                "Payment references unknown plan {}",
                payment.plan_id
            )));
        }
        let id = self.store.inner.payment_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let payment = payment.into_payment(id);
        self.payments.push(payment.clone());
        Ok(payment)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let inner = &self.store.inner;
        let _guard = inner.write_lock.lock().await;

        for plan in &self.plans {
            if self.store.plan_for_order(plan.order_id)?.is_some() {
                return Err(BillingError::Storage(format!(
                    "A plan already exists for order {}",
                    plan.order_id
                )));
            }
        }

        let plans_cf = cf_handle(&inner.db, CF_PLANS)?;
        let payments_cf = cf_handle(&inner.db, CF_PAYMENTS)?;
        let meta_cf = cf_handle(&inner.db, CF_META)?;

        let mut batch = WriteBatch::default();
        for plan in &self.plans {
            batch.put_cf(plans_cf, plan.id.to_be_bytes(), serde_json::to_vec(plan)?);
            batch.put_cf(
                meta_cf,
                index_key(ORDER_INDEX, &[plan.order_id]),
                plan.id.to_be_bytes(),
            );
        }
        for payment in &self.payments {
            batch.put_cf(
                payments_cf,
                payment.id.to_be_bytes(),
                serde_json::to_vec(payment)?,
            );
            batch.put_cf(
                meta_cf,
                index_key(PLAN_PAYMENTS_INDEX, &[payment.plan_id, payment.id]),
                b"",
            );
        }
        batch.put_cf(
            meta_cf,
            PLAN_SEQUENCE,
            inner.plan_seq.load(Ordering::SeqCst).to_be_bytes(),
        );
        batch.put_cf(
            meta_cf,
            PAYMENT_SEQUENCE,
            inner.payment_seq.load(Ordering::SeqCst).to_be_bytes(),
        );

        inner.db.write(batch)?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PlanStore for RocksDbBillingStore {
    async fn begin(&self) -> Result<Box<dyn PlanTransaction>> {
        Ok(Box::new(RocksDbTransaction {
            store: self.clone(),
            plans: Vec::new(),
            payments: Vec::new(),
        }))
    }

    async fn get(&self, plan_id: PlanId) -> Result<Option<Plan>> {
        self.get_row(CF_PLANS, plan_id)
    }

    async fn find_by_order(&self, order_id: OrderId) -> Result<Option<Plan>> {
        match self.plan_for_order(order_id)? {
            Some(plan_id) => self.get_row(CF_PLANS, plan_id),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PaymentStore for RocksDbBillingStore {
    async fn get(&self, payment_id: PaymentId) -> Result<Option<Payment>> {
        self.get_row(CF_PAYMENTS, payment_id)
    }

    async fn list_for_plan(&self, plan_id: PlanId) -> Result<Vec<Payment>> {
        let mut payments = Vec::new();
        for payment_id in self.payment_ids(plan_id)? {
            if let Some(payment) = self.get_row(CF_PAYMENTS, payment_id)? {
                payments.push(payment);
            }
        }
        Ok(payments)
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        after: Option<PaymentId>,
        limit: usize,
    ) -> Result<Vec<Payment>> {
        let cf = cf_handle(&self.inner.db, CF_PAYMENTS)?;
        let start = after.map_or(0, |id| id + 1).to_be_bytes();
        let iter = self
            .inner
            .db
            .iterator_cf(cf, IteratorMode::From(&start[..], Direction::Forward));

        let mut due = Vec::new();
        for item in iter {
            if due.len() >= limit {
                break;
            }
            let (_key, value) = item?;
            let payment: Payment = serde_json::from_slice(&value)?;
            if payment.is_due(now) {
                due.push(payment);
            }
        }
        Ok(due)
    }

    async fn claim(
        &self,
        payment_id: PaymentId,
        expected_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<Payment>> {
        let _guard = self.inner.write_lock.lock().await;
        let mut payment: Payment = self
            .get_row(CF_PAYMENTS, payment_id)?
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", payment_id)))?;
        if !payment.is_due(now) || payment.attempts != expected_attempts {
            return Ok(None);
        }
        payment.status = PaymentStatus::Processing;
        payment.claimed_at = Some(now);
        self.put_row(CF_PAYMENTS, payment_id, &payment)?;
        Ok(Some(payment))
    }

    async fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let _guard = self.inner.write_lock.lock().await;
        let cf = cf_handle(&self.inner.db, CF_PAYMENTS)?;

        let mut batch = WriteBatch::default();
        let mut released = 0;
        for item in self.inner.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let mut payment: Payment = serde_json::from_slice(&value)?;
            if payment.status == PaymentStatus::Processing
                && payment.claimed_at.is_none_or(|at| at < claimed_before)
            {
                payment.status = PaymentStatus::Pending;
                payment.claimed_at = None;
                batch.put_cf(cf, key, serde_json::to_vec(&payment)?);
                released += 1;
            }
        }
        if released > 0 {
            self.inner.db.write(batch)?;
        }
        Ok(released)
    }

    async fn record_attempt(
        &self,
        payment_id: PaymentId,
        attempt: AttemptRecord,
    ) -> Result<Settlement> {
        let _guard = self.inner.write_lock.lock().await;
        let plans_cf = cf_handle(&self.inner.db, CF_PLANS)?;
        let payments_cf = cf_handle(&self.inner.db, CF_PAYMENTS)?;

        let mut payment: Payment = self
            .get_row(CF_PAYMENTS, payment_id)?
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", payment_id)))?;
        payment.apply_attempt(&attempt);

        let mut batch = WriteBatch::default();
        batch.put_cf(
            payments_cf,
            payment_id.to_be_bytes(),
            serde_json::to_vec(&payment)?,
        );

        let mut plan: Option<Plan> = self.get_row(CF_PLANS, payment.plan_id)?;
        if let Some(plan) = plan.as_mut() {
            let mut statuses = Vec::new();
            for sibling_id in self.payment_ids(plan.id)? {
                if sibling_id == payment_id {
                    statuses.push(payment.status);
                } else if let Some(sibling) = self.get_row::<Payment>(CF_PAYMENTS, sibling_id)? {
                    statuses.push(sibling.status);
                }
            }
            let settled = plan.status.settle(payment.status, statuses);
            if settled != plan.status {
                plan.status = settled;
                batch.put_cf(plans_cf, plan.id.to_be_bytes(), serde_json::to_vec(&*plan)?);
            }
        }

        self.inner.db.write(batch)?;
        Ok(Settlement { payment, plan })
    }
}
