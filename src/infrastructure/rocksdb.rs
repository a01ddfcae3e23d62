use crate::domain::payment::{Payment, PaymentPatch};
use crate::domain::ports::{
    Clock, ListDirection, PaymentLock, PaymentLockBox, PaymentPage, PaymentStore,
};
use crate::error::StoreError;
use crate::infrastructure::in_memory::page;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamilyDescriptor, DB, Options};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Column Family for payment rows.
pub const CF_PAYMENTS: &str = "payments";
/// Column Family for the `(super_account_id, client_token)` unique index.
pub const CF_CLIENT_TOKENS: &str = "client_tokens";

/// A durable payment store backed by RocksDB.
///
/// Rows are serialized as JSON under their id; the create idempotency index
/// lives in its own column family. Row locks are process-local: the store
/// assumes a single engine process owns the database, so the lock table
/// rides in memory while the rows themselves survive restarts.
#[derive(Clone)]
pub struct RocksDbPaymentStore {
    db: Arc<DB>,
    locks: Arc<StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
    clock: Arc<dyn Clock>,
}

impl RocksDbPaymentStore {
    /// Opens or creates a RocksDB instance at `path`, ensuring the required
    /// column families exist.
    pub fn open<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_payments = ColumnFamilyDescriptor::new(CF_PAYMENTS, Options::default());
        let cf_tokens = ColumnFamilyDescriptor::new(CF_CLIENT_TOKENS, Options::default());

        let db = DB::open_cf_descriptors(&opts, path, vec![cf_payments, cf_tokens])?;
        Ok(Self {
            db: Arc::new(db),
            locks: Arc::new(StdMutex::new(HashMap::new())),
            clock,
        })
    }

    fn read_payment(db: &DB, id: Uuid) -> Result<Option<Payment>, StoreError> {
        let cf = db
            .cf_handle(CF_PAYMENTS)
            .ok_or_else(|| StoreError::Backend("payments column family not found".into()))?;
        match db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_payment(db: &DB, payment: &Payment) -> Result<(), StoreError> {
        let cf = db
            .cf_handle(CF_PAYMENTS)
            .ok_or_else(|| StoreError::Backend("payments column family not found".into()))?;
        db.put_cf(&cf, payment.id.as_bytes(), serde_json::to_vec(payment)?)?;
        Ok(())
    }

    fn scan_payments(&self) -> Result<Vec<Payment>, StoreError> {
        let cf = self
            .db
            .cf_handle(CF_PAYMENTS)
            .ok_or_else(|| StoreError::Backend("payments column family not found".into()))?;
        let mut payments = Vec::new();
        for item in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (_key, value) = item?;
            payments.push(serde_json::from_slice::<Payment>(&value)?);
        }
        Ok(payments)
    }

    fn token_key(super_account_id: Uuid, token: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(16 + token.len());
        key.extend_from_slice(super_account_id.as_bytes());
        key.extend_from_slice(token.as_bytes());
        key
    }

    fn row_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn make_lock(&self, payment: Payment, guard: OwnedMutexGuard<()>) -> PaymentLockBox {
        Box::new(RocksDbLock {
            payment,
            _guard: guard,
            db: self.db.clone(),
            clock: self.clock.clone(),
        })
    }
}

struct RocksDbLock {
    payment: Payment,
    _guard: OwnedMutexGuard<()>,
    db: Arc<DB>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl PaymentLock for RocksDbLock {
    fn payment(&self) -> &Payment {
        &self.payment
    }

    async fn commit(self: Box<Self>, patch: PaymentPatch) -> Result<Payment, StoreError> {
        self.payment.validate_patch(&patch)?;
        let mut updated = self.payment.clone();
        updated.apply_patch(patch, self.clock.now());
        RocksDbPaymentStore::write_payment(&self.db, &updated)?;
        Ok(updated)
    }
}

#[async_trait]
impl PaymentStore for RocksDbPaymentStore {
    async fn insert(&self, payment: Payment) -> Result<(), StoreError> {
        if Self::read_payment(&self.db, payment.id)?.is_some() {
            return Err(StoreError::Duplicate(payment.id));
        }
        if let Some(token) = &payment.client_token {
            let cf = self
                .db
                .cf_handle(CF_CLIENT_TOKENS)
                .ok_or_else(|| StoreError::Backend("client_tokens column family not found".into()))?;
            let key = Self::token_key(payment.super_account_id, token);
            if let Some(existing) = self.db.get_cf(&cf, &key)? {
                let existing = Uuid::from_slice(&existing)
                    .map_err(|e| StoreError::Backend(format!("corrupt token index: {e}")))?;
                return Err(StoreError::DuplicateClientToken { existing });
            }
            self.db.put_cf(&cf, &key, payment.id.as_bytes())?;
        }
        Self::write_payment(&self.db, &payment)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Payment>, StoreError> {
        Self::read_payment(&self.db, id)
    }

    async fn get_by_client_token(
        &self,
        super_account_id: Uuid,
        token: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let cf = self
            .db
            .cf_handle(CF_CLIENT_TOKENS)
            .ok_or_else(|| StoreError::Backend("client_tokens column family not found".into()))?;
        match self.db.get_cf(&cf, Self::token_key(super_account_id, token))? {
            Some(id) => {
                let id = Uuid::from_slice(&id)
                    .map_err(|e| StoreError::Backend(format!("corrupt token index: {e}")))?;
                Self::read_payment(&self.db, id)
            }
            None => Ok(None),
        }
    }

    async fn lock(&self, id: Uuid) -> Result<Option<PaymentLockBox>, StoreError> {
        if Self::read_payment(&self.db, id)?.is_none() {
            return Ok(None);
        }
        let guard = self.row_lock(id).lock_owned().await;
        // Re-read under the lock; the row may have moved while we waited.
        let payment = Self::read_payment(&self.db, id)?.ok_or(StoreError::Missing(id))?;
        Ok(Some(self.make_lock(payment, guard)))
    }

    async fn next_eligible(&self, now: DateTime<Utc>) -> Result<Option<PaymentLockBox>, StoreError> {
        let mut candidates: Vec<Payment> = self
            .scan_payments()?
            .into_iter()
            .filter(|p| p.eligible(now))
            .collect();
        candidates.sort_by_key(|p| (p.updated_at, p.id));

        for candidate in candidates {
            let Ok(guard) = self.row_lock(candidate.id).try_lock_owned() else {
                continue;
            };
            let payment =
                Self::read_payment(&self.db, candidate.id)?.ok_or(StoreError::Missing(candidate.id))?;
            if !payment.eligible(now) {
                continue;
            }
            return Ok(Some(self.make_lock(payment, guard)));
        }
        Ok(None)
    }

    async fn list_by_account(
        &self,
        account_id: Uuid,
        cursor: Option<Uuid>,
        limit: usize,
        direction: ListDirection,
    ) -> Result<PaymentPage, StoreError> {
        let mut visible: Vec<Payment> = self
            .scan_payments()?
            .into_iter()
            .filter(|p| p.account_id == account_id || p.super_account_id == account_id)
            .collect();
        visible.sort_by_key(|p| (p.created_at, p.id));
        page(visible, cursor, limit, direction)
    }
}
