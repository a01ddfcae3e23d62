use crate::domain::payment::{Payment, PaymentPatch};
use crate::domain::ports::{
    Clock, ListDirection, PaymentLock, PaymentLockBox, PaymentPage, PaymentStore,
};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

struct Row {
    payment: Payment,
    /// Row-level lock; holding it models `SELECT ... FOR UPDATE`.
    lock: Arc<Mutex<()>>,
}

/// A thread-safe in-memory payment store.
///
/// Rows live in an `Arc<RwLock<HashMap>>`; each row carries its own
/// `Arc<Mutex>` so workers can contend on single rows without serializing
/// the whole table. `try_lock` on a row models `SKIP LOCKED`.
#[derive(Clone)]
pub struct InMemoryPaymentStore {
    rows: Arc<RwLock<HashMap<Uuid, Row>>>,
    tokens: Arc<RwLock<HashMap<(Uuid, String), Uuid>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryPaymentStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Arc::new(RwLock::new(HashMap::new())),
            tokens: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    async fn read_payment(&self, id: Uuid) -> Option<Payment> {
        self.rows.read().await.get(&id).map(|row| row.payment.clone())
    }

    fn make_lock(&self, payment: Payment, guard: OwnedMutexGuard<()>) -> PaymentLockBox {
        Box::new(InMemoryLock {
            payment,
            _guard: guard,
            rows: self.rows.clone(),
            clock: self.clock.clone(),
        })
    }
}

struct InMemoryLock {
    payment: Payment,
    _guard: OwnedMutexGuard<()>,
    rows: Arc<RwLock<HashMap<Uuid, Row>>>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl PaymentLock for InMemoryLock {
    fn payment(&self) -> &Payment {
        &self.payment
    }

    async fn commit(self: Box<Self>, patch: PaymentPatch) -> Result<Payment, StoreError> {
        self.payment.validate_patch(&patch)?;
        let mut updated = self.payment.clone();
        updated.apply_patch(patch, self.clock.now());

        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&self.payment.id)
            .ok_or(StoreError::Missing(self.payment.id))?;
        row.payment = updated.clone();
        Ok(updated)
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert(&self, payment: Payment) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&payment.id) {
            return Err(StoreError::Duplicate(payment.id));
        }
        if let Some(token) = &payment.client_token {
            let mut tokens = self.tokens.write().await;
            let key = (payment.super_account_id, token.clone());
            if let Some(existing) = tokens.get(&key) {
                return Err(StoreError::DuplicateClientToken {
                    existing: *existing,
                });
            }
            tokens.insert(key, payment.id);
        }
        rows.insert(
            payment.id,
            Row {
                payment,
                lock: Arc::new(Mutex::new(())),
            },
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Payment>, StoreError> {
        Ok(self.read_payment(id).await)
    }

    async fn get_by_client_token(
        &self,
        super_account_id: Uuid,
        token: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let id = {
            let tokens = self.tokens.read().await;
            tokens.get(&(super_account_id, token.to_string())).copied()
        };
        match id {
            Some(id) => Ok(self.read_payment(id).await),
            None => Ok(None),
        }
    }

    async fn lock(&self, id: Uuid) -> Result<Option<PaymentLockBox>, StoreError> {
        let row_lock = {
            let rows = self.rows.read().await;
            match rows.get(&id) {
                Some(row) => row.lock.clone(),
                None => return Ok(None),
            }
        };
        let guard = row_lock.lock_owned().await;
        // Re-read under the lock; the row may have moved while we waited.
        let payment = self
            .read_payment(id)
            .await
            .ok_or(StoreError::Missing(id))?;
        Ok(Some(self.make_lock(payment, guard)))
    }

    async fn next_eligible(&self, now: DateTime<Utc>) -> Result<Option<PaymentLockBox>, StoreError> {
        let mut candidates: Vec<(Uuid, DateTime<Utc>, Arc<Mutex<()>>)> = {
            let rows = self.rows.read().await;
            rows.values()
                .filter(|row| row.payment.eligible(now))
                .map(|row| (row.payment.id, row.payment.updated_at, row.lock.clone()))
                .collect()
        };
        candidates.sort_by_key(|(id, updated_at, _)| (*updated_at, *id));

        for (id, _, row_lock) in candidates {
            let Ok(guard) = row_lock.try_lock_owned() else {
                // Held by another worker; skip.
                continue;
            };
            let payment = self
                .read_payment(id)
                .await
                .ok_or(StoreError::Missing(id))?;
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
        let mut visible: Vec<Payment> = {
            let rows = self.rows.read().await;
            rows.values()
                .filter(|row| {
                    row.payment.account_id == account_id
                        || row.payment.super_account_id == account_id
                })
                .map(|row| row.payment.clone())
                .collect()
        };
        visible.sort_by_key(|p| (p.created_at, p.id));
        page(visible, cursor, limit, direction)
    }
}

/// Relay-style paging over a sorted snapshot, probing one row past the page
/// in each direction.
pub(crate) fn page(
    sorted: Vec<Payment>,
    cursor: Option<Uuid>,
    limit: usize,
    direction: ListDirection,
) -> Result<PaymentPage, StoreError> {
    let anchor = match cursor {
        Some(cursor) => Some(
            sorted
                .iter()
                .position(|p| p.id == cursor)
                .ok_or(StoreError::Missing(cursor))?,
        ),
        None => None,
    };
    let (start, end) = match direction {
        ListDirection::Forward => {
            let start = anchor.map(|i| i + 1).unwrap_or(0);
            (start, (start + limit).min(sorted.len()))
        }
        ListDirection::Backward => {
            let end = anchor.unwrap_or(sorted.len());
            (end.saturating_sub(limit), end)
        }
    };
    Ok(PaymentPage {
        has_previous: start > 0,
        has_next: end < sorted.len(),
        items: sorted[start..end].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::{Intent, PaymentState, PaymentTarget, SourceAccount};
    use crate::infrastructure::clock::ManualClock;
    use chrono::TimeZone;
    use std::time::Duration;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn admit(clock: &ManualClock, super_account_id: Uuid, token: Option<&str>) -> Payment {
        Payment::admit(
            Intent {
                target: PaymentTarget::FixedSend {
                    payment_pointer: "$wallet.example/alice".to_string(),
                    amount_to_send: 1000,
                },
                auto_approve: false,
            },
            super_account_id,
            SourceAccount {
                id: Uuid::new_v4(),
                asset_code: "USD".to_string(),
                asset_scale: 2,
            },
            token.map(str::to_string),
            clock.now(),
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let clock = clock();
        let store = InMemoryPaymentStore::new(clock.clone());
        let payment = admit(&clock, Uuid::new_v4(), None);

        store.insert(payment.clone()).await.unwrap();
        let retrieved = store.get(payment.id).await.unwrap().unwrap();
        assert_eq!(retrieved, payment);

        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_client_token_is_unique_per_super_account() {
        let clock = clock();
        let store = InMemoryPaymentStore::new(clock.clone());
        let super_id = Uuid::new_v4();
        let first = admit(&clock, super_id, Some("tok-1"));
        store.insert(first.clone()).await.unwrap();

        let second = admit(&clock, super_id, Some("tok-1"));
        let err = store.insert(second).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::DuplicateClientToken { existing } if existing == first.id
        ));

        // Same token under another super-account is fine.
        let other = admit(&clock, Uuid::new_v4(), Some("tok-1"));
        store.insert(other).await.unwrap();

        let found = store
            .get_by_client_token(super_id, "tok-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn test_locked_row_is_skipped() {
        let clock = clock();
        let store = InMemoryPaymentStore::new(clock.clone());
        let payment = admit(&clock, Uuid::new_v4(), None);
        store.insert(payment.clone()).await.unwrap();

        let held = store.lock(payment.id).await.unwrap().unwrap();
        assert!(store.next_eligible(clock.now()).await.unwrap().is_none());
        drop(held);
        assert!(store.next_eligible(clock.now()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_commit_applies_patch_and_bumps_updated_at() {
        let clock = clock();
        let store = InMemoryPaymentStore::new(clock.clone());
        let payment = admit(&clock, Uuid::new_v4(), None);
        store.insert(payment.clone()).await.unwrap();

        clock.advance(Duration::from_secs(1));
        let lock = store.lock(payment.id).await.unwrap().unwrap();
        let updated = lock
            .commit(PaymentPatch {
                state_attempts: Some(2),
                ..PaymentPatch::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.state_attempts, 2);
        assert!(updated.updated_at > payment.updated_at);

        let stored = store.get(payment.id).await.unwrap().unwrap();
        assert_eq!(stored, updated);
    }

    #[tokio::test]
    async fn test_commit_rejects_illegal_transition() {
        let clock = clock();
        let store = InMemoryPaymentStore::new(clock.clone());
        let payment = admit(&clock, Uuid::new_v4(), None);
        store.insert(payment.clone()).await.unwrap();

        let lock = store.lock(payment.id).await.unwrap().unwrap();
        let err = lock
            .commit(PaymentPatch {
                state: Some(PaymentState::Sending),
                state_attempts: Some(0),
                ..PaymentPatch::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        // The failed commit released the lock and left the row untouched.
        let stored = store.get(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.state, PaymentState::Quoting);
        assert!(store.lock(payment.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_next_eligible_is_fair_by_updated_at() {
        let clock = clock();
        let store = InMemoryPaymentStore::new(clock.clone());
        let super_id = Uuid::new_v4();

        let older = admit(&clock, super_id, None);
        store.insert(older.clone()).await.unwrap();
        clock.advance(Duration::from_secs(1));
        let newer = admit(&clock, super_id, None);
        store.insert(newer).await.unwrap();

        let lock = store.next_eligible(clock.now()).await.unwrap().unwrap();
        assert_eq!(lock.payment().id, older.id);
    }

    #[tokio::test]
    async fn test_paging_probes() {
        let clock = clock();
        let store = InMemoryPaymentStore::new(clock.clone());
        let super_id = Uuid::new_v4();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let payment = admit(&clock, super_id, None);
            ids.push(payment.id);
            store.insert(payment).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let first = store
            .list_by_account(super_id, None, 2, ListDirection::Forward)
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(!first.has_previous);
        assert!(first.has_next);

        let second = store
            .list_by_account(super_id, Some(first.items[1].id), 2, ListDirection::Forward)
            .await
            .unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(second.has_previous);
        assert!(second.has_next);

        let back = store
            .list_by_account(super_id, Some(second.items[0].id), 2, ListDirection::Backward)
            .await
            .unwrap();
        assert_eq!(back.items.len(), 2);
        assert_eq!(back.items[1].id, first.items[1].id);

        let last = store
            .list_by_account(super_id, Some(second.items[1].id), 10, ListDirection::Forward)
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_next);
    }
}
