mod common;

use chrono::{TimeZone, Utc};
use common::{fixed_send, Harness};
use outpay::domain::payment::{Intent, Payment, PaymentPatch, PaymentState, PaymentTarget, SourceAccount};
use outpay::domain::ports::{ListDirection, PaymentLock, PaymentStore};
use outpay::error::StoreError;
use outpay::infrastructure::clock::ManualClock;
use outpay::infrastructure::rocksdb::RocksDbPaymentStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use uuid::Uuid;

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ))
}

fn admitted(clock: &ManualClock, token: Option<&str>) -> Payment {
    Payment::admit(
        Intent {
            target: PaymentTarget::FixedSend {
                payment_pointer: "$wallet.example/alice".to_string(),
                amount_to_send: 1000,
            },
            auto_approve: false,
        },
        Uuid::new_v4(),
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
async fn test_rocksdb_rows_survive_reopen() {
    let dir = tempdir().unwrap();
    let clock = clock();
    let payment = admitted(&clock, None);

    {
        let store = RocksDbPaymentStore::open(dir.path(), clock.clone()).unwrap();
        store.insert(payment.clone()).await.unwrap();
        let lock = store.lock(payment.id).await.unwrap().unwrap();
        lock.commit(PaymentPatch {
            state_attempts: Some(2),
            ..PaymentPatch::default()
        })
        .await
        .unwrap();
    }

    // A fresh process over the same directory sees the committed row and
    // the worker can pick it up again.
    clock.advance(Duration::from_secs(1));
    let store = RocksDbPaymentStore::open(dir.path(), clock.clone()).unwrap();
    let recovered = store.get(payment.id).await.unwrap().unwrap();
    assert_eq!(recovered.state, PaymentState::Quoting);
    assert_eq!(recovered.state_attempts, 2);

    let lock = store.next_eligible(clock.now()).await.unwrap().unwrap();
    assert_eq!(lock.payment().id, payment.id);
}

#[tokio::test]
async fn test_rocksdb_token_index_survives_reopen() {
    let dir = tempdir().unwrap();
    let clock = clock();
    let payment = admitted(&clock, Some("tok-1"));
    let super_id = payment.super_account_id;

    {
        let store = RocksDbPaymentStore::open(dir.path(), clock.clone()).unwrap();
        store.insert(payment.clone()).await.unwrap();
    }

    let store = RocksDbPaymentStore::open(dir.path(), clock.clone()).unwrap();
    let found = store
        .get_by_client_token(super_id, "tok-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, payment.id);

    let mut duplicate = admitted(&clock, Some("tok-1"));
    duplicate.super_account_id = super_id;
    let err = store.insert(duplicate).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::DuplicateClientToken { existing } if existing == payment.id
    ));
}

#[tokio::test]
async fn test_create_is_idempotent_per_client_token() {
    let h = Harness::new();
    let first = h
        .engine
        .create(
            fixed_send("$x/y", 1000, false),
            h.super_account,
            Some("order-77".to_string()),
        )
        .await
        .unwrap();

    // The retry returns the original payment and admits nothing new.
    let second = h
        .engine
        .create(
            fixed_send("$x/y", 1000, false),
            h.super_account,
            Some("order-77".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(second.id, first.id);

    // A different token admits a separate payment.
    let third = h
        .engine
        .create(
            fixed_send("$x/y", 1000, false),
            h.super_account,
            Some("order-78".to_string()),
        )
        .await
        .unwrap();
    assert_ne!(third.id, first.id);
}

#[tokio::test]
async fn test_list_by_account_pages_with_probes() {
    let h = Harness::new();
    let mut ids = Vec::new();
    for n in 0..5 {
        let payment = h
            .engine
            .create(
                fixed_send("$x/y", 1000, false),
                h.super_account,
                Some(format!("order-{n}")),
            )
            .await
            .unwrap();
        ids.push(payment.id);
        h.clock.advance(Duration::from_secs(1));
    }

    let first = h
        .engine
        .list_by_account(h.super_account, None, 2, ListDirection::Forward)
        .await
        .unwrap();
    assert_eq!(first.items.len(), 2);
    assert_eq!(first.items[0].id, ids[0]);
    assert!(!first.has_previous);
    assert!(first.has_next);

    let rest = h
        .engine
        .list_by_account(
            h.super_account,
            Some(first.items[1].id),
            10,
            ListDirection::Forward,
        )
        .await
        .unwrap();
    assert_eq!(rest.items.len(), 3);
    assert!(rest.has_previous);
    assert!(!rest.has_next);

    let back = h
        .engine
        .list_by_account(
            h.super_account,
            Some(rest.items[0].id),
            2,
            ListDirection::Backward,
        )
        .await
        .unwrap();
    assert_eq!(back.items.len(), 2);
    assert_eq!(back.items[1].id, ids[1]);
}

#[tokio::test]
async fn test_terminal_rows_reject_further_commits() {
    let mut h = Harness::new();
    let payment = h
        .engine
        .create(fixed_send("not-a-pointer", 100, true), h.super_account, None)
        .await
        .unwrap();
    assert!(h.step().await); // -> Cancelling
    assert!(h.step().await); // -> Cancelled

    let lock = h.deps.store.lock(payment.id).await.unwrap().unwrap();
    let err = lock
        .commit(PaymentPatch {
            state_attempts: Some(1),
            ..PaymentPatch::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
}
