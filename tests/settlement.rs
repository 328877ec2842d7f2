mod common;

use common::{Harness, fast_config};
use points_ledger::transaction::expire_key;
use points_ledger::{
    DeltaEffect, ExpiryPolicy, LedgerStore, LotDelta, LotStatus, Page, Reconciliation,
    Transaction, TransactionKind, TransactionStatus,
};
use uuid::Uuid;

#[tokio::test]
async fn test_sweep_skips_consumed_lot_and_never_expiring_lot() {
    let h = Harness::new();
    let account = Uuid::now_v7();
    let c1 = h.ledger.credit(account, 100, "c1", ExpiryPolicy::Days(1)).await.unwrap();
    h.ledger.credit(account, 50, "c2", ExpiryPolicy::Days(30)).await.unwrap();
    h.ledger.debit(account, 120, "k1").await.unwrap();
    let forever = h.ledger.credit(account, 50, "k2", ExpiryPolicy::Never).await.unwrap();

    h.advance_days(2);
    let report = h.ledger.settle().await.unwrap();

    assert_eq!(report.expired_lots, 0);
    assert_eq!(report.forfeited_points, 0);
    assert!(report.failed_accounts.is_empty());

    let lot1 = h.store.get_lot(c1.deltas[0].lot_id).await.unwrap().unwrap();
    assert_eq!(lot1.status, LotStatus::Consumed);
    let never = h.store.get_lot(forever.deltas[0].lot_id).await.unwrap().unwrap();
    assert_eq!(never.status, LotStatus::Active);
    assert_eq!(never.remaining_amount, 50);

    assert_eq!(h.ledger.get_balance(account).await.unwrap().available, 80);
    h.assert_consistent(account).await;
}

#[tokio::test]
async fn test_sweep_forfeits_remainder_exactly_once() {
    let h = Harness::new();
    let account = Uuid::now_v7();
    let credit = h.ledger.credit(account, 100, "earn", ExpiryPolicy::Days(1)).await.unwrap();
    h.ledger.debit(account, 30, "spend").await.unwrap();
    let lot_id = credit.deltas[0].lot_id;

    h.advance_days(2);
    let first = h.ledger.settle().await.unwrap();
    assert_eq!(first.scanned_lots, 1);
    assert_eq!(first.expired_lots, 1);
    assert_eq!(first.forfeited_points, 70);
    assert_eq!(first.accounts_settled, 1);
    assert!(first.reconciliations.is_empty());

    let lot = h.store.get_lot(lot_id).await.unwrap().unwrap();
    assert_eq!(lot.status, LotStatus::Expired);
    assert_eq!(lot.remaining_amount, 0);
    assert_eq!(h.stored_balance(account).await, 0);

    let expire = h
        .store
        .find_transaction(account, &expire_key(lot_id))
        .await
        .unwrap()
        .expect("expiry recorded under the lot's key");
    assert_eq!(expire.kind, TransactionKind::Expire);
    assert_eq!(expire.status, TransactionStatus::Applied);
    assert_eq!(expire.amount, 70);
    assert_eq!(expire.deltas, vec![LotDelta::new(lot_id, 70, DeltaEffect::Expire)]);

    let second = h.ledger.settle().await.unwrap();
    assert_eq!(second.scanned_lots, 0);
    assert_eq!(second.expired_lots, 0);
    assert_eq!(second.forfeited_points, 0);

    let history = h.ledger.list_transactions(account, Page::default()).await.unwrap();
    let expiries = history
        .iter()
        .filter(|tx| tx.kind == TransactionKind::Expire)
        .count();
    assert_eq!(expiries, 1);
    h.assert_consistent(account).await;
}

#[tokio::test]
async fn test_sweep_pages_across_many_accounts() {
    // batch_size is 2 in the fast config, so this takes several pages.
    let h = Harness::new();
    let accounts: Vec<Uuid> = (0..5).map(|_| Uuid::now_v7()).collect();
    for (i, account) in accounts.iter().enumerate() {
        h.ledger
            .credit(*account, 10 + i as u64, "earn", ExpiryPolicy::Days(1))
            .await
            .unwrap();
        h.ledger
            .credit(*account, 5, "later", ExpiryPolicy::Days(60))
            .await
            .unwrap();
    }

    h.advance_days(2);
    let report = h.ledger.settle().await.unwrap();
    assert_eq!(report.scanned_lots, 5);
    assert_eq!(report.expired_lots, 5);
    assert_eq!(report.forfeited_points, 10 + 11 + 12 + 13 + 14);

    for account in &accounts {
        assert_eq!(h.stored_balance(*account).await, 5);
        h.assert_consistent(*account).await;
    }
}

#[tokio::test]
async fn test_sweep_does_not_touch_lots_before_expiry() {
    let h = Harness::new();
    let account = Uuid::now_v7();
    h.ledger.credit(account, 10, "earn", ExpiryPolicy::Days(3)).await.unwrap();

    h.advance_days(2);
    let report = h.ledger.settle().await.unwrap();
    assert_eq!(report.scanned_lots, 0);
    assert_eq!(h.stored_balance(account).await, 10);
}

#[tokio::test]
async fn test_sweep_resumes_recorded_expiry() {
    let h = Harness::new();
    let account = Uuid::now_v7();
    let credit = h.ledger.credit(account, 40, "earn", ExpiryPolicy::Days(1)).await.unwrap();
    let lot_id = credit.deltas[0].lot_id;
    h.advance_days(2);

    // A sweep that died after recording its plan.
    let pending = Transaction::pending(account, TransactionKind::Expire, 40, expire_key(lot_id), h.now())
        .with_deltas(vec![LotDelta::new(lot_id, 40, DeltaEffect::Expire)]);
    h.store.record_pending(&pending).await.unwrap();

    let report = h.ledger.settle().await.unwrap();
    assert_eq!(report.expired_lots, 1);
    assert_eq!(report.forfeited_points, 40);

    let stored = h.store.get_transaction(pending.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Applied);
    assert_eq!(
        h.ledger
            .list_transactions(account, Page::default())
            .await
            .unwrap()
            .iter()
            .filter(|tx| tx.kind == TransactionKind::Expire)
            .count(),
        1
    );
    h.assert_consistent(account).await;
}

#[tokio::test]
async fn test_reconcile_repairs_drifted_balance() {
    let h = Harness::new();
    let account = Uuid::now_v7();
    let credit = h.ledger.credit(account, 100, "earn", ExpiryPolicy::Never).await.unwrap();

    let mut lot = h.store.get_lot(credit.deltas[0].lot_id).await.unwrap().unwrap();
    lot.remaining_amount = 60;
    h.store.put_lot_unchecked(lot).unwrap();

    let repaired = h.ledger.reconcile_account(account).await.unwrap();
    assert_eq!(
        repaired,
        Some(Reconciliation {
            account_id: account,
            stored: 100,
            computed: 60,
        })
    );
    assert_eq!(h.stored_balance(account).await, 60);
    assert_eq!(h.ledger.reconcile_account(account).await.unwrap(), None);
    assert_eq!(h.ledger.reconcile_account(Uuid::now_v7()).await.unwrap(), None);
    h.assert_consistent(account).await;
}

#[tokio::test]
async fn test_sweep_reconciles_accounts_it_touches() {
    let h = Harness::new();
    let account = Uuid::now_v7();
    h.ledger.credit(account, 20, "short", ExpiryPolicy::Days(1)).await.unwrap();
    let keep = h.ledger.credit(account, 100, "keep", ExpiryPolicy::Never).await.unwrap();

    let mut lot = h.store.get_lot(keep.deltas[0].lot_id).await.unwrap().unwrap();
    lot.remaining_amount = 90;
    h.store.put_lot_unchecked(lot).unwrap();

    h.advance_days(2);
    let report = h.ledger.settle().await.unwrap();
    assert_eq!(report.expired_lots, 1);
    assert_eq!(
        report.reconciliations,
        vec![Reconciliation {
            account_id: account,
            stored: 100,
            computed: 90,
        }]
    );
    assert_eq!(h.stored_balance(account).await, 90);
}

#[tokio::test]
async fn test_failed_account_does_not_block_others() {
    let mut config = fast_config();
    config.lock.wait_timeout_ms = 50;
    let h = Harness::with_config(config);
    let (stuck, free) = (Uuid::now_v7(), Uuid::now_v7());
    h.ledger.credit(stuck, 10, "earn", ExpiryPolicy::Days(1)).await.unwrap();
    h.ledger.credit(free, 20, "earn", ExpiryPolicy::Days(1)).await.unwrap();
    h.advance_days(2);

    let held = h.ledger.locks().acquire(stuck, Uuid::now_v7()).await.unwrap();
    let report = h.ledger.settle().await.unwrap();
    assert_eq!(report.failed_accounts, vec![stuck]);
    assert_eq!(report.expired_lots, 1);
    assert_eq!(report.forfeited_points, 20);
    assert_eq!(h.stored_balance(free).await, 0);
    assert_eq!(h.stored_balance(stuck).await, 10);

    held.release().await.unwrap();
    let retry = h.ledger.settle().await.unwrap();
    assert!(retry.failed_accounts.is_empty());
    assert_eq!(retry.expired_lots, 1);
    assert_eq!(h.stored_balance(stuck).await, 0);
}

#[tokio::test]
async fn test_failed_account_does_not_hide_later_pages() {
    let mut config = fast_config();
    config.lock.wait_timeout_ms = 50;
    let h = Harness::with_config(config);
    let (stuck, free) = (Uuid::now_v7(), Uuid::now_v7());

    // The stuck account's lots fill the first pages on their own.
    for key in ["a", "b", "c"] {
        h.ledger.credit(stuck, 10, key, ExpiryPolicy::Days(1)).await.unwrap();
    }
    h.clock.advance(chrono::Duration::hours(1));
    h.ledger.credit(free, 20, "earn", ExpiryPolicy::Days(1)).await.unwrap();
    h.advance_days(2);

    let _held = h.ledger.locks().acquire(stuck, Uuid::now_v7()).await.unwrap();
    let report = h.ledger.settle().await.unwrap();

    assert_eq!(report.scanned_lots, 4);
    assert_eq!(report.failed_accounts, vec![stuck]);
    assert_eq!(report.expired_lots, 1);
    assert_eq!(h.stored_balance(free).await, 0);
}

#[tokio::test]
async fn test_debit_after_sweep_sees_only_live_lots() {
    let h = Harness::new();
    let account = Uuid::now_v7();
    h.ledger.credit(account, 100, "c1", ExpiryPolicy::Days(1)).await.unwrap();
    h.ledger.credit(account, 50, "c2", ExpiryPolicy::Days(30)).await.unwrap();
    h.advance_days(2);
    h.ledger.settle().await.unwrap();

    assert!(h.ledger.debit(account, 60, "too-much").await.is_err());
    let debit = h.ledger.debit(account, 50, "all-of-it").await.unwrap();
    assert_eq!(debit.deltas.len(), 1);
    assert_eq!(h.stored_balance(account).await, 0);
    h.assert_consistent(account).await;
}

#[tokio::test]
async fn test_foreign_transaction_on_expiry_key_is_not_taken_as_expired() {
    let h = Harness::new();
    let account = Uuid::now_v7();
    let credit = h.ledger.credit(account, 100, "c1", ExpiryPolicy::Days(1)).await.unwrap();
    let lot_id = credit.deltas[0].lot_id;

    // Written before caller keys were screened: a credit sitting on the lot's expiry key.
    let squatter =
        Transaction::pending(account, TransactionKind::Credit, 5, expire_key(lot_id), h.now());
    h.store.record_pending(&squatter).await.unwrap();

    h.advance_days(2);
    let report = h.ledger.settle().await.unwrap();
    assert_eq!(report.expired_lots, 0);
    assert_eq!(report.skipped_lots, 0);
    assert_eq!(report.failed_accounts, vec![account]);

    let lot = h.store.get_lot(lot_id).await.unwrap().unwrap();
    assert_eq!(lot.status, LotStatus::Active);
    let untouched = h.store.get_transaction(squatter.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, TransactionStatus::Pending);
    assert_eq!(untouched.kind, TransactionKind::Credit);
}
