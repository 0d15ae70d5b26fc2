//! Foreground refresh and single-writer behavior

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{surviving_proof, Harness, DAY};
use keybox_core::testing::test_keyset;
use keybox_core::{Factor, LostFactor, RecoveryState};
use keybox_params::NetworkType;
use keybox_storage_sqlite::KeysetStatus;
use keybox_wallet_service::{ForegroundRefresher, WalletStore};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_refresher_picks_up_readiness() {
    let h = Harness::new().await;
    let recovery = Arc::new(h.recovery().await);
    recovery
        .start_recovery(LostFactor::Hardware, surviving_proof(LostFactor::Hardware), None)
        .await
        .unwrap();

    let mut rx = recovery.subscribe();
    let handle = ForegroundRefresher::new(Arc::clone(&recovery), Duration::from_secs(3600)).spawn();

    h.advance_secs(7 * DAY);
    handle.refresh_now();
    tokio::time::timeout(
        WAIT,
        rx.wait_for(|state| matches!(state, RecoveryState::ReadyToComplete(_))),
    )
    .await
    .unwrap()
    .unwrap();

    handle.stop().await;
}

#[tokio::test]
async fn test_refresher_reports_sweep_need() {
    let h = Harness::new().await;
    let retired = test_keyset(9, NetworkType::Regtest);
    h.store
        .insert_keyset(&h.account, &retired, KeysetStatus::Retired)
        .unwrap();
    h.fund(&retired, 25_000);

    let recovery = Arc::new(h.recovery().await);
    let sweeps = Arc::new(h.sweeps());
    let mut rx = sweeps.subscribe();

    let handle = ForegroundRefresher::new(recovery, Duration::from_millis(20))
        .with_sweep(Arc::clone(&sweeps))
        .spawn();
    tokio::time::timeout(WAIT, rx.wait_for(|required| *required))
        .await
        .unwrap()
        .unwrap();
    handle.stop().await;
}

#[tokio::test]
async fn test_refresh_failures_do_not_stop_the_loop() {
    let h = Harness::new().await;
    let recovery = Arc::new(h.recovery().await);
    let started = recovery
        .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), None)
        .await
        .unwrap();

    // Exhausts the poll's retries on the first pass
    h.f8e.fail_next(4);
    h.f8e
        .cancel_from_other_device(started.action_id().unwrap(), Factor::Hardware);

    let mut rx = recovery.subscribe();
    let handle = ForegroundRefresher::new(Arc::clone(&recovery), Duration::from_millis(20)).spawn();
    tokio::time::timeout(
        WAIT,
        rx.wait_for(|state| matches!(state, RecoveryState::Cancelled(_))),
    )
    .await
    .unwrap()
    .unwrap();
    handle.stop().await;
}

#[tokio::test]
async fn test_poll_does_not_overwrite_concurrent_cancel() {
    let h = Harness::new().await;
    let recovery = Arc::new(h.recovery().await);
    recovery
        .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), None)
        .await
        .unwrap();
    h.advance_secs(7 * DAY);

    let poller = {
        let recovery = Arc::clone(&recovery);
        tokio::spawn(async move { recovery.poll().await })
    };
    let cancelled = recovery.cancel(Factor::Hardware).await.unwrap();
    poller.await.unwrap().unwrap();

    assert!(matches!(cancelled, RecoveryState::Cancelled(_)));
    assert!(matches!(
        h.store.load_recovery_state(&h.account).unwrap(),
        RecoveryState::Cancelled(_)
    ));
    assert!(matches!(recovery.state(), RecoveryState::Cancelled(_)));
}

#[tokio::test]
async fn test_writers_for_one_account_are_serialized() {
    let h = Harness::new().await;
    let first = Arc::new(h.recovery().await);
    let second = Arc::new(h.recovery().await);

    let a = {
        let service = Arc::clone(&first);
        tokio::spawn(async move {
            service
                .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), None)
                .await
        })
    };
    let b = {
        let service = Arc::clone(&second);
        tokio::spawn(async move {
            service
                .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), None)
                .await
        })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    // Exactly one writer starts; the other sees the persisted recovery
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(h.f8e.create_calls(), 1);
}
