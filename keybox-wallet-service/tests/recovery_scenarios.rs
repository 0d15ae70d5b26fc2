//! End-to-end recovery flows against the in-memory authority

mod common;

use std::time::Duration;

use common::{surviving_proof, Harness, DAY};
use keybox_core::testing::test_xpub;
use keybox_core::{
    AuthorizationStrategy, Error, Factor, LostFactor, ProofOfPossession, RecoveryEvent,
    RecoveryState, RemoteActionStatus,
};
use keybox_wallet_service::WalletStore;

#[tokio::test]
async fn test_delay_window_elapses_into_ready() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;

    let started = recovery
        .start_recovery(
            LostFactor::Hardware,
            surviving_proof(LostFactor::Hardware),
            Some(test_xpub(90)),
        )
        .await
        .unwrap();
    assert!(matches!(started, RecoveryState::InProgress(_)));

    h.advance_secs(DAY);
    let status = recovery.poll().await.unwrap();
    assert!(matches!(status.state, RecoveryState::InProgress(_)));
    assert_eq!(status.event, RecoveryEvent::Unchanged);
    assert_eq!(status.remaining_delay, Some(Duration::from_secs(6 * DAY as u64)));

    h.advance_secs(6 * DAY + 1);
    let status = recovery.poll().await.unwrap();
    assert!(matches!(status.state, RecoveryState::ReadyToComplete(_)));
    assert_eq!(status.event, RecoveryEvent::BecameReady);
    assert_eq!(status.remaining_delay, Some(Duration::ZERO));
    assert_eq!(recovery.state(), status.state);
}

#[tokio::test]
async fn test_cancel_then_start_fresh_recovery() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;

    let started = recovery
        .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), Some(test_xpub(91)))
        .await
        .unwrap();
    let first_id = started.action_id().unwrap().to_string();

    h.advance_secs(2 * 3600);
    let cancelled = recovery.cancel(Factor::Hardware).await.unwrap();
    match &cancelled {
        RecoveryState::Cancelled(c) => {
            assert_eq!(c.action_id, first_id);
            assert_eq!(c.cancelled_by, Some(Factor::Hardware));
        }
        other => panic!("expected Cancelled, got {}", other.name()),
    }
    assert_eq!(
        h.f8e.action(&first_id).unwrap().status,
        RemoteActionStatus::Canceled
    );

    let status = recovery.poll().await.unwrap();
    assert!(matches!(status.state, RecoveryState::Cancelled(_)));

    let restarted = recovery
        .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), Some(test_xpub(91)))
        .await
        .unwrap();
    assert!(matches!(restarted, RecoveryState::InProgress(_)));
    assert_ne!(restarted.action_id().unwrap(), first_id);
}

#[tokio::test]
async fn test_cancelled_recovery_never_becomes_ready() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;
    recovery
        .start_recovery(LostFactor::Hardware, surviving_proof(LostFactor::Hardware), None)
        .await
        .unwrap();
    recovery.cancel(Factor::App).await.unwrap();

    h.advance_secs(30 * DAY);
    let status = recovery.poll().await.unwrap();
    assert!(matches!(status.state, RecoveryState::Cancelled(_)));

    let result = recovery.complete(surviving_proof(LostFactor::Hardware)).await;
    assert!(matches!(result, Err(Error::AlreadyTerminal(_))));
}

#[tokio::test]
async fn test_second_complete_is_already_terminal() {
    let h = Harness::new().await;
    let completed = h.completed_recovery(LostFactor::App, 92).await;

    let recovery = h.recovery().await;
    let again = recovery.complete(surviving_proof(LostFactor::App)).await;
    assert!(matches!(again, Err(Error::AlreadyTerminal(_))));
    assert_eq!(h.f8e.complete_calls(), 1);

    let rotation = h.rotation();
    rotation
        .rotate_spending_key(&completed, test_xpub(92))
        .await
        .unwrap();
    let duplicate = rotation.rotate_spending_key(&completed, test_xpub(92)).await;
    assert!(matches!(duplicate, Err(Error::KeyReuse(_))));
    assert_eq!(h.store.list_keysets(&h.account).unwrap().len(), 2);
    assert_eq!(h.f8e.create_keyset_calls(), 1);
}

#[tokio::test]
async fn test_complete_before_ready_reports_remaining_delay() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;
    recovery
        .start_recovery(LostFactor::Hardware, surviving_proof(LostFactor::Hardware), None)
        .await
        .unwrap();
    h.advance_secs(5 * DAY);

    let result = recovery.complete(surviving_proof(LostFactor::Hardware)).await;
    match result {
        Err(Error::RecoveryNotReady { remaining_secs }) => {
            assert_eq!(remaining_secs, 2 * DAY as u64)
        }
        other => panic!("expected RecoveryNotReady, got {:?}", other),
    }
    assert_eq!(h.f8e.complete_calls(), 0);
    assert!(matches!(recovery.state(), RecoveryState::InProgress(_)));
}

#[tokio::test]
async fn test_start_requires_surviving_factor_proof() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;

    let result = recovery
        .start_recovery(LostFactor::App, ProofOfPossession::app("lost-app"), None)
        .await;
    assert!(matches!(result, Err(Error::MissingProof(_))));
    assert_eq!(h.f8e.create_calls(), 0);
    assert_eq!(recovery.state(), RecoveryState::NotStarted);
}

#[tokio::test]
async fn test_second_start_rejected_while_active() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;
    recovery
        .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), None)
        .await
        .unwrap();

    let result = recovery
        .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), None)
        .await;
    assert!(matches!(result, Err(Error::RecoveryAlreadyInProgress(_))));
    assert_eq!(h.f8e.create_calls(), 1);
}

#[tokio::test]
async fn test_recovery_started_elsewhere_is_adopted() {
    let h = Harness::new().await;
    let other_device = h.recovery().await;
    let started = other_device
        .start_recovery(LostFactor::Hardware, surviving_proof(LostFactor::Hardware), None)
        .await
        .unwrap();

    // Fresh install: local state is gone, the authority still has the action
    h.store
        .save_recovery_state(&h.account, &RecoveryState::NotStarted)
        .unwrap();
    let reinstalled = h.recovery().await;
    let adopted = reinstalled
        .start_recovery(LostFactor::Hardware, surviving_proof(LostFactor::Hardware), None)
        .await
        .unwrap();

    assert_eq!(adopted.action_id(), started.action_id());
    assert_eq!(h.f8e.create_calls(), 1);
}

#[tokio::test]
async fn test_cancelled_from_other_device() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;
    let started = recovery
        .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), None)
        .await
        .unwrap();
    let id = started.action_id().unwrap().to_string();

    h.f8e.cancel_from_other_device(&id, Factor::Hardware);
    let status = recovery.poll().await.unwrap();
    assert_eq!(
        status.event,
        RecoveryEvent::CancelledElsewhere {
            by: Some(Factor::Hardware)
        }
    );
    assert!(matches!(status.state, RecoveryState::Cancelled(_)));
    assert_eq!(h.store.load_recovery_state(&h.account).unwrap(), status.state);
}

#[tokio::test]
async fn test_purged_action_reads_as_cancelled() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;
    let started = recovery
        .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), None)
        .await
        .unwrap();
    h.f8e.purge(started.action_id().unwrap());

    let status = recovery.poll().await.unwrap();
    assert_eq!(status.event, RecoveryEvent::CancelledElsewhere { by: None });
    assert!(matches!(status.state, RecoveryState::Cancelled(_)));
}

#[tokio::test]
async fn test_completed_elsewhere_is_reconciled() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;
    let started = recovery
        .start_recovery(LostFactor::Hardware, surviving_proof(LostFactor::Hardware), None)
        .await
        .unwrap();
    h.advance_secs(7 * DAY);
    h.f8e.complete_from_other_device(started.action_id().unwrap());

    let status = recovery.poll().await.unwrap();
    assert_eq!(status.event, RecoveryEvent::CompletedElsewhere);
    assert!(matches!(status.state, RecoveryState::Completed(_)));
}

#[tokio::test]
async fn test_cancel_with_nothing_in_progress() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;
    let result = recovery.cancel(Factor::App).await;
    assert!(matches!(result, Err(Error::NoRecoveryInProgress)));
}

#[tokio::test]
async fn test_lost_cancel_response_still_cancels() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;
    recovery
        .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), None)
        .await
        .unwrap();

    h.f8e.lose_next_write_response();
    let state = recovery.cancel(Factor::Hardware).await.unwrap();
    assert!(matches!(state, RecoveryState::Cancelled(_)));
    assert_eq!(h.f8e.cancel_calls(), 2);
}

#[tokio::test]
async fn test_lost_completion_response_resolved_on_resume() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;
    let started = recovery
        .start_recovery(LostFactor::Hardware, surviving_proof(LostFactor::Hardware), None)
        .await
        .unwrap();
    h.advance_secs(7 * DAY + 1);
    recovery.poll().await.unwrap();

    // The write lands, then every retry times out
    h.f8e.lose_next_write_response();
    h.f8e.fail_next(3);
    let result = recovery.complete(surviving_proof(LostFactor::Hardware)).await;
    assert!(result.unwrap_err().is_transient());
    assert!(matches!(recovery.state(), RecoveryState::Completing(_)));

    let restarted = h.recovery().await;
    assert!(matches!(restarted.state(), RecoveryState::Completing(_)));
    let status = restarted.resume().await.unwrap();
    assert_eq!(status.event, RecoveryEvent::CompletionConfirmed);
    match status.state {
        RecoveryState::Completed(c) => assert_eq!(Some(c.action_id.as_str()), started.action_id()),
        other => panic!("expected Completed, got {}", other.name()),
    }
    assert_eq!(h.f8e.complete_calls(), 1);
}

#[tokio::test]
async fn test_unapplied_completion_is_retried() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;
    recovery
        .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), None)
        .await
        .unwrap();
    h.advance_secs(7 * DAY + 1);
    recovery.poll().await.unwrap();

    h.f8e.fail_next(4);
    let result = recovery.complete(surviving_proof(LostFactor::App)).await;
    assert!(result.unwrap_err().is_transient());
    assert_eq!(h.f8e.complete_calls(), 0);

    let restarted = h.recovery().await;
    let status = restarted.resume().await.unwrap();
    assert_eq!(status.event, RecoveryEvent::CompletionNotApplied);
    assert!(matches!(status.state, RecoveryState::ReadyToComplete(_)));

    restarted
        .complete(surviving_proof(LostFactor::App))
        .await
        .unwrap();
    assert_eq!(h.f8e.complete_calls(), 1);
}

#[tokio::test]
async fn test_failed_state_write_leaves_recovery_unstarted_locally() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;

    h.store.fail_next_writes(1);
    let result = recovery
        .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), None)
        .await;
    assert!(matches!(result, Err(Error::Storage(_))));
    assert_eq!(recovery.state(), RecoveryState::NotStarted);

    // The action exists remotely; the retry adopts it
    let adopted = recovery
        .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), None)
        .await
        .unwrap();
    assert_eq!(adopted.action_id(), Some("action-1"));
    assert_eq!(h.f8e.create_calls(), 1);
}

#[tokio::test]
async fn test_out_of_band_recovery() {
    let h = Harness::out_of_band().await;
    let recovery = h.recovery().await;

    let started = recovery
        .start_recovery(LostFactor::Hardware, surviving_proof(LostFactor::Hardware), None)
        .await
        .unwrap();
    let active = started.active().unwrap().clone();
    assert_eq!(active.action.authorization_strategy, AuthorizationStrategy::OutOfBand);

    h.advance_secs(30 * DAY);
    let status = recovery.poll().await.unwrap();
    assert!(matches!(status.state, RecoveryState::InProgress(_)));

    h.f8e.approve_out_of_band(&active.action.id);
    let status = recovery.poll().await.unwrap();
    assert_eq!(status.event, RecoveryEvent::BecameReady);

    let completed = recovery
        .complete(surviving_proof(LostFactor::Hardware))
        .await
        .unwrap();
    assert_eq!(completed.action_id, active.action.id);
    assert_eq!(
        h.f8e.action(&active.action.id).unwrap().status,
        RemoteActionStatus::Completed
    );
}

#[tokio::test]
async fn test_out_of_band_cancel_sends_no_token() {
    let h = Harness::out_of_band().await;
    let recovery = h.recovery().await;
    recovery
        .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), None)
        .await
        .unwrap();

    let state = recovery.cancel(Factor::Hardware).await.unwrap();
    assert!(matches!(state, RecoveryState::Cancelled(_)));
}

#[tokio::test]
async fn test_subscribers_see_transitions() {
    let h = Harness::new().await;
    let recovery = h.recovery().await;
    let mut rx = recovery.subscribe();

    recovery
        .start_recovery(LostFactor::App, surviving_proof(LostFactor::App), None)
        .await
        .unwrap();
    rx.changed().await.unwrap();
    assert!(matches!(*rx.borrow_and_update(), RecoveryState::InProgress(_)));

    h.advance_secs(7 * DAY);
    recovery.poll().await.unwrap();
    rx.changed().await.unwrap();
    assert!(matches!(*rx.borrow_and_update(), RecoveryState::ReadyToComplete(_)));
}
