//! Shared fixture: one account on a fake authority and a fake chain

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bitcoin::bip32::Xpub;
use chrono::{DateTime, TimeZone, Utc};
use keybox_chain::FakeChain;
use keybox_core::testing::{test_keyset, test_xpub};
use keybox_core::{
    AccountId, CompletedRecovery, KeyChain, Keybox, LostFactor, ManualClock, ProofOfPossession,
    RetryConfig, SpendingKeyset,
};
use keybox_f8e::FakeF8e;
use keybox_params::{Network, NetworkType};
use keybox_wallet_service::{
    load_active_keybox, AccountLocks, KeyRotationService, MemoryStore, PrivilegedActionRegistry,
    RecoveryService, SweepService, WalletStore,
};

pub const DAY: i64 = 86_400;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 4,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        backoff_multiplier: 2.0,
    }
}

/// Proof by the factor that survives losing `lost`
pub fn surviving_proof(lost: LostFactor) -> ProofOfPossession {
    match lost {
        LostFactor::App => ProofOfPossession::hardware("hw-signature"),
        LostFactor::Hardware => ProofOfPossession::app("app-signature"),
    }
}

pub struct Harness {
    pub clock: ManualClock,
    pub f8e: Arc<FakeF8e>,
    pub chain: Arc<FakeChain>,
    pub store: Arc<MemoryStore>,
    pub locks: AccountLocks,
    pub account: AccountId,
    pub initial: SpendingKeyset,
}

impl Harness {
    pub async fn new() -> Self {
        let clock = ManualClock::new(t0());
        let f8e = Arc::new(FakeF8e::new(Arc::new(clock.clone())));
        Self::with_f8e(clock, f8e).await
    }

    pub async fn out_of_band() -> Self {
        let clock = ManualClock::new(t0());
        let f8e = Arc::new(FakeF8e::new(Arc::new(clock.clone())).with_out_of_band());
        Self::with_f8e(clock, f8e).await
    }

    async fn with_f8e(clock: ManualClock, f8e: Arc<FakeF8e>) -> Self {
        let harness = Self {
            clock,
            f8e,
            chain: Arc::new(FakeChain::new()),
            store: Arc::new(MemoryStore::new()),
            locks: AccountLocks::new(),
            account: AccountId::new("account-1"),
            initial: test_keyset(1, NetworkType::Regtest),
        };
        harness.f8e.register_keyset(&harness.account, &harness.initial);
        harness
            .rotation()
            .import_keyset(harness.initial.clone())
            .await
            .unwrap();
        harness
    }

    pub fn network(&self) -> Network {
        Network::regtest()
    }

    pub fn store(&self) -> Arc<dyn WalletStore> {
        self.store.clone()
    }

    pub fn registry(&self) -> Arc<PrivilegedActionRegistry> {
        Arc::new(PrivilegedActionRegistry::new(
            self.f8e.clone(),
            Arc::new(self.clock.clone()),
            fast_retry(),
        ))
    }

    /// A fresh service over the shared store, as after an app restart
    pub async fn recovery(&self) -> RecoveryService {
        RecoveryService::open(
            self.account.clone(),
            self.registry(),
            self.store(),
            self.locks.clone(),
            Arc::new(self.clock.clone()),
        )
        .await
        .unwrap()
    }

    pub fn rotation(&self) -> KeyRotationService {
        KeyRotationService::new(
            self.account.clone(),
            self.f8e.clone(),
            self.store(),
            self.locks.clone(),
            fast_retry(),
        )
    }

    pub fn sweeps(&self) -> SweepService {
        SweepService::new(
            self.account.clone(),
            self.network(),
            self.store(),
            self.f8e.clone(),
            self.chain.clone(),
        )
        .with_gap_limit(5)
        .with_retry(fast_retry())
    }

    pub async fn active_keybox(&self) -> Keybox {
        load_active_keybox(&self.store(), &self.account).await.unwrap()
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    /// Fund the first receive address of `keyset`
    pub fn fund(&self, keyset: &SpendingKeyset, sats: u64) {
        let address = keyset.address(KeyChain::Receive, 0).unwrap();
        self.chain.fund(&address, bitcoin::Amount::from_sat(sats));
    }

    /// Run a full delay-and-notify recovery of `lost` to completion
    pub async fn completed_recovery(&self, lost: LostFactor, new_key_tag: u8) -> CompletedRecovery {
        self.completed_recovery_with(lost, Some(test_xpub(new_key_tag)))
            .await
    }

    /// As [`Harness::completed_recovery`], optionally without a declared key
    pub async fn completed_recovery_with(
        &self,
        lost: LostFactor,
        new_key: Option<Xpub>,
    ) -> CompletedRecovery {
        let recovery = self.recovery().await;
        recovery
            .start_recovery(lost, surviving_proof(lost), new_key)
            .await
            .unwrap();
        self.advance_secs(7 * DAY + 1);
        recovery.poll().await.unwrap();
        recovery.complete(surviving_proof(lost)).await.unwrap()
    }
}
