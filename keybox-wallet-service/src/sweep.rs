//! Sweep service
//!
//! Finds funds left on keysets that are no longer active and moves them to
//! the active keyset. Sweeps are rebuilt from the chain every time and never
//! stored: an interrupted sweep is simply prepared again.

use std::collections::HashSet;
use std::sync::Arc;

use bitcoin::Txid;
use keybox_chain::{ChainSource, KeysetScanner};
use keybox_core::fees::FeePriority;
use keybox_core::{
    AccountId, Error, KeyChain, Keybox, KeysetFunds, Result, RetryConfig, SpendingKeyset, Sweep,
    SweepGenerator,
};
use keybox_f8e::KeysetService;
use keybox_params::Network;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::rotation::load_active_keybox;
use crate::signer::{verify_signed, PsbtSigner};
use crate::store::{run_blocking, WalletStore};

/// Prepares and broadcasts sweeps for one account
pub struct SweepService {
    account_id: AccountId,
    network: Network,
    store: Arc<dyn WalletStore>,
    keysets: Arc<dyn KeysetService>,
    chain: Arc<dyn ChainSource>,
    scanner: KeysetScanner,
    generator: SweepGenerator,
    fee_priority: FeePriority,
    retry: RetryConfig,
    sweep_required: watch::Sender<bool>,
}

impl SweepService {
    /// Create a sweep service
    pub fn new(
        account_id: AccountId,
        network: Network,
        store: Arc<dyn WalletStore>,
        keysets: Arc<dyn KeysetService>,
        chain: Arc<dyn ChainSource>,
    ) -> Self {
        let (sweep_required, _) = watch::channel(false);
        Self {
            account_id,
            scanner: KeysetScanner::new(Arc::clone(&chain)),
            generator: SweepGenerator::new(network.clone()),
            network,
            store,
            keysets,
            chain,
            fee_priority: FeePriority::default(),
            retry: RetryConfig::default(),
            sweep_required,
        }
    }

    /// Fee policy, shared with regular sends
    pub fn with_fee_priority(mut self, fee_priority: FeePriority) -> Self {
        self.fee_priority = fee_priority;
        self
    }

    /// Gap limit for scanning stale keysets
    pub fn with_gap_limit(mut self, gap_limit: u32) -> Self {
        self.scanner = KeysetScanner::new(Arc::clone(&self.chain)).with_gap_limit(gap_limit);
        self
    }

    /// Retry policy for the server keyset listing
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Whether the last check found funds to sweep
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sweep_required.subscribe()
    }

    /// Re-scan stale keysets and publish whether a sweep is needed
    pub async fn check_for_sweeps(&self) -> Result<bool> {
        let keybox = load_active_keybox(&self.store, &self.account_id).await?;
        let required = self.prepare_sweep(&keybox).await?.is_some();
        Ok(required)
    }

    /// Build the sweep of every stale keyset into `active_keybox`.
    ///
    /// `None` when there is nothing worth sweeping. Fails with `StaleSweep`
    /// if `active_keybox` is not the stored active keyset.
    pub async fn prepare_sweep(&self, active_keybox: &Keybox) -> Result<Option<Sweep>> {
        let active = self.current_active(active_keybox).await?;
        let candidates = self.stale_keysets(&active).await?;

        let mut funds = Vec::with_capacity(candidates.len());
        for keyset in &candidates {
            let scanned = self.scanner.scan(keyset).await?;
            if !scanned.utxos.is_empty() {
                funds.push(scanned);
            }
        }

        let sweep = if funds.is_empty() {
            None
        } else {
            let destination = self.destination(&active).await?;
            let estimate = self
                .chain
                .fee_rate(self.fee_priority.target_blocks())
                .await?;
            let fee_rate = self.fee_priority.apply(estimate);
            self.generator
                .generate(&funds, &active, &destination, fee_rate)?
        };

        debug!(
            "Sweep check for {}: {} stale keysets, {} funded, sweep {}",
            self.account_id,
            candidates.len(),
            funds.len(),
            if sweep.is_some() { "required" } else { "not required" }
        );
        self.sweep_required.send_replace(sweep.is_some());
        Ok(sweep)
    }

    /// Sign and broadcast a prepared sweep.
    ///
    /// The sweep is discarded with `StaleSweep` if the active keyset changed
    /// since it was prepared.
    pub async fn sign_and_broadcast(
        &self,
        active_keybox: &Keybox,
        sweep: &Sweep,
        signer: &dyn PsbtSigner,
    ) -> Result<Vec<Txid>> {
        let active = self.current_active(active_keybox).await?;
        if !sweep.targets(&active) {
            return Err(Error::StaleSweep(format!(
                "sweep targets keyset {}, active keyset is {}",
                sweep.destination_keyset_id, active.local_id
            )));
        }

        let mut txids = Vec::with_capacity(sweep.psbts.len());
        for entry in &sweep.psbts {
            let tx = signer.sign_psbt(&entry.psbt).await?;
            verify_signed(&entry.psbt, &tx)?;
            let txid = self.chain.broadcast(&tx).await?;
            info!(
                "Swept {} sats from keyset {} in {}",
                entry.output_amount.to_sat(),
                entry.source_keyset_id,
                txid
            );
            txids.push(txid);
        }

        if let Err(e) = self.check_for_sweeps().await {
            warn!("Sweep re-check after broadcast failed: {}", e);
        }
        Ok(txids)
    }

    /// Stored active keyset, which must match the caller's keybox
    async fn current_active(&self, active_keybox: &Keybox) -> Result<SpendingKeyset> {
        if active_keybox.account_id != self.account_id {
            return Err(Error::InvariantViolation(format!(
                "keybox for {} passed to sweep service of {}",
                active_keybox.account_id, self.account_id
            )));
        }
        let stored = load_active_keybox(&self.store, &self.account_id).await?;
        if !stored
            .active_spending_keyset
            .same_keys(&active_keybox.active_spending_keyset)
        {
            return Err(Error::StaleSweep(format!(
                "keyset {} is no longer active",
                active_keybox.active_spending_keyset.local_id
            )));
        }
        Ok(stored.active_spending_keyset)
    }

    /// Every known keyset other than `active`, local ones first.
    ///
    /// Fails with `StaleSweep` when the server reports a different active
    /// keyset, so a keyset the server considers active is never a source.
    async fn stale_keysets(&self, active: &SpendingKeyset) -> Result<Vec<SpendingKeyset>> {
        let id = self.account_id.clone();
        let local = run_blocking(&self.store, move |s| s.list_keysets(&id)).await?;

        let mut keysets: Vec<SpendingKeyset> = local
            .into_iter()
            .map(|stored| stored.keyset)
            .filter(|keyset| !keyset.same_keys(active))
            .collect();

        let remote = keybox_core::with_retry(&self.retry, "list keysets", || {
            self.keysets.list_keysets(&self.account_id)
        })
        .await;
        match remote {
            Ok(remote) => {
                let remote: Vec<SpendingKeyset> = remote
                    .iter()
                    .filter(|k| k.network == self.network.network_type)
                    .map(|k| {
                        if k.active && !k.spending_keyset().same_keys(active) {
                            return Err(Error::StaleSweep(format!(
                                "server keyset {} is active, local active keyset is {}",
                                k.keyset_id, active.local_id
                            )));
                        }
                        Ok(k.spending_keyset())
                    })
                    .collect::<Result<_>>()?;

                let known: HashSet<String> = keysets
                    .iter()
                    .map(|k| k.f8e_spending_keyset.keyset_id.clone())
                    .collect();
                for keyset in remote {
                    if known.contains(&keyset.f8e_spending_keyset.keyset_id) || keyset.same_keys(active) {
                        continue;
                    }
                    debug!("Including server-only keyset {} in sweep scan", keyset.local_id);
                    keysets.push(keyset);
                }
            }
            Err(e) => warn!(
                "Server keyset listing unavailable for {}, sweeping local keysets only: {}",
                self.account_id, e
            ),
        }

        Ok(keysets)
    }

    /// Next unused receive address of the active keyset
    async fn destination(&self, active: &SpendingKeyset) -> Result<bitcoin::Address> {
        let scanned: KeysetFunds = self.scanner.scan(active).await?;
        active.address(KeyChain::Receive, scanned.next_receive_index)
    }
}
