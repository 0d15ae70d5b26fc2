//! In-memory remote authority for tests
//!
//! Enforces the same rules the real server does for tokens, terminal actions,
//! key reuse and concurrent rotations, and exposes hooks to drive the
//! server-side events a test needs: out-of-band approval, cancellation from
//! another device, purging, transient failures and writes that land but whose
//! response is lost.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::bip32::Xpub;
use keybox_core::testing::test_xpub;
use keybox_core::{
    AccountId, AuthorizationStrategy, Clock, CompletionReceipt, CreatePrivilegedActionRequest,
    Error, F8eSpendingKeyset, Factor, LostFactor, PrivilegedActionInstance, PrivilegedActionType,
    ProofOfPossession, RemoteAction, RemoteActionStatus, Result, SpendingKeyset,
};
use parking_lot::Mutex;

use crate::service::{CreateKeysetRequest, KeysetService, PrivilegedActionService, RemoteKeyset};

struct StoredAction {
    account_id: AccountId,
    instance: PrivilegedActionInstance,
    status: RemoteActionStatus,
    canceled_by: Option<Factor>,
    purged: bool,
    keyset_created: bool,
}

impl StoredAction {
    fn view(&self, now: chrono::DateTime<chrono::Utc>) -> RemoteAction {
        let status = match (&self.status, &self.instance.authorization_strategy) {
            (
                RemoteActionStatus::Pending,
                AuthorizationStrategy::DelayAndNotify { delay_end_time, .. },
            ) if now >= *delay_end_time => RemoteActionStatus::Authorized,
            (status, _) => *status,
        };
        RemoteAction {
            instance: self.instance.clone(),
            status,
            canceled_by: self.canceled_by,
        }
    }
}

#[derive(Default)]
struct Calls {
    create: u32,
    cancel: u32,
    complete: u32,
    create_keyset: u32,
}

struct FakeState {
    delay: chrono::Duration,
    out_of_band: bool,
    next_id: u64,
    next_server_key: u8,
    actions: BTreeMap<String, StoredAction>,
    keysets: HashMap<AccountId, Vec<RemoteKeyset>>,
    transient_failures: u32,
    lose_next_write_response: bool,
    keyset_conflict: bool,
    calls: Calls,
}

/// In-memory f8e
pub struct FakeF8e {
    clock: Arc<dyn Clock>,
    state: Mutex<FakeState>,
}

impl FakeF8e {
    /// Authority granting 7-day delay-and-notify recoveries
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(FakeState {
                delay: chrono::Duration::days(7),
                out_of_band: false,
                next_id: 1,
                next_server_key: 200,
                actions: BTreeMap::new(),
                keysets: HashMap::new(),
                transient_failures: 0,
                lose_next_write_response: false,
                keyset_conflict: false,
                calls: Calls::default(),
            }),
        }
    }

    /// Set the delay window for new actions
    pub fn with_delay(self, delay: chrono::Duration) -> Self {
        self.state.lock().delay = delay;
        self
    }

    /// Grant new actions out-of-band instead of delay-and-notify
    pub fn with_out_of_band(self) -> Self {
        self.state.lock().out_of_band = true;
        self
    }

    /// Record `keyset` as the account's active keyset
    pub fn register_keyset(&self, account_id: &AccountId, keyset: &SpendingKeyset) {
        let mut state = self.state.lock();
        let keysets = state.keysets.entry(account_id.clone()).or_default();
        for existing in keysets.iter_mut() {
            existing.active = false;
        }
        keysets.push(RemoteKeyset {
            keyset_id: keyset.f8e_spending_keyset.keyset_id.clone(),
            network: keyset.network_type,
            app_spending_public_key: keyset.app_key,
            hardware_spending_public_key: keyset.hardware_key,
            server_spending_public_key: keyset.f8e_spending_keyset.spending_public_key,
            active: true,
            completed_action_id: None,
        });
    }

    /// Record the side-channel proof for an out-of-band action
    pub fn approve_out_of_band(&self, action_id: &str) {
        if let Some(action) = self.state.lock().actions.get_mut(action_id) {
            if action.status == RemoteActionStatus::Pending {
                action.status = RemoteActionStatus::Authorized;
            }
        }
    }

    /// Cancel an action as another device would
    pub fn cancel_from_other_device(&self, action_id: &str, by: Factor) {
        if let Some(action) = self.state.lock().actions.get_mut(action_id) {
            if !action.status.is_terminal() {
                action.status = RemoteActionStatus::Canceled;
                action.canceled_by = Some(by);
            }
        }
    }

    /// Complete an action as another device would
    pub fn complete_from_other_device(&self, action_id: &str) {
        if let Some(action) = self.state.lock().actions.get_mut(action_id) {
            if !action.status.is_terminal() {
                action.status = RemoteActionStatus::Completed;
            }
        }
    }

    /// Forget a terminal action; polls return nothing afterwards
    pub fn purge(&self, action_id: &str) {
        if let Some(action) = self.state.lock().actions.get_mut(action_id) {
            action.purged = true;
        }
    }

    /// Fail the next `n` calls with a transient network error
    pub fn fail_next(&self, n: u32) {
        self.state.lock().transient_failures = n;
    }

    /// Apply the next write (action or keyset) but report a network error
    pub fn lose_next_write_response(&self) {
        self.state.lock().lose_next_write_response = true;
    }

    /// Reject the next keyset registration as a concurrent rotation
    pub fn inject_keyset_conflict(&self) {
        self.state.lock().keyset_conflict = true;
    }

    /// Server view of an action, ignoring purges
    pub fn action(&self, action_id: &str) -> Option<RemoteAction> {
        let now = self.clock.now();
        self.state.lock().actions.get(action_id).map(|a| a.view(now))
    }

    /// Number of create calls that reached the server
    pub fn create_calls(&self) -> u32 {
        self.state.lock().calls.create
    }

    /// Number of cancel calls that reached the server
    pub fn cancel_calls(&self) -> u32 {
        self.state.lock().calls.cancel
    }

    /// Number of complete calls that reached the server
    pub fn complete_calls(&self) -> u32 {
        self.state.lock().calls.complete
    }

    /// Number of keyset registrations that reached the server
    pub fn create_keyset_calls(&self) -> u32 {
        self.state.lock().calls.create_keyset
    }

    /// Keysets on record for an account
    pub fn keysets(&self, account_id: &AccountId) -> Vec<RemoteKeyset> {
        self.state
            .lock()
            .keysets
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl FakeState {
    fn take_transient_failure(&mut self) -> Result<()> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(Error::Network("connection reset by peer".to_string()));
        }
        Ok(())
    }

    /// Turns a successful write into a lost response when armed
    fn respond<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_ok() && self.lose_next_write_response {
            self.lose_next_write_response = false;
            return Err(Error::Network("response lost after request was applied".to_string()));
        }
        result
    }

    fn visible_action(&mut self, account_id: &AccountId, action_id: &str) -> Result<&mut StoredAction> {
        match self.actions.get_mut(action_id) {
            Some(action) if action.account_id == *account_id && !action.purged => Ok(action),
            _ => Err(Error::NotFound(format!("privileged action {}", action_id))),
        }
    }

    fn key_in_use(&self, account_id: &AccountId, key: &Xpub) -> bool {
        self.keysets
            .get(account_id)
            .is_some_and(|keysets| keysets.iter().any(|k| k.contains_key(key)))
    }
}

#[async_trait]
impl PrivilegedActionService for FakeF8e {
    async fn create_privileged_action(
        &self,
        account_id: &AccountId,
        request: &CreatePrivilegedActionRequest,
    ) -> Result<PrivilegedActionInstance> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.take_transient_failure()?;
        state.calls.create += 1;

        if let Some(lost) = LostFactor::from_action_type(request.privileged_action_type) {
            if !request.proof.proves(lost.surviving_factor()) {
                return Err(Error::MissingProof(format!(
                    "{} recovery requires {} proof",
                    lost,
                    lost.surviving_factor()
                )));
            }
        } else if request.proof.is_empty() {
            return Err(Error::MissingProof("no factor proven".to_string()));
        }

        let in_flight = state.actions.values().any(|a| {
            a.account_id == *account_id
                && a.instance.privileged_action_type == request.privileged_action_type
                && !a.status.is_terminal()
        });
        if in_flight {
            return Err(Error::ActionInFlight(request.privileged_action_type.to_string()));
        }

        if let Some(key) = &request.new_factor_public_key {
            if state.key_in_use(account_id, key) {
                return Err(Error::KeyReuse("new factor key already in a keyset".to_string()));
            }
        }

        let id = format!("action-{}", state.next_id);
        state.next_id += 1;

        let authorization_strategy = if state.out_of_band {
            AuthorizationStrategy::OutOfBand
        } else {
            AuthorizationStrategy::DelayAndNotify {
                delay_start_time: now,
                delay_end_time: now + state.delay,
                cancellation_token: format!("cancel-{}", id),
                completion_token: format!("complete-{}", id),
            }
        };
        let instance = PrivilegedActionInstance {
            id: id.clone(),
            privileged_action_type: request.privileged_action_type,
            authorization_strategy,
        };

        state.actions.insert(
            id,
            StoredAction {
                account_id: account_id.clone(),
                instance: instance.clone(),
                status: RemoteActionStatus::Pending,
                canceled_by: None,
                purged: false,
                keyset_created: false,
            },
        );

        state.respond(Ok(instance))
    }

    async fn list_privileged_actions(
        &self,
        account_id: &AccountId,
        action_type: PrivilegedActionType,
    ) -> Result<Vec<RemoteAction>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.take_transient_failure()?;

        Ok(state
            .actions
            .values()
            .filter(|a| {
                a.account_id == *account_id
                    && a.instance.privileged_action_type == action_type
                    && !a.purged
            })
            .map(|a| a.view(now))
            .collect())
    }

    async fn get_privileged_action(
        &self,
        account_id: &AccountId,
        action_id: &str,
    ) -> Result<Option<RemoteAction>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.take_transient_failure()?;

        match state.visible_action(account_id, action_id) {
            Ok(action) => Ok(Some(action.view(now))),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn cancel_privileged_action(
        &self,
        account_id: &AccountId,
        action_id: &str,
        cancellation_token: Option<&str>,
        canceled_by: Factor,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.take_transient_failure()?;
        state.calls.cancel += 1;

        let action = state.visible_action(account_id, action_id)?;
        match action.status {
            RemoteActionStatus::Canceled => {
                return Err(Error::TokenAlreadyConsumed(format!(
                    "{} was already cancelled",
                    action_id
                )))
            }
            RemoteActionStatus::Completed => {
                return Err(Error::AlreadyTerminal(format!("{} is completed", action_id)))
            }
            RemoteActionStatus::Pending | RemoteActionStatus::Authorized => {}
        }
        if let AuthorizationStrategy::DelayAndNotify {
            cancellation_token: expected,
            ..
        } = &action.instance.authorization_strategy
        {
            if cancellation_token != Some(expected.as_str()) {
                return Err(Error::TokenInvalid(format!(
                    "cancellation token does not match {}",
                    action_id
                )));
            }
        }

        action.status = RemoteActionStatus::Canceled;
        action.canceled_by = Some(canceled_by);
        tracing::debug!("fake f8e: {} cancelled by {}", action_id, canceled_by);

        state.respond(Ok(()))
    }

    async fn complete_privileged_action(
        &self,
        account_id: &AccountId,
        action_id: &str,
        completion_token: Option<&str>,
        proof: &ProofOfPossession,
    ) -> Result<CompletionReceipt> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.take_transient_failure()?;
        state.calls.complete += 1;

        let action = state.visible_action(account_id, action_id)?;
        if action.status.is_terminal() {
            return Err(Error::AlreadyTerminal(format!(
                "{} is already {:?}",
                action_id, action.status
            )));
        }
        if proof.is_empty() {
            return Err(Error::MissingProof("completion requires proof".to_string()));
        }
        let authorized = action.view(now).status == RemoteActionStatus::Authorized;
        match &action.instance.authorization_strategy {
            AuthorizationStrategy::DelayAndNotify {
                completion_token: expected,
                ..
            } => {
                if completion_token != Some(expected.as_str()) {
                    return Err(Error::TokenInvalid(format!(
                        "completion token does not match {}",
                        action_id
                    )));
                }
                if !authorized {
                    return Err(Error::RemoteRejected("delay window has not elapsed".to_string()));
                }
            }
            AuthorizationStrategy::OutOfBand => {
                if !authorized {
                    return Err(Error::RemoteRejected(
                        "out-of-band approval not recorded".to_string(),
                    ));
                }
            }
        }

        action.status = RemoteActionStatus::Completed;
        let receipt = CompletionReceipt {
            action_id: action_id.to_string(),
            privileged_action_type: action.instance.privileged_action_type,
            completed_at: now,
        };

        state.respond(Ok(receipt))
    }
}

#[async_trait]
impl KeysetService for FakeF8e {
    async fn create_keyset(
        &self,
        account_id: &AccountId,
        request: &CreateKeysetRequest,
    ) -> Result<F8eSpendingKeyset> {
        let mut state = self.state.lock();
        state.take_transient_failure()?;
        state.calls.create_keyset += 1;

        if state.keyset_conflict {
            state.keyset_conflict = false;
            return Err(Error::StaleRotation("another rotation committed first".to_string()));
        }

        let action = state.visible_action(account_id, &request.completed_action_id)?;
        let lost = LostFactor::from_action_type(action.instance.privileged_action_type)
            .filter(|_| action.status == RemoteActionStatus::Completed)
            .ok_or_else(|| {
                Error::RemoteRejected(format!(
                    "{} is not a completed recovery",
                    request.completed_action_id
                ))
            })?;
        if action.keyset_created {
            return Err(Error::StaleRotation(format!(
                "keyset already created for {}",
                request.completed_action_id
            )));
        }

        let new_key = match lost {
            LostFactor::App => request.app_spending_public_key,
            LostFactor::Hardware => request.hardware_spending_public_key,
        };
        if state.key_in_use(account_id, &new_key) {
            return Err(Error::KeyReuse(format!("{} key already in a keyset", lost)));
        }

        if let Some(action) = state.actions.get_mut(&request.completed_action_id) {
            action.keyset_created = true;
        }

        let server_key = test_xpub(state.next_server_key);
        state.next_server_key = state.next_server_key.wrapping_add(1);
        let keyset_id = format!("f8e-keyset-{}", uuid::Uuid::new_v4());

        let keysets = state.keysets.entry(account_id.clone()).or_default();
        for existing in keysets.iter_mut() {
            existing.active = false;
        }
        keysets.push(RemoteKeyset {
            keyset_id: keyset_id.clone(),
            network: request.network,
            app_spending_public_key: request.app_spending_public_key,
            hardware_spending_public_key: request.hardware_spending_public_key,
            server_spending_public_key: server_key,
            active: true,
            completed_action_id: Some(request.completed_action_id.clone()),
        });

        state.respond(Ok(F8eSpendingKeyset {
            keyset_id,
            spending_public_key: server_key,
        }))
    }

    async fn list_keysets(&self, account_id: &AccountId) -> Result<Vec<RemoteKeyset>> {
        let mut state = self.state.lock();
        state.take_transient_failure()?;
        Ok(state.keysets.get(account_id).cloned().unwrap_or_default())
    }
}
