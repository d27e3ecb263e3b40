use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use alloy::primitives::Address;
use dashmap::DashMap;
use keeper_core::{chain::Chain, error::EngineError};
use serde::Serialize;

/// Nonce state is tracked per keeper per chain.
pub type KeeperKey = (u64, Address);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeeperState {
    pub chain_id: u64,
    pub address: Address,
    /// Last nonce handed out. Only meaningful while `active_leases > 0`.
    pub current_nonce: u64,
    pub active_leases: u64,
}

impl KeeperState {
    pub fn new(chain_id: u64, address: Address) -> Self {
        Self {
            chain_id,
            address,
            current_nonce: 0,
            active_leases: 0,
        }
    }
}

#[derive(Debug)]
struct KeeperSlot {
    state: Mutex<KeeperState>,
    // Serializes first-lease decisions, which need a ledger round trip.
    sync_gate: tokio::sync::Mutex<()>,
}

impl KeeperSlot {
    fn new((chain_id, address): KeeperKey) -> Self {
        Self {
            state: Mutex::new(KeeperState::new(chain_id, address)),
            sync_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, KeeperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues `current_nonce + 1` if another lease is outstanding.
    fn try_issue_next(&self) -> Option<u64> {
        let mut state = self.state();
        if state.active_leases == 0 {
            return None;
        }
        state.current_nonce += 1;
        state.active_leases += 1;
        Some(state.current_nonce)
    }

    fn issue_first(&self, pending_nonce: u64) {
        let mut state = self.state();
        state.current_nonce = pending_nonce;
        state.active_leases = 1;
    }

    fn release(&self) -> KeeperState {
        let mut state = self.state();
        state.active_leases = state.active_leases.saturating_sub(1);
        *state
    }
}

/// Hands out nonces for keeper addresses without asking the ledger while a lease is
/// outstanding.
///
/// Leases are optimistic: a lease that is released without its transaction ever reaching
/// the mempool leaves a gap, and later nonces wait behind it until the pool drains and the
/// next first lease re-reads the pending nonce.
#[derive(Clone, Default)]
pub struct NonceAllocator {
    keepers: Arc<DashMap<KeeperKey, Arc<KeeperSlot>>>,
}

impl NonceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: KeeperKey) -> Arc<KeeperSlot> {
        self.keepers
            .entry(key)
            .or_insert_with(|| Arc::new(KeeperSlot::new(key)))
            .clone()
    }

    pub fn state(&self, chain_id: u64, address: Address) -> Option<KeeperState> {
        self.keepers.get(&(chain_id, address)).map(|slot| {
            let state = *slot.state();
            state
        })
    }

    #[tracing::instrument(skip_all, fields(chain_id = chain.chain_id(), keeper = ?address))]
    pub async fn lease<C: Chain>(
        &self,
        chain: &C,
        address: Address,
    ) -> Result<NonceLease, EngineError> {
        let key = (chain.chain_id(), address);
        let slot = self.slot(key);

        if let Some(nonce) = slot.try_issue_next() {
            tracing::debug!(nonce, "Issued optimistic nonce");
            return Ok(NonceLease::new(key, nonce, slot));
        }

        let _gate = slot.sync_gate.lock().await;

        // Someone else may have synced while we waited for the gate.
        if let Some(nonce) = slot.try_issue_next() {
            tracing::debug!(nonce, "Issued optimistic nonce after waiting for sync");
            return Ok(NonceLease::new(key, nonce, slot.clone()));
        }

        let nonce = chain.pending_nonce(address).await.inspect_err(|e| {
            tracing::warn!(error = ?e, "Failed to fetch pending nonce, no lease issued");
        })?;
        slot.issue_first(nonce);

        tracing::debug!(nonce, "Synced nonce from ledger");
        Ok(NonceLease::new(key, nonce, slot.clone()))
    }
}

/// A leased nonce. Released exactly once, either explicitly or on drop.
#[derive(Debug)]
pub struct NonceLease {
    key: KeeperKey,
    nonce: u64,
    slot: Option<Arc<KeeperSlot>>,
}

impl NonceLease {
    fn new(key: KeeperKey, nonce: u64, slot: Arc<KeeperSlot>) -> Self {
        Self {
            key,
            nonce,
            slot: Some(slot),
        }
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn address(&self) -> Address {
        self.key.1
    }

    pub fn chain_id(&self) -> u64 {
        self.key.0
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(slot) = self.slot.take() {
            let state = slot.release();
            tracing::debug!(
                chain_id = self.key.0,
                keeper = ?self.key.1,
                nonce = self.nonce,
                active_leases = state.active_leases,
                "Released nonce lease"
            );
        }
    }
}

impl Drop for NonceLease {
    fn drop(&mut self) {
        self.release_once();
    }
}
