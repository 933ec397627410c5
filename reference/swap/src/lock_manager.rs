//! Local handles on escrow locks and the per-node lock registry.
//!
//! A lock moves `Escrowed -> IntentRegistered -> Reverted` or
//! `Escrowed -> Released`. Each handle type only offers the transitions valid
//! from its phase, and transitions take the handle by value.

use std::ops::Deref;

use chrono::Duration;
use crossnotary_common::{NotaryId, RequestId, Result, SwapError, Timestamp};
use crossnotary_crypto::SecureHash;
use crossnotary_ledger::{SignedTransaction, StateAndRef, StateRef, TokenState, WireTransaction};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::lock::{LockPhase, LockState};
use crate::metrics::SharedMetrics;

/// A lock output and the token outputs it encumbers.
#[derive(Debug)]
pub struct LockedStates {
    lock_id: SecureHash,
    request_id: RequestId,
    lock: LockState,
    lock_ref: StateAndRef,
    escrowed: Vec<StateAndRef>,
}

impl LockedStates {
    fn from_transaction(lock_id: SecureHash, request_id: RequestId, tx: &WireTransaction) -> Result<Self> {
        let (index, lock) = match tx.outputs_of::<LockState>()?.as_slice() {
            [(index, lock)] => (*index, lock.clone()),
            _ => {
                return Err(SwapError::ValidationFailure(format!(
                    "transaction {} must create exactly one lock",
                    tx.id().short()
                )))
            }
        };

        let refs = tx.out_refs();
        let escrowed: Vec<StateAndRef> = refs
            .iter()
            .filter(|state| state.state.encumbrance == Some(index))
            .cloned()
            .collect();
        if escrowed.is_empty() {
            return Err(SwapError::ValidationFailure(format!(
                "lock in {} encumbers no tokens",
                tx.id().short()
            )));
        }

        Ok(Self {
            lock_id,
            request_id,
            lock,
            lock_ref: refs[index as usize].clone(),
            escrowed,
        })
    }

    /// Id of the escrow transaction that created the lock. Stable across
    /// the revert intent re-issue.
    pub fn lock_id(&self) -> SecureHash {
        self.lock_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn lock(&self) -> &LockState {
        &self.lock
    }

    pub fn lock_ref(&self) -> &StateAndRef {
        &self.lock_ref
    }

    pub fn escrowed(&self) -> &[StateAndRef] {
        &self.escrowed
    }

    /// Notary of the escrow domain.
    pub fn notary(&self) -> &NotaryId {
        &self.lock_ref.state.notary
    }

    pub fn deadline(&self) -> Timestamp {
        self.lock.deadline
    }

    pub fn escrowed_tokens(&self) -> Result<Vec<TokenState>> {
        Ok(self
            .escrowed
            .iter()
            .map(|state| state.decode::<TokenState>())
            .collect::<crossnotary_ledger::Result<Vec<_>>>()?)
    }

    /// Every input `stx` consumes, lock first.
    pub fn consumed_refs(&self) -> Vec<StateRef> {
        std::iter::once(&self.lock_ref)
            .chain(self.escrowed.iter())
            .map(|state| state.state_ref)
            .collect()
    }

    /// Fail unless `stx` consumes exactly the lock and its tokens.
    pub fn check_spends_escrow(&self, stx: &SignedTransaction) -> Result<()> {
        let mut consumed = stx.tx.inputs.clone();
        let mut expected = self.consumed_refs();
        consumed.sort();
        expected.sort();
        if consumed != expected {
            return Err(SwapError::ValidationFailure(format!(
                "{} does not consume exactly the escrow of lock {}",
                stx.id().short(),
                self.lock_id.short()
            )));
        }
        Ok(())
    }

    fn require_consumed_by(&self, stx: &SignedTransaction) -> Result<()> {
        if !stx.tx.inputs.contains(&self.lock_ref.state_ref) {
            return Err(SwapError::ConsistencyFault(format!(
                "transaction {} does not consume lock {}",
                stx.id().short(),
                self.lock_ref.state_ref
            )));
        }
        Ok(())
    }
}

/// A lock that can still be released, or reverted once expired.
#[derive(Debug)]
pub struct EscrowedLock(LockedStates);

impl EscrowedLock {
    /// Handle on the lock created by escrow transaction `stx`.
    pub fn from_escrow(request_id: RequestId, stx: &SignedTransaction) -> Result<Self> {
        let states = LockedStates::from_transaction(stx.id(), request_id, &stx.tx)?;
        if states.lock.phase != LockPhase::Escrowed {
            return Err(SwapError::ValidationFailure(
                "new lock is not in phase ESCROWED".to_string(),
            ));
        }
        Ok(Self(states))
    }

    /// The lock was re-issued by revert intent `stx`.
    pub fn intent_registered(self, stx: &SignedTransaction) -> Result<IntentRegisteredLock> {
        self.0.require_consumed_by(stx)?;
        let states = LockedStates::from_transaction(self.0.lock_id, self.0.request_id, &stx.tx)?;
        if states.lock != self.0.lock.with_phase(LockPhase::RevertIntentRegistered) {
            return Err(SwapError::ConsistencyFault(
                "revert intent changed more than the lock phase".to_string(),
            ));
        }
        Ok(IntentRegisteredLock(states))
    }

    /// The lock was consumed by release `stx`.
    pub fn released(self, stx: &SignedTransaction) -> Result<ReleasedLock> {
        self.0.require_consumed_by(stx)?;
        Ok(ReleasedLock {
            lock_id: self.0.lock_id,
            request_id: self.0.request_id,
            release_tx_id: stx.id(),
        })
    }
}

impl Deref for EscrowedLock {
    type Target = LockedStates;

    fn deref(&self) -> &LockedStates {
        &self.0
    }
}

/// A lock whose deadline passed and whose revert was announced.
#[derive(Debug)]
pub struct IntentRegisteredLock(LockedStates);

impl IntentRegisteredLock {
    /// The lock was consumed by revert `stx`.
    pub fn reverted(self, stx: &SignedTransaction) -> Result<RevertedLock> {
        self.0.require_consumed_by(stx)?;
        Ok(RevertedLock {
            lock_id: self.0.lock_id,
            request_id: self.0.request_id,
            revert_tx_id: stx.id(),
        })
    }
}

impl Deref for IntentRegisteredLock {
    type Target = LockedStates;

    fn deref(&self) -> &LockedStates {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedLock {
    pub lock_id: SecureHash,
    pub request_id: RequestId,
    pub release_tx_id: SecureHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertedLock {
    pub lock_id: SecureHash,
    pub request_id: RequestId,
    pub revert_tx_id: SecureHash,
}

/// Lock status as recorded by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Escrowed,
    IntentRegistered,
    Released,
    Reverted,
}

impl LockStatus {
    /// Whether the escrowed tokens are still locked.
    pub fn is_open(&self) -> bool {
        matches!(self, LockStatus::Escrowed | LockStatus::IntentRegistered)
    }
}

/// What a node knows about one lock.
#[derive(Debug, Clone)]
pub struct LockRecord {
    pub lock_id: SecureHash,
    pub request_id: RequestId,
    pub status: LockStatus,
    pub deadline: Timestamp,
    pub updated_at: Timestamp,
}

/// Registry of the locks a node takes part in.
pub struct LockManager {
    locks: DashMap<SecureHash, LockRecord>,
    by_request: DashMap<RequestId, SecureHash>,
    metrics: SharedMetrics,
}

impl LockManager {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self {
            locks: DashMap::new(),
            by_request: DashMap::new(),
            metrics,
        }
    }

    fn set_status(
        &self,
        lock_id: SecureHash,
        request_id: RequestId,
        status: LockStatus,
        deadline: Option<Timestamp>,
        now: Timestamp,
    ) {
        let previous = self.locks.get(&lock_id).map(|record| record.status);
        match previous {
            None if status == LockStatus::Escrowed => self.metrics.escrow_committed(),
            Some(old) if old.is_open() && !status.is_open() => self.metrics.lock_closed(),
            _ => {}
        }

        let mut record = self.locks.entry(lock_id).or_insert_with(|| LockRecord {
            lock_id,
            request_id,
            status,
            deadline: deadline.unwrap_or(now),
            updated_at: now,
        });
        record.status = status;
        record.updated_at = now;
        if let Some(deadline) = deadline {
            record.deadline = deadline;
        }
        self.by_request.insert(request_id, lock_id);

        info!(
            lock = %lock_id.short(),
            request_id = %request_id,
            status = ?status,
            "Lock status recorded"
        );
    }

    pub fn track_escrowed(&self, lock: &EscrowedLock, now: Timestamp) {
        self.set_status(
            lock.lock_id(),
            lock.request_id(),
            LockStatus::Escrowed,
            Some(lock.deadline()),
            now,
        );
    }

    pub fn track_intent(&self, lock: &IntentRegisteredLock, now: Timestamp) {
        self.set_status(
            lock.lock_id(),
            lock.request_id(),
            LockStatus::IntentRegistered,
            Some(lock.deadline()),
            now,
        );
    }

    pub fn track_released(&self, lock: &ReleasedLock, now: Timestamp) {
        self.set_status(lock.lock_id, lock.request_id, LockStatus::Released, None, now);
    }

    pub fn track_reverted(&self, lock: &RevertedLock, now: Timestamp) {
        self.set_status(lock.lock_id, lock.request_id, LockStatus::Reverted, None, now);
    }

    pub fn get(&self, lock_id: &SecureHash) -> Option<LockRecord> {
        self.locks.get(lock_id).map(|record| record.clone())
    }

    pub fn for_request(&self, request_id: &RequestId) -> Option<LockRecord> {
        self.by_request
            .get(request_id)
            .and_then(|lock_id| self.get(lock_id.value()))
    }

    /// Open locks whose deadline passed more than `grace` before `now`.
    pub fn overdue(&self, now: Timestamp, grace: Duration) -> Vec<LockRecord> {
        let overdue: Vec<LockRecord> = self
            .locks
            .iter()
            .filter(|record| record.status.is_open() && now > record.deadline + grace)
            .map(|record| record.clone())
            .collect();
        for record in &overdue {
            warn!(
                lock = %record.lock_id.short(),
                request_id = %record.request_id,
                "Lock past deadline"
            );
        }
        overdue
    }

    /// Get count of open locks.
    pub fn open_count(&self) -> usize {
        self.locks.iter().filter(|record| record.status.is_open()).count()
    }
}
