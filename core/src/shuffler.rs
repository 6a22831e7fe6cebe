//! Shuffler
//!
//! Automated participant for accounts whose secrets live on this node. After
//! each block it looks at every shuffling it takes part in and builds the
//! message that account owes, if any. Signing and broadcast stay with the
//! caller.
//!
//! ```text
//!   stage          own state     own turn?            message
//!   ─────────────  ────────────  ───────────────────  ──────────────────────
//!   PROCESSING     REGISTERED    assignee == self     processing / recipients
//!   VERIFICATION   PROCESSED     own key disclosed    verification
//!   VERIFICATION   PROCESSED     own key missing      cancellation (self)
//!   BLAME          has data      not yet revealed     cancellation (assignee)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::{debug, info, warn};

use coinshuffle_account::{AccountId, Holding, PublicKey};
use coinshuffle_keypair::Keypair;

use crate::shuffling::attachment::{ShufflingAttachment, ShufflingTransaction};
use crate::shuffling::effects::{ShufflingEvent, ShufflingObserver};
use crate::shuffling::engine::ShufflingEngine;
use crate::shuffling::errors::{Result, ShufflingError};
use crate::shuffling::registry::{ShuffleRegistry, ShufflingAggregate};
use crate::shuffling::types::{ParticipantState, ShufflingId, Stage};
use crate::storage::processor::TxResult;
use crate::storage::state::{Snapshot, StateStore};

/// One local account taking part in one shuffling.
pub struct ShufflerSession {
    keypair: Keypair,
    recipient_public_key: PublicKey,
    /// Stage and own state the last message was built for.
    last_action: Option<(Stage, ParticipantState)>,
}

impl ShufflerSession {
    pub fn account_id(&self) -> AccountId {
        self.keypair.account_id()
    }

    pub fn recipient_public_key(&self) -> &PublicKey {
        &self.recipient_public_key
    }
}

pub struct Shuffler {
    sessions: DashMap<(ShufflingId, AccountId), ShufflerSession>,
    nonce: AtomicU64,
}

impl Default for Shuffler {
    fn default() -> Self {
        Self::new()
    }
}

impl Shuffler {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            nonce: AtomicU64::new(0),
        }
    }

    /// Starts numbering transactions at `nonce`, so a restarted agent does
    /// not reissue ids already on a resumed chain.
    pub fn with_nonce(nonce: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            nonce: AtomicU64::new(nonce),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_tracking(&self, shuffling_id: ShufflingId, account: AccountId) -> bool {
        self.sessions.contains_key(&(shuffling_id, account))
    }

    fn envelope(&self, sender: AccountId, attachment: ShufflingAttachment) -> Result<ShufflingTransaction> {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        ShufflingTransaction::new(sender, nonce, attachment)
    }

    /// Builds a creation transaction and starts tracking it for the issuer.
    pub fn create(
        &self,
        issuer: &Keypair,
        recipient_public_key: PublicKey,
        holding: Holding,
        amount: i64,
        participant_count: u8,
        registration_period: u16,
    ) -> Result<ShufflingTransaction> {
        let attachment =
            ShufflingAttachment::creation(holding, amount, participant_count, registration_period);
        let tx = self.envelope(issuer.account_id(), attachment)?;
        let id = ShufflingId(tx.id);
        self.track(id, issuer.clone(), recipient_public_key);
        Ok(tx)
    }

    /// Builds a registration for the shuffling with `full_hash`.
    pub fn register<S: StateStore + ?Sized>(
        &self,
        snapshot: Snapshot<'_, S>,
        keypair: &Keypair,
        recipient_public_key: PublicKey,
        full_hash: [u8; 32],
    ) -> Result<ShufflingTransaction> {
        let shuffling = ShuffleRegistry::new(snapshot)
            .get_by_full_hash(&full_hash)?
            .ok_or_else(|| ShufflingError::rejected("no shuffling with that full hash"))?;
        let tx = self.envelope(
            keypair.account_id(),
            ShufflingAttachment::registration(full_hash),
        )?;
        self.track(shuffling.id, keypair.clone(), recipient_public_key);
        Ok(tx)
    }

    fn track(&self, shuffling_id: ShufflingId, keypair: Keypair, recipient_public_key: PublicKey) {
        let account = keypair.account_id();
        debug!("shuffler tracking {account} in shuffling {shuffling_id}");
        self.sessions.insert(
            (shuffling_id, account),
            ShufflerSession {
                keypair,
                recipient_public_key,
                last_action: None,
            },
        );
    }

    /// Lets a rejected message be built again on the next pass.
    pub fn retry(&self, result: &TxResult) {
        if let Some(id) = result.shuffling_id {
            if let Some(mut session) = self.sessions.get_mut(&(id, result.sender)) {
                session.last_action = None;
            }
        }
    }

    /// Every message owed by a tracked account as of `snapshot`.
    pub fn next_messages<S: StateStore + ?Sized>(
        &self,
        engine: &ShufflingEngine,
        snapshot: Snapshot<'_, S>,
    ) -> Result<Vec<ShufflingTransaction>> {
        let registry = ShuffleRegistry::new(snapshot);
        let keys: Vec<(ShufflingId, AccountId)> =
            self.sessions.iter().map(|entry| *entry.key()).collect();

        let mut out = Vec::new();
        for key in keys {
            let (shuffling_id, account) = key;
            let Some(shuffling) = registry.get(shuffling_id)? else {
                continue;
            };
            if shuffling.stage.is_terminal() {
                self.sessions.remove(&key);
                continue;
            }
            let aggregate = registry.load(shuffling_id)?;
            let Some(own_state) = aggregate.participants.get(account).map(|p| p.state) else {
                continue;
            };
            let Some(mut session) = self.sessions.get_mut(&key) else {
                continue;
            };
            let step = (aggregate.shuffling.stage, own_state);
            if session.last_action == Some(step) {
                continue;
            }

            match self.decide(engine, snapshot, &aggregate, &session) {
                Ok(Some(attachment)) => {
                    session.last_action = Some(step);
                    out.push(self.envelope(account, attachment)?);
                }
                Ok(None) => {}
                Err(err) if err.is_rejection() => {
                    debug!("shuffler: {account} has nothing to send in {shuffling_id}: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    fn decide<S: StateStore + ?Sized>(
        &self,
        engine: &ShufflingEngine,
        snapshot: Snapshot<'_, S>,
        aggregate: &ShufflingAggregate,
        session: &ShufflerSession,
    ) -> Result<Option<ShufflingAttachment>> {
        let shuffling = &aggregate.shuffling;
        let account = session.account_id();
        let participant = aggregate.participants.require(account)?;

        match shuffling.stage {
            Stage::Processing
                if shuffling.assignee == Some(account)
                    && participant.state == ParticipantState::Registered =>
            {
                engine
                    .process(snapshot, shuffling.id, &session.keypair, &session.recipient_public_key)
                    .map(Some)
            }
            Stage::Verification if participant.state == ParticipantState::Processed => {
                if shuffling
                    .recipient_public_keys
                    .contains(&session.recipient_public_key)
                {
                    return engine.verify(snapshot, shuffling.id).map(Some);
                }
                if aggregate.is_last(account) {
                    return Ok(None);
                }
                warn!(
                    "shuffling {}: recipient key of {account} is missing, cancelling",
                    shuffling.id
                );
                engine
                    .reveal_key_seeds(
                        snapshot,
                        shuffling.id,
                        &session.keypair,
                        account,
                        &aggregate.state_hash(),
                    )
                    .map(Some)
            }
            Stage::Blame
                if !aggregate.is_last(account)
                    && !participant.data.is_empty()
                    && !participant.has_revealed() =>
            {
                let Some(assignee) = shuffling.assignee else {
                    return Ok(None);
                };
                engine
                    .reveal_key_seeds(
                        snapshot,
                        shuffling.id,
                        &session.keypair,
                        assignee,
                        &aggregate.state_hash(),
                    )
                    .map(Some)
            }
            _ => Ok(None),
        }
    }
}

impl ShufflingObserver for Shuffler {
    fn notify(&self, shuffling_id: ShufflingId, event: &ShufflingEvent) {
        match event {
            ShufflingEvent::Done | ShufflingEvent::Cancelled { .. } | ShufflingEvent::Deleted => {
                let before = self.sessions.len();
                self.sessions.retain(|(id, _), _| *id != shuffling_id);
                if before != self.sessions.len() {
                    info!("shuffler: shuffling {shuffling_id} finished with {event:?}");
                }
            }
            _ => {}
        }
    }
}
