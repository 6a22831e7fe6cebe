//! Shuffling Engine
//!
//! Single entry point the ledger talks to. Every call reads a [`Snapshot`]
//! and returns a [`StateDiff`]; nothing is written until the caller hands the
//! diff back to [`ShufflingEngine::commit`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        ShufflingEngine                           │
//! │                                                                  │
//! │  on_transaction ──► create / register / verify                   │
//! │                 ──► mixing   (processing, recipients)            │
//! │                 ──► blame    (cancellation)                      │
//! │                            │                                     │
//! │  on_block_applied ──► deadline ──► settlement                    │
//! │                            │                                     │
//! │                            ▼                                     │
//! │                       StateDiff ──► commit ──► observers         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use log::{info, warn};

use coinshuffle_account::{AccountId, Holding, LedgerEvent, PublicKey};
use coinshuffle_config::{BlockLimits, ProtocolConfig, ShuffleConfig};
use coinshuffle_keypair::Keypair;

use crate::shuffling::attachment::{
    ShufflingAttachment, ShufflingCreation, ShufflingRegistration, ShufflingTransaction,
    ShufflingVerification,
};
use crate::shuffling::effects::{ShufflingEvent, ShufflingObserver, StateDiff};
use crate::shuffling::errors::{Result, ShufflingError};
use crate::shuffling::participant::ParticipantList;
use crate::shuffling::registry::{ShuffleRegistry, ShufflingAggregate};
use crate::shuffling::types::{
    BlockContext, Height, ParticipantState, Shuffling, ShufflingId, Stage,
};
use crate::shuffling::{blame, deadline, mixing, settlement};
use crate::storage::state::{Snapshot, StateStore};

pub struct ShufflingEngine {
    protocol: ProtocolConfig,
    limits: BlockLimits,
    observers: Vec<Arc<dyn ShufflingObserver>>,
}

impl ShufflingEngine {
    pub fn new(protocol: ProtocolConfig, limits: BlockLimits) -> Self {
        Self {
            protocol,
            limits,
            observers: Vec::new(),
        }
    }

    pub fn from_config(config: &ShuffleConfig) -> Self {
        Self::new(config.protocol.clone(), config.limits.clone())
    }

    pub fn protocol(&self) -> &ProtocolConfig {
        &self.protocol
    }

    pub fn limits(&self) -> &BlockLimits {
        &self.limits
    }

    pub fn add_observer(&mut self, observer: Arc<dyn ShufflingObserver>) {
        self.observers.push(observer);
    }

    pub fn registry<'a, S: StateStore + ?Sized>(
        &self,
        snapshot: Snapshot<'a, S>,
    ) -> ShuffleRegistry<'a, S> {
        ShuffleRegistry::new(snapshot)
    }

    // ========================================================================
    // Ledger hooks
    // ========================================================================

    /// Validates and applies one shuffling transaction.
    ///
    /// A rejected transaction yields an error and no effects.
    pub fn on_transaction<S: StateStore + ?Sized>(
        &self,
        snapshot: Snapshot<'_, S>,
        block: &BlockContext,
        tx: &ShufflingTransaction,
    ) -> Result<StateDiff> {
        let mut diff = StateDiff::default();
        let sender = tx.sender;
        let registry = ShuffleRegistry::new(snapshot);

        match &tx.attachment {
            ShufflingAttachment::Creation(creation) => {
                self.apply_creation(snapshot, tx, creation, &mut diff)?;
            }
            ShufflingAttachment::Registration(registration) => {
                self.apply_registration(snapshot, sender, registration, &mut diff)?;
            }
            ShufflingAttachment::Processing(message) => {
                let mut aggregate = registry.load(ShufflingId(message.shuffling_id))?;
                mixing::validate_processing(&aggregate, sender, message)?;
                mixing::apply_processing(&mut aggregate, sender, message, &self.protocol, &mut diff)?;
                aggregate.write_to(&mut diff);
            }
            ShufflingAttachment::Recipients(message) => {
                let mut aggregate = registry.load(ShufflingId(message.shuffling_id))?;
                mixing::validate_recipients(&aggregate, sender, message)?;
                mixing::apply_recipients(&mut aggregate, sender, message, &self.protocol, &mut diff)?;
                aggregate.write_to(&mut diff);
            }
            ShufflingAttachment::Verification(message) => {
                let mut aggregate = registry.load(ShufflingId(message.shuffling_id))?;
                self.apply_verification(snapshot, &mut aggregate, sender, message, &mut diff)?;
                aggregate.write_to(&mut diff);
            }
            ShufflingAttachment::Cancellation(message) => {
                let mut aggregate = registry.load(ShufflingId(message.shuffling_id))?;
                blame::validate_cancellation(&aggregate, sender, message)?;
                blame::apply_cancellation(
                    snapshot,
                    block,
                    &mut aggregate,
                    sender,
                    message,
                    &self.protocol,
                    &mut diff,
                )?;
                aggregate.write_to(&mut diff);
            }
        }
        Ok(diff)
    }

    /// Decodes a raw attachment and applies it.
    pub fn on_transaction_bytes<S: StateStore + ?Sized>(
        &self,
        snapshot: Snapshot<'_, S>,
        block: &BlockContext,
        sender: AccountId,
        nonce: u64,
        payload: &[u8],
    ) -> Result<StateDiff> {
        let tx = ShufflingTransaction::decode(sender, nonce, payload)?;
        self.on_transaction(snapshot, block, &tx)
    }

    /// Dry run of [`Self::on_transaction`].
    pub fn validate<S: StateStore + ?Sized>(
        &self,
        snapshot: Snapshot<'_, S>,
        tx: &ShufflingTransaction,
    ) -> Result<()> {
        let block = BlockContext::new(snapshot.height, AccountId::default());
        self.on_transaction(snapshot, &block, tx).map(|_| ())
    }

    /// Deadline countdown, run once after every applied block.
    pub fn on_block_applied<S: StateStore + ?Sized>(
        &self,
        snapshot: Snapshot<'_, S>,
        block: &BlockContext,
    ) -> Result<StateDiff> {
        deadline::on_block_applied(snapshot, block, &self.protocol, &self.limits)
    }

    /// Writes `diff` at `height`, then tells every observer what happened.
    pub fn commit<S: StateStore + ?Sized>(
        &self,
        store: &mut S,
        height: Height,
        diff: &StateDiff,
    ) -> Result<()> {
        store.apply_diff(height, diff)?;
        for (id, event) in &diff.events {
            for observer in &self.observers {
                observer.notify(*id, event);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Participant side
    // ========================================================================

    pub fn process<S: StateStore + ?Sized>(
        &self,
        snapshot: Snapshot<'_, S>,
        shuffling_id: ShufflingId,
        keypair: &Keypair,
        recipient_public_key: &PublicKey,
    ) -> Result<ShufflingAttachment> {
        mixing::process(snapshot, shuffling_id, keypair, recipient_public_key)
    }

    pub fn reveal_key_seeds<S: StateStore + ?Sized>(
        &self,
        snapshot: Snapshot<'_, S>,
        shuffling_id: ShufflingId,
        keypair: &Keypair,
        cancelling_account: AccountId,
        state_hash: &[u8; 32],
    ) -> Result<ShufflingAttachment> {
        blame::reveal_key_seeds(snapshot, shuffling_id, keypair, cancelling_account, state_hash)
    }

    /// Verification message echoing the current state hash.
    pub fn verify<S: StateStore + ?Sized>(
        &self,
        snapshot: Snapshot<'_, S>,
        shuffling_id: ShufflingId,
    ) -> Result<ShufflingAttachment> {
        let aggregate = ShuffleRegistry::new(snapshot).load(shuffling_id)?;
        Ok(ShufflingAttachment::verification(
            shuffling_id,
            aggregate.state_hash(),
        ))
    }

    pub fn blame<S: StateStore + ?Sized>(
        &self,
        snapshot: Snapshot<'_, S>,
        shuffling_id: ShufflingId,
    ) -> Result<Option<AccountId>> {
        let aggregate = ShuffleRegistry::new(snapshot).load(shuffling_id)?;
        blame::blame(snapshot, &aggregate)
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn check_funds<S: StateStore + ?Sized>(
        &self,
        snapshot: Snapshot<'_, S>,
        account: AccountId,
        holding: Holding,
        amount: i64,
    ) -> Result<()> {
        if snapshot.public_key(account)?.is_none() {
            return Err(ShufflingError::rejected(format!(
                "account {account} has no public key"
            )));
        }
        if snapshot.balance(account, holding)?.unconfirmed < amount {
            return Err(ShufflingError::rejected(format!(
                "account {account} cannot lock {amount} of {holding:?}"
            )));
        }
        if !holding.is_coin()
            && snapshot.balance(account, Holding::Coin)?.unconfirmed < self.protocol.deposit
        {
            return Err(ShufflingError::rejected(format!(
                "account {account} cannot lock the deposit"
            )));
        }
        Ok(())
    }

    fn lock_funds(
        &self,
        account: AccountId,
        holding: Holding,
        amount: i64,
        id: ShufflingId,
        diff: &mut StateDiff,
    ) {
        let event = LedgerEvent::ShufflingRegistration;
        diff.change_balance(account, holding, 0, -amount, event, Some(id));
        if !holding.is_coin() {
            diff.change_balance(account, Holding::Coin, 0, -self.protocol.deposit, event, Some(id));
        }
    }

    fn apply_creation<S: StateStore + ?Sized>(
        &self,
        snapshot: Snapshot<'_, S>,
        tx: &ShufflingTransaction,
        creation: &ShufflingCreation,
        diff: &mut StateDiff,
    ) -> Result<()> {
        let protocol = &self.protocol;
        let holding = creation
            .holding()
            .map_err(|e| ShufflingError::rejected(e.to_string()))?;
        let count = creation.participant_count;
        if count < protocol.min_participants || count > protocol.max_participants {
            return Err(ShufflingError::rejected(format!(
                "participant count {count} outside {}..={}",
                protocol.min_participants, protocol.max_participants
            )));
        }
        if creation.amount <= 0 {
            return Err(ShufflingError::rejected("amount must be positive"));
        }
        if holding.is_coin() && creation.amount < protocol.deposit {
            return Err(ShufflingError::rejected(format!(
                "coin amount {} below deposit {}",
                creation.amount, protocol.deposit
            )));
        }
        let period = creation.registration_period;
        if period == 0 || period > protocol.max_registration_period {
            return Err(ShufflingError::rejected(format!(
                "registration period {period} outside 1..={}",
                protocol.max_registration_period
            )));
        }
        self.check_funds(snapshot, tx.sender, holding, creation.amount)?;

        let id = ShufflingId(tx.id);
        if snapshot.shuffling(id)?.is_some() {
            return Err(ShufflingError::rejected(format!(
                "shuffling {id} already exists"
            )));
        }

        let payload = mixing::max_processing_payload(usize::from(count));
        if payload > self.limits.non_registration_tx_size {
            warn!(
                "shuffling {id}: {count} participants need {payload} bytes per message, above the {} byte budget",
                self.limits.non_registration_tx_size
            );
        }

        let mut participants = ParticipantList::new(id);
        participants.register(tx.sender)?;
        let aggregate = ShufflingAggregate {
            shuffling: Shuffling {
                id,
                full_hash: tx.full_hash,
                holding,
                issuer_id: tx.sender,
                amount: creation.amount,
                participant_count: count,
                blocks_remaining: Some(period),
                stage: Stage::Registration,
                assignee: Some(tx.sender),
                recipient_public_keys: Vec::new(),
                registrant_count: 1,
                height: 0,
            },
            participants,
        };

        self.lock_funds(tx.sender, holding, creation.amount, id, diff);
        info!(
            "shuffling {id} created by {} for {count} participants",
            tx.sender
        );
        diff.emit(id, ShufflingEvent::Created { issuer: tx.sender });
        diff.emit(
            id,
            ShufflingEvent::ParticipantRegistered { account: tx.sender },
        );
        aggregate.write_to(diff);
        Ok(())
    }

    fn apply_registration<S: StateStore + ?Sized>(
        &self,
        snapshot: Snapshot<'_, S>,
        sender: AccountId,
        registration: &ShufflingRegistration,
        diff: &mut StateDiff,
    ) -> Result<()> {
        let registry = ShuffleRegistry::new(snapshot);
        let shuffling = registry
            .get_by_full_hash(&registration.shuffling_full_hash)?
            .ok_or_else(|| ShufflingError::rejected("no shuffling with that full hash"))?;
        let mut aggregate = registry.load(shuffling.id)?;
        let id = aggregate.id();

        if aggregate.shuffling.stage != Stage::Registration {
            return Err(ShufflingError::rejected(format!(
                "shuffling {id} is no longer registering"
            )));
        }
        if aggregate.participants.contains(sender) {
            return Err(ShufflingError::rejected(format!(
                "account {sender} is already registered"
            )));
        }
        let holding = aggregate.shuffling.holding;
        let amount = aggregate.shuffling.amount;
        self.check_funds(snapshot, sender, holding, amount)?;

        aggregate.participants.register(sender)?;
        aggregate.shuffling.registrant_count += 1;
        self.lock_funds(sender, holding, amount, id, diff);
        diff.emit(id, ShufflingEvent::ParticipantRegistered { account: sender });

        if aggregate.shuffling.is_full() {
            let issuer = aggregate.shuffling.issuer_id;
            aggregate.shuffling.set_stage(
                Stage::Processing,
                Some(issuer),
                self.protocol.processing_deadline,
            )?;
            info!("shuffling {id} is full, processing starts with {issuer}");
            diff.emit(id, ShufflingEvent::ProcessingAssigned { assignee: issuer });
        }
        aggregate.write_to(diff);
        Ok(())
    }

    fn apply_verification<S: StateStore + ?Sized>(
        &self,
        snapshot: Snapshot<'_, S>,
        aggregate: &mut ShufflingAggregate,
        sender: AccountId,
        message: &ShufflingVerification,
        diff: &mut StateDiff,
    ) -> Result<()> {
        let id = aggregate.id();
        if aggregate.shuffling.stage != Stage::Verification {
            return Err(ShufflingError::rejected(format!(
                "shuffling {id} is not in verification"
            )));
        }
        let expected = aggregate.state_hash();
        if expected != message.state_hash {
            return Err(ShufflingError::state_hash_mismatch(
                &expected,
                &message.state_hash,
            ));
        }
        let participant = aggregate.participants.require_mut(sender)?;
        if participant.state != ParticipantState::Processed {
            return Err(ShufflingError::rejected(format!(
                "participant {sender} cannot verify from {:?}",
                participant.state
            )));
        }
        participant.set_state(ParticipantState::Verified)?;
        diff.emit(id, ShufflingEvent::ParticipantVerified { account: sender });

        if aggregate.participants.all_in(ParticipantState::Verified) {
            settlement::distribute(snapshot, aggregate, &self.protocol, diff)?;
        } else {
            let deadline = self
                .protocol
                .verification_deadline(aggregate.shuffling.participant_count);
            aggregate.shuffling.reset_deadline(deadline);
        }
        Ok(())
    }
}
