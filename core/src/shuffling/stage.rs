//! Stage machine of a shuffling.
//!
//! ```text
//! REGISTRATION ──► PROCESSING ──► VERIFICATION ──► DONE
//!      │               │  │             │
//!      │               │  └──► BLAME ◄──┘
//!      │               │         │
//!      └───────────────┴─────────┴──► CANCELLED
//! ```
//!
//! Every transition goes through [`Shuffling::set_stage`], which also
//! enforces who the stage is assigned to and that terminal stages carry
//! no deadline.

use log::debug;

use coinshuffle_account::AccountId;

use crate::shuffling::errors::{Result, ShufflingError};
use crate::shuffling::types::{Shuffling, Stage};

impl Stage {
    /// Stages reachable in one step.
    pub fn next_stages(self) -> &'static [Stage] {
        match self {
            Stage::Registration => &[Stage::Processing, Stage::Cancelled],
            Stage::Processing => &[Stage::Verification, Stage::Blame, Stage::Cancelled],
            Stage::Verification => &[Stage::Done, Stage::Blame, Stage::Cancelled],
            Stage::Blame => &[Stage::Cancelled],
            Stage::Cancelled | Stage::Done => &[],
        }
    }

    pub fn can_become(self, next: Stage) -> bool {
        self.next_stages().contains(&next)
    }

    /// Whether `assignee` is acceptable once this stage is entered.
    fn accepts_assignee(self, assignee: Option<AccountId>) -> bool {
        match self {
            Stage::Registration | Stage::Processing | Stage::Blame => assignee.is_some(),
            Stage::Verification | Stage::Done => assignee.is_none(),
            // the blamed account, or none when nobody is at fault
            Stage::Cancelled => true,
        }
    }
}

impl Shuffling {
    /// Moves the shuffling to `next`, installing a new assignee and deadline.
    ///
    /// `blocks_remaining` must be zero for DONE and CANCELLED and is
    /// stored as `None` there.
    pub fn set_stage(
        &mut self,
        next: Stage,
        assignee: Option<AccountId>,
        blocks_remaining: u16,
    ) -> Result<()> {
        if !self.stage.can_become(next) {
            return Err(ShufflingError::IllegalTransition {
                from: self.stage,
                to: next,
            });
        }
        if !next.accepts_assignee(assignee) {
            return Err(ShufflingError::IllegalAssignee {
                stage: next,
                assignee,
            });
        }
        if next.is_terminal() && blocks_remaining != 0 {
            return Err(ShufflingError::IllegalDeadline {
                stage: next,
                blocks: blocks_remaining,
            });
        }

        debug!(
            "shuffling {} {:?} -> {:?} (assignee {:?}, {} blocks)",
            self.id, self.stage, next, assignee, blocks_remaining
        );
        self.stage = next;
        self.assignee = assignee;
        self.blocks_remaining = if next.is_terminal() {
            None
        } else {
            Some(blocks_remaining)
        };
        Ok(())
    }

    /// Resets the deadline without changing stage.
    pub fn reset_deadline(&mut self, blocks_remaining: u16) {
        if self.is_active() {
            self.blocks_remaining = Some(blocks_remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shuffling::types::ShufflingId;
    use coinshuffle_account::Holding;

    fn shuffling(stage: Stage) -> Shuffling {
        Shuffling {
            id: ShufflingId(1),
            full_hash: [0u8; 32],
            holding: Holding::Coin,
            issuer_id: AccountId(7),
            amount: 10,
            participant_count: 3,
            blocks_remaining: Some(10),
            stage,
            assignee: Some(AccountId(7)),
            recipient_public_keys: vec![],
            registrant_count: 1,
            height: 0,
        }
    }

    #[test]
    fn legal_path_to_done() {
        let mut s = shuffling(Stage::Registration);
        s.set_stage(Stage::Processing, Some(AccountId(7)), 100).unwrap();
        s.set_stage(Stage::Verification, None, 103).unwrap();
        s.set_stage(Stage::Done, None, 0).unwrap();
        assert_eq!(s.stage, Stage::Done);
        assert_eq!(s.blocks_remaining, None);
    }

    #[test]
    fn skipping_stages_is_illegal() {
        let mut s = shuffling(Stage::Registration);
        let err = s.set_stage(Stage::Verification, None, 5).unwrap_err();
        assert!(matches!(err, ShufflingError::IllegalTransition { .. }));

        let mut s = shuffling(Stage::Blame);
        assert!(s.set_stage(Stage::Done, None, 0).is_err());
    }

    #[test]
    fn terminal_stages_are_final() {
        for stage in [Stage::Done, Stage::Cancelled] {
            let mut s = shuffling(stage);
            assert!(s.set_stage(Stage::Blame, Some(AccountId(1)), 5).is_err());
            assert!(s.set_stage(Stage::Cancelled, None, 0).is_err());
        }
    }

    #[test]
    fn assignee_rules() {
        let mut s = shuffling(Stage::Processing);
        let err = s
            .set_stage(Stage::Verification, Some(AccountId(1)), 5)
            .unwrap_err();
        assert!(matches!(err, ShufflingError::IllegalAssignee { .. }));

        let err = s.set_stage(Stage::Blame, None, 5).unwrap_err();
        assert!(matches!(err, ShufflingError::IllegalAssignee { .. }));

        s.set_stage(Stage::Blame, Some(AccountId(1)), 5).unwrap();
        s.set_stage(Stage::Cancelled, Some(AccountId(1)), 0).unwrap();
        assert_eq!(s.assignee, Some(AccountId(1)));
    }

    #[test]
    fn terminal_deadline_must_be_zero() {
        let mut s = shuffling(Stage::Verification);
        let err = s.set_stage(Stage::Done, None, 3).unwrap_err();
        assert!(matches!(err, ShufflingError::IllegalDeadline { .. }));
    }

    #[test]
    fn reset_deadline_ignores_terminal() {
        let mut s = shuffling(Stage::Processing);
        s.reset_deadline(42);
        assert_eq!(s.blocks_remaining, Some(42));
        s.set_stage(Stage::Cancelled, None, 0).unwrap();
        s.reset_deadline(42);
        assert_eq!(s.blocks_remaining, None);
    }
}
