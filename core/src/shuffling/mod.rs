//! Coin shuffling protocol.
//!
//! N accounts each lock the same amount of one holding and end up funding N
//! fresh recipient accounts, without anyone learning which input paid which
//! output. Any participant who deviates is identified and loses a deposit.

pub mod attachment;
pub mod blame;
pub mod deadline;
pub mod effects;
pub mod engine;
pub mod errors;
pub mod mixing;
pub mod participant;
pub mod registry;
pub mod settlement;
pub mod stage;
pub mod types;

pub use attachment::{AttachmentKind, ShufflingAttachment, ShufflingTransaction};
pub use effects::{BalanceChange, ShufflingEvent, ShufflingObserver, StateDiff};
pub use engine::ShufflingEngine;
pub use errors::{Result, ShufflingError};
pub use participant::ParticipantList;
pub use registry::{ShuffleRegistry, ShufflingAggregate};
pub use types::{BlockContext, Height, Participant, ParticipantState, Shuffling, ShufflingId, Stage};

#[cfg(test)]
mod tests;
