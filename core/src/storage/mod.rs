pub mod db;
pub mod memory;
pub mod processor;
pub mod state;

pub use db::RocksDbStore;
pub use memory::MemStore;
pub use processor::{BlockProcessor, BlockReport, TxResult};
pub use state::{Snapshot, StateStore};
