pub mod shuffler;
pub mod shuffling;
pub mod storage;
