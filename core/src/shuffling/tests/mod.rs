mod common;

mod honest;
mod registry;
mod store;
