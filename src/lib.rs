pub mod audit;
pub mod config;
pub mod database;
pub mod error;
pub mod server;

pub use error::{LedgerError, LedgerResult};
