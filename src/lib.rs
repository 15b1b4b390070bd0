//! Monthly ledger with incremental balance propagation.
//!
//! Transactions live in per-month buckets. When one is created, edited or
//! deleted, the [`engine::Engine`] works out the balance delta, applies it to
//! the transaction's month and carries it forward through every later month,
//! so the history before the change is never recomputed.

pub mod cascade;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod impact;
pub mod import;
pub mod models;

pub use engine::Engine;
pub use error::{LedgerError, Result};
