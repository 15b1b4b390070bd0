mod bucket;
mod ledger;
mod month;
mod transaction;

pub use bucket::MonthlyBucket;
pub use ledger::Ledger;
pub use month::MonthKey;
pub use transaction::{Transaction, TransactionKind};
