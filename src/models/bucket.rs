use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{MonthKey, Transaction};
use crate::error::{LedgerError, Result};

/// All transactions dated in one month, with the balances around them.
///
/// `final_balance == initial_balance + Σ signed(transactions)` holds for every
/// bucket the engine has finished with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyBucket {
    pub key: MonthKey,
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    /// Ordered by (date, id).
    pub transactions: Vec<Transaction>,
    pub last_modified: DateTime<Utc>,
    pub checksum: String,
    pub is_calculated: bool,
}

impl MonthlyBucket {
    pub fn new(key: MonthKey, initial_balance: Decimal, now: DateTime<Utc>) -> Self {
        let mut bucket = Self {
            key,
            initial_balance,
            final_balance: initial_balance,
            transactions: Vec::new(),
            last_modified: now,
            checksum: String::new(),
            is_calculated: true,
        };
        bucket.refresh_checksum();
        bucket
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Sum of signed amounts, `None` on overflow.
    pub fn net_change(&self) -> Option<Decimal> {
        self.transactions
            .iter()
            .try_fold(Decimal::ZERO, |acc, t| acc.checked_add(t.signed_amount()))
    }

    pub fn expected_final_balance(&self) -> Option<Decimal> {
        self.initial_balance.checked_add(self.net_change()?)
    }

    pub fn is_balanced(&self) -> bool {
        self.expected_final_balance() == Some(self.final_balance)
    }

    /// Recompute `final_balance` from `initial_balance` and the transactions.
    pub fn recompute(&mut self, now: DateTime<Utc>) -> Result<Decimal> {
        let final_balance = self
            .expected_final_balance()
            .ok_or_else(|| self.overflow("recomputing final balance"))?;
        self.final_balance = final_balance;
        self.is_calculated = true;
        self.touch(now);
        Ok(final_balance)
    }

    /// Carry a delta through the bucket: both balances move by `delta`.
    pub fn shift(&mut self, delta: Decimal, now: DateTime<Utc>) -> Result<()> {
        let initial = self
            .initial_balance
            .checked_add(delta)
            .ok_or_else(|| self.overflow("shifting initial balance"))?;
        let final_balance = self
            .final_balance
            .checked_add(delta)
            .ok_or_else(|| self.overflow("shifting final balance"))?;
        self.initial_balance = initial;
        self.final_balance = final_balance;
        self.touch(now);
        Ok(())
    }

    /// Insert keeping (date, id) order. Returns false if the id is already present.
    pub fn insert(&mut self, txn: Transaction) -> bool {
        if self.find(txn.id).is_some() {
            return false;
        }
        let pos = self
            .transactions
            .partition_point(|t| (t.date, t.id) < (txn.date, txn.id));
        self.transactions.insert(pos, txn);
        self.is_calculated = false;
        true
    }

    pub fn remove(&mut self, id: i64) -> Option<Transaction> {
        let pos = self.transactions.iter().position(|t| t.id == id)?;
        self.is_calculated = false;
        Some(self.transactions.remove(pos))
    }

    pub fn find(&self, id: i64) -> Option<&Transaction> {
        self.transactions.iter().find(|t| t.id == id)
    }

    pub fn compute_checksum(&self) -> String {
        let mut ids: Vec<i64> = self.transactions.iter().map(|t| t.id).collect();
        ids.sort_unstable();
        let ids = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut hasher = Sha256::new();
        hasher.update(self.key.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(self.initial_balance.normalize().to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(self.final_balance.normalize().to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(ids.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn refresh_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn checksum_matches(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_modified = now;
        self.refresh_checksum();
    }

    fn overflow(&self, what: &str) -> LedgerError {
        LedgerError::BatchFailure {
            month: self.key,
            reason: format!("balance overflow while {what}"),
        }
    }
}
