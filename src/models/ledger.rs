use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{MonthKey, MonthlyBucket, Transaction};

/// Monthly buckets in chronological order plus the balance the ledger opens with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    opening_balance: Decimal,
    buckets: BTreeMap<MonthKey, MonthlyBucket>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_opening_balance(opening_balance: Decimal) -> Self {
        Self {
            opening_balance,
            buckets: BTreeMap::new(),
        }
    }

    pub fn opening_balance(&self) -> Decimal {
        self.opening_balance
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn get(&self, key: &MonthKey) -> Option<&MonthlyBucket> {
        self.buckets.get(key)
    }

    pub fn get_mut(&mut self, key: &MonthKey) -> Option<&mut MonthlyBucket> {
        self.buckets.get_mut(key)
    }

    /// Insert or replace a bucket as-is. Used by loaders; no balances are touched.
    pub fn insert_bucket(&mut self, bucket: MonthlyBucket) -> Option<MonthlyBucket> {
        self.buckets.insert(bucket.key, bucket)
    }

    pub fn remove_bucket(&mut self, key: &MonthKey) -> Option<MonthlyBucket> {
        self.buckets.remove(key)
    }

    /// Fetch the bucket for `key`, creating it on first touch with the
    /// preceding bucket's final balance (or the opening balance) as its
    /// initial balance.
    pub fn get_or_create(&mut self, key: MonthKey, now: DateTime<Utc>) -> &mut MonthlyBucket {
        let initial = self.balance_before(key);
        self.buckets
            .entry(key)
            .or_insert_with(|| MonthlyBucket::new(key, initial, now))
    }

    /// Final balance of the closest bucket strictly before `key`.
    pub fn balance_before(&self, key: MonthKey) -> Decimal {
        self.predecessor(key)
            .map(|b| b.final_balance)
            .unwrap_or(self.opening_balance)
    }

    pub fn predecessor(&self, key: MonthKey) -> Option<&MonthlyBucket> {
        self.buckets.range(..key).next_back().map(|(_, b)| b)
    }

    pub fn successor(&self, key: MonthKey) -> Option<&MonthlyBucket> {
        self.buckets.range(key.next()..).next().map(|(_, b)| b)
    }

    pub fn first_month(&self) -> Option<MonthKey> {
        self.buckets.keys().next().copied()
    }

    pub fn last_month(&self) -> Option<MonthKey> {
        self.buckets.keys().next_back().copied()
    }

    pub fn months(&self) -> Vec<MonthKey> {
        self.buckets.keys().copied().collect()
    }

    /// Existing months in `from..=to`.
    pub fn months_between(&self, from: MonthKey, to: MonthKey) -> Vec<MonthKey> {
        if to < from {
            return Vec::new();
        }
        self.buckets.range(from..=to).map(|(k, _)| *k).collect()
    }

    pub fn months_from(&self, from: MonthKey) -> Vec<MonthKey> {
        self.buckets.range(from..).map(|(k, _)| *k).collect()
    }

    pub fn buckets(&self) -> impl Iterator<Item = &MonthlyBucket> {
        self.buckets.values()
    }

    /// Prior version of a stored transaction.
    pub fn find_transaction(&self, id: i64) -> Option<&Transaction> {
        self.buckets.values().find_map(|b| b.find(id))
    }

    pub fn next_transaction_id(&self) -> i64 {
        self.buckets
            .values()
            .flat_map(|b| b.transactions.iter().map(|t| t.id))
            .max()
            .unwrap_or(0)
            + 1
    }

    pub fn transaction_count(&self) -> usize {
        self.buckets.values().map(|b| b.transaction_count()).sum()
    }
}
