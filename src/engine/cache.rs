use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{Ledger, MonthKey, MonthlyBucket};

/// Cached copy of one bucket's balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceSnapshot {
    pub month: MonthKey,
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub checksum: String,
    pub transaction_count: usize,
    pub computed_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    fn of(bucket: &MonthlyBucket, now: DateTime<Utc>) -> Self {
        Self {
            month: bucket.key,
            initial_balance: bucket.initial_balance,
            final_balance: bucket.final_balance,
            checksum: bucket.checksum.clone(),
            transaction_count: bucket.transaction_count(),
            computed_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthBalance {
    pub month: MonthKey,
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub transaction_count: usize,
}

impl From<&BalanceSnapshot> for MonthBalance {
    fn from(snapshot: &BalanceSnapshot) -> Self {
        Self {
            month: snapshot.month,
            initial_balance: snapshot.initial_balance,
            final_balance: snapshot.final_balance,
            transaction_count: snapshot.transaction_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub snapshot_count: usize,
    pub invalidated_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Sum of the JSON-serialized sizes of all buckets.
    pub estimated_memory_bytes: usize,
}

/// Per-month balance cache. Derived data only; the ledger is the truth.
#[derive(Debug, Default)]
pub struct BalanceCache {
    snapshots: BTreeMap<MonthKey, BalanceSnapshot>,
    invalidated: BTreeSet<MonthKey>,
    hits: u64,
    misses: u64,
}

impl BalanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn is_invalidated(&self, month: &MonthKey) -> bool {
        self.invalidated.contains(month)
    }

    /// Mark `from` and every cached month after it as stale.
    pub fn invalidate_from(&mut self, from: MonthKey) -> usize {
        let before = self.invalidated.len();
        self.invalidated.insert(from);
        self.invalidated
            .extend(self.snapshots.range(from..).map(|(m, _)| *m));
        self.invalidated.len() - before
    }

    /// Mark months stale whether or not they are cached yet.
    pub fn mark_invalidated(&mut self, months: &[MonthKey]) {
        self.invalidated.extend(months.iter().copied());
    }

    /// Balances for `month`, served from the cache when the snapshot is
    /// fresh and still matches the bucket.
    pub fn lookup(&mut self, ledger: &Ledger, month: MonthKey, now: DateTime<Utc>) -> MonthBalance {
        let Some(bucket) = ledger.get(&month) else {
            self.misses += 1;
            let carried = ledger.balance_before(month);
            return MonthBalance {
                month,
                initial_balance: carried,
                final_balance: carried,
                transaction_count: 0,
            };
        };

        if !self.invalidated.contains(&month) {
            if let Some(snapshot) = self.snapshots.get(&month) {
                if snapshot.checksum == bucket.checksum {
                    self.hits += 1;
                    return MonthBalance::from(snapshot);
                }
            }
        }

        self.misses += 1;
        let snapshot = BalanceSnapshot::of(bucket, now);
        let balance = MonthBalance::from(&snapshot);
        self.snapshots.insert(month, snapshot);
        self.invalidated.remove(&month);
        balance
    }

    /// Re-snapshot the given months from the ledger.
    pub fn refresh(&mut self, ledger: &Ledger, months: &[MonthKey], now: DateTime<Utc>) {
        for month in months {
            match ledger.get(month) {
                Some(bucket) => {
                    self.snapshots.insert(*month, BalanceSnapshot::of(bucket, now));
                }
                None => {
                    self.snapshots.remove(month);
                }
            }
            self.invalidated.remove(month);
        }
    }

    /// Snapshot every bucket and forget all invalidations.
    pub fn rebuild(&mut self, ledger: &Ledger, now: DateTime<Utc>) {
        self.snapshots = ledger
            .buckets()
            .map(|b| (b.key, BalanceSnapshot::of(b, now)))
            .collect();
        self.invalidated.clear();
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.invalidated.clear();
        self.hits = 0;
        self.misses = 0;
    }

    pub fn stats(&self, ledger: &Ledger) -> CacheStats {
        let lookups = self.hits + self.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        };
        let estimated_memory_bytes = ledger
            .buckets()
            .map(|b| serde_json::to_vec(b).map(|v| v.len()).unwrap_or(0))
            .sum();

        CacheStats {
            snapshot_count: self.snapshots.len(),
            invalidated_count: self.invalidated.len(),
            hits: self.hits,
            misses: self.misses,
            hit_rate,
            estimated_memory_bytes,
        }
    }
}
