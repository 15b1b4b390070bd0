use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{LedgerError, Result};
use crate::models::{Ledger, MonthKey};

#[derive(Debug, Clone, PartialEq, Eq)]
struct SavedBalances {
    month: MonthKey,
    initial_balance: Decimal,
    final_balance: Decimal,
    checksum: String,
    last_modified: DateTime<Utc>,
    is_calculated: bool,
}

/// Balances of the buckets a propagation is about to touch, taken before the
/// first write.
#[derive(Debug, Clone)]
pub struct PropagationSnapshot {
    propagation_id: String,
    saved: Vec<SavedBalances>,
}

impl PropagationSnapshot {
    pub fn capture(
        propagation_id: &str,
        ledger: &Ledger,
        months: &[MonthKey],
    ) -> Self {
        let saved = months
            .iter()
            .filter_map(|m| ledger.get(m))
            .map(|b| SavedBalances {
                month: b.key,
                initial_balance: b.initial_balance,
                final_balance: b.final_balance,
                checksum: b.checksum.clone(),
                last_modified: b.last_modified,
                is_calculated: b.is_calculated,
            })
            .collect();
        Self {
            propagation_id: propagation_id.to_string(),
            saved,
        }
    }

    pub fn propagation_id(&self) -> &str {
        &self.propagation_id
    }

    /// Write every saved balance back. Nothing is written unless every saved
    /// month still has a bucket.
    pub fn restore(&self, ledger: &mut Ledger) -> Result<usize> {
        if let Some(missing) = self.saved.iter().find(|s| ledger.get(&s.month).is_none()) {
            return Err(LedgerError::RollbackFailure {
                propagation_id: self.propagation_id.clone(),
                reason: format!("bucket {} disappeared during propagation", missing.month),
            });
        }

        for saved in &self.saved {
            if let Some(bucket) = ledger.get_mut(&saved.month) {
                bucket.initial_balance = saved.initial_balance;
                bucket.final_balance = saved.final_balance;
                bucket.checksum = saved.checksum.clone();
                bucket.last_modified = saved.last_modified;
                bucket.is_calculated = saved.is_calculated;
            }
        }
        Ok(self.saved.len())
    }
}
