//! Balance impact of a single create/update/delete, and of batches of them.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ImpactConfig;
use crate::error::{LedgerError, Result};
use crate::models::{MonthKey, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lower rank is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    pub fn rank(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Impact {
    pub transaction_id: i64,
    pub operation: Operation,
    pub old_value: Decimal,
    pub new_value: Decimal,
    pub difference: Decimal,
    /// Earliest date touched by the change.
    pub date: NaiveDate,
    pub affected_periods: Vec<MonthKey>,
    pub priority: Priority,
}

impl Impact {
    pub fn origin_month(&self) -> MonthKey {
        MonthKey::from_date(self.date)
    }
}

/// One pending mutation, as handed over by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionChange {
    pub operation: Operation,
    pub transaction: Transaction,
    pub previous: Option<Transaction>,
}

impl TransactionChange {
    pub fn create(transaction: Transaction) -> Self {
        Self {
            operation: Operation::Create,
            transaction,
            previous: None,
        }
    }

    pub fn update(previous: Transaction, transaction: Transaction) -> Self {
        Self {
            operation: Operation::Update,
            transaction,
            previous: Some(previous),
        }
    }

    pub fn delete(transaction: Transaction) -> Self {
        Self {
            operation: Operation::Delete,
            transaction,
            previous: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchImpact {
    pub impacts: Vec<Impact>,
    pub total_affected_months: usize,
    pub estimated_processing_time: Duration,
    pub requires_full_recalculation: bool,
}

pub struct ImpactCalculator {
    config: ImpactConfig,
}

impl ImpactCalculator {
    pub fn new(config: ImpactConfig) -> Self {
        Self { config }
    }

    pub fn calculate_impact(
        &self,
        operation: Operation,
        transaction: &Transaction,
        old_transaction: Option<&Transaction>,
    ) -> Result<Impact> {
        let (old_value, new_value, date) = match operation {
            Operation::Create => (Decimal::ZERO, transaction.signed_amount(), transaction.date),
            Operation::Delete => (transaction.signed_amount(), Decimal::ZERO, transaction.date),
            Operation::Update => {
                let old = old_transaction.ok_or_else(|| {
                    LedgerError::InvalidOperation(format!(
                        "update of transaction {} requires its previous version",
                        transaction.id
                    ))
                })?;
                if old.id != transaction.id {
                    return Err(LedgerError::InvalidOperation(format!(
                        "previous version has id {} but transaction has id {}",
                        old.id, transaction.id
                    )));
                }
                (
                    old.signed_amount(),
                    transaction.signed_amount(),
                    old.date.min(transaction.date),
                )
            }
        };

        let difference = new_value.checked_sub(old_value).ok_or_else(|| {
            LedgerError::InvalidOperation(format!(
                "balance difference for transaction {} is out of range",
                transaction.id
            ))
        })?;

        let impact = Impact {
            transaction_id: transaction.id,
            operation,
            old_value,
            new_value,
            difference,
            date,
            affected_periods: self.affected_periods(MonthKey::from_date(date)),
            priority: self.priority_for(difference),
        };
        debug!(
            transaction_id = impact.transaction_id,
            operation = %operation,
            difference = %impact.difference,
            priority = impact.priority.rank(),
            "computed impact"
        );
        Ok(impact)
    }

    /// Impacts for every change that can be computed; failing changes are skipped.
    pub fn calculate_batch_impact(&self, changes: &[TransactionChange]) -> BatchImpact {
        let mut impacts: Vec<Impact> = changes
            .iter()
            .filter_map(|change| {
                match self.calculate_impact(
                    change.operation,
                    &change.transaction,
                    change.previous.as_ref(),
                ) {
                    Ok(impact) => Some(impact),
                    Err(err) => {
                        warn!(
                            transaction_id = change.transaction.id,
                            operation = %change.operation,
                            "skipping change in batch: {err}"
                        );
                        None
                    }
                }
            })
            .collect();
        optimize_impact_order(&mut impacts);

        let distinct: BTreeSet<MonthKey> = impacts
            .iter()
            .flat_map(|i| i.affected_periods.iter().copied())
            .collect();
        let total_affected_months = distinct.len();

        BatchImpact {
            impacts,
            total_affected_months,
            estimated_processing_time: Duration::from_micros(
                self.config
                    .estimated_cost_per_month_us
                    .saturating_mul(total_affected_months as u64),
            ),
            requires_full_recalculation: total_affected_months
                > self.config.full_recalculation_threshold,
        }
    }

    pub fn priority_for(&self, difference: Decimal) -> Priority {
        let magnitude = difference.abs();
        if magnitude >= self.config.high_priority_threshold {
            Priority::High
        } else if magnitude >= self.config.medium_priority_threshold {
            Priority::Medium
        } else {
            Priority::Low
        }
    }

    /// `origin` and the months after it, `horizon_months` entries in all.
    pub fn affected_periods(&self, origin: MonthKey) -> Vec<MonthKey> {
        (0..self.config.horizon_months)
            .map(|offset| origin.plus_months(offset))
            .collect()
    }
}

/// Most urgent first, then earliest first. Stable for equal keys.
pub fn optimize_impact_order(impacts: &mut [Impact]) {
    impacts.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.date.cmp(&b.date)));
}
