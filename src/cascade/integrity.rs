use rust_decimal::Decimal;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::models::{Ledger, MonthKey};

/// A broken balance invariant, reported as data rather than raised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    #[error("Balance inconsistent in {month}: expected {}, found {actual}", display_expected(.expected))]
    BalanceInconsistent {
        month: MonthKey,
        /// `None` when the expected balance overflows.
        expected: Option<Decimal>,
        actual: Decimal,
    },

    #[error("Discontinuity between {previous} and {next}: final balance {previous_final} != initial balance {next_initial}")]
    Discontinuity {
        previous: MonthKey,
        next: MonthKey,
        previous_final: Decimal,
        next_initial: Decimal,
    },
}

fn display_expected(expected: &Option<Decimal>) -> String {
    expected.map_or_else(|| "<overflow>".to_string(), |d| d.to_string())
}

impl IntegrityViolation {
    /// The earliest month the violation involves.
    pub fn month(&self) -> MonthKey {
        match self {
            Self::BalanceInconsistent { month, .. } => *month,
            Self::Discontinuity { previous, .. } => *previous,
        }
    }
}

/// A repair applied by the engine's self-healing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    RecomputedMonth(MonthKey),
    RecalculatedFrom(MonthKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<IntegrityViolation>,
    pub warnings: Vec<String>,
    pub corrections: Vec<Correction>,
}

/// Check conservation of every bucket in scope and continuity between each of
/// them and the closest earlier bucket. `None` validates the whole ledger.
pub(crate) fn validate(ledger: &Ledger, months: Option<&[MonthKey]>) -> ValidationResult {
    let scope: BTreeSet<MonthKey> = match months {
        Some(months) => months
            .iter()
            .copied()
            .filter(|m| ledger.get(m).is_some())
            .collect(),
        None => ledger.months().into_iter().collect(),
    };

    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for month in &scope {
        let Some(bucket) = ledger.get(month) else {
            continue;
        };

        if let Some(previous) = ledger.predecessor(*month) {
            if previous.final_balance != bucket.initial_balance {
                errors.push(IntegrityViolation::Discontinuity {
                    previous: previous.key,
                    next: bucket.key,
                    previous_final: previous.final_balance,
                    next_initial: bucket.initial_balance,
                });
            }
        }

        let expected = bucket.expected_final_balance();
        if expected != Some(bucket.final_balance) {
            errors.push(IntegrityViolation::BalanceInconsistent {
                month: bucket.key,
                expected,
                actual: bucket.final_balance,
            });
        }

        if !bucket.checksum_matches() {
            warnings.push(format!("Checksum for {month} is stale"));
        }
        if !bucket.is_calculated {
            warnings.push(format!("{month} has uncalculated changes"));
        }
    }

    ValidationResult {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        corrections: Vec::new(),
    }
}
