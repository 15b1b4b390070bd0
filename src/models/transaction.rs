use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::MonthKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    Income,
    Expense,
    Informational,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Income => "Income",
            Self::Expense => "Expense",
            Self::Informational => "Informational",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "income" | "in" | "credit" => Some(Self::Income),
            "expense" | "out" | "debit" => Some(Self::Expense),
            "informational" | "info" => Some(Self::Informational),
            _ => None,
        }
    }

    pub fn all() -> &'static [TransactionKind] {
        &[Self::Income, Self::Expense, Self::Informational]
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A ledger entry. `amount` is always non-negative; the sign comes from `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub description: Option<String>,
}

impl Transaction {
    pub fn new(id: i64, date: NaiveDate, amount: Decimal, kind: TransactionKind) -> Self {
        Self {
            id,
            date,
            amount: amount.abs(),
            kind,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Contribution of this entry to its month's balance.
    ///
    /// Informational entries subtract like expenses.
    pub fn signed_amount(&self) -> Decimal {
        match self.kind {
            TransactionKind::Income => self.amount,
            TransactionKind::Expense | TransactionKind::Informational => -self.amount,
        }
    }

    pub fn month(&self) -> MonthKey {
        MonthKey::from_date(self.date)
    }
}
