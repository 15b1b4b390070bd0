use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::models::{Transaction, TransactionKind};

/// Column layout of a transaction CSV.
#[derive(Debug, Clone)]
pub struct CsvProfile {
    pub date_column: usize,
    pub amount_column: usize,
    /// When absent, or empty on a row, the amount's sign decides the kind.
    pub kind_column: Option<usize>,
    pub description_column: Option<usize>,
    pub date_format: String,
}

impl Default for CsvProfile {
    fn default() -> Self {
        Self {
            date_column: 0,
            amount_column: 1,
            kind_column: Some(2),
            description_column: Some(3),
            date_format: "%Y-%m-%d".into(),
        }
    }
}

pub struct CsvImporter;

impl CsvImporter {
    /// Read every data row of `path`. A first row that holds no date and no
    /// number is treated as a header and skipped.
    pub fn read_rows(path: &Path) -> Result<Vec<Vec<String>>> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(false)
            .from_path(path)
            .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;

        let mut rows: Vec<Vec<String>> = Vec::new();
        for result in rdr.records() {
            let record = result.context("Failed to read CSV record")?;
            rows.push(record.iter().map(|s| s.to_string()).collect());
        }

        if rows.is_empty() {
            anyhow::bail!("CSV file is empty");
        }
        if looks_like_header(&rows[0]) {
            rows.remove(0);
        }
        Ok(rows)
    }

    /// Turn rows into new transactions numbered from `first_id`. Rows with
    /// no date or a zero amount are skipped.
    pub fn parse(
        rows: &[Vec<String>],
        profile: &CsvProfile,
        first_id: i64,
    ) -> Result<Vec<Transaction>> {
        let mut transactions = Vec::new();
        let mut next_id = first_id;

        for (i, row) in rows.iter().enumerate() {
            let date_str = cell(row, Some(profile.date_column));
            if date_str.is_empty() {
                continue;
            }
            let date = parse_date(date_str, &profile.date_format)
                .with_context(|| format!("Row {}: failed to parse date '{}'", i + 1, date_str))?;

            let raw_amount = cell(row, Some(profile.amount_column));
            let amount = parse_amount(raw_amount)
                .with_context(|| format!("Row {}: failed to parse amount", i + 1))?;
            if amount.is_zero() {
                debug!(row = i + 1, "skipping zero amount");
                continue;
            }

            let kind = match cell(row, profile.kind_column) {
                "" if amount.is_sign_negative() => TransactionKind::Expense,
                "" => TransactionKind::Income,
                raw => {
                    let kind = TransactionKind::parse(raw)
                        .with_context(|| format!("Row {}: unknown kind '{}'", i + 1, raw))?;
                    if kind == TransactionKind::Income && amount.is_sign_negative() {
                        anyhow::bail!("Row {}: income with negative amount '{}'", i + 1, raw_amount);
                    }
                    kind
                }
            };

            let mut txn = Transaction::new(next_id, date, amount, kind);
            let description = cell(row, profile.description_column);
            if !description.is_empty() {
                txn = txn.with_description(description);
            }
            transactions.push(txn);
            next_id += 1;
        }

        info!(rows = rows.len(), transactions = transactions.len(), "parsed CSV");
        Ok(transactions)
    }

    pub fn import(path: &Path, profile: &CsvProfile, first_id: i64) -> Result<Vec<Transaction>> {
        let rows = Self::read_rows(path)?;
        Self::parse(&rows, profile, first_id)
    }
}

fn cell(row: &[String], column: Option<usize>) -> &str {
    column
        .and_then(|c| row.get(c))
        .map(|s| s.trim())
        .unwrap_or("")
}

/// A header row holds no cell that reads as a date or an amount.
fn looks_like_header(row: &[String]) -> bool {
    row.iter().all(|field| {
        let field = field.trim();
        field.is_empty() || (parse_amount(field).is_err() && parse_date(field, ISO_DATE).is_err())
    })
}

const ISO_DATE: &str = "%Y-%m-%d";

/// Tried in order after the profile's own format.
const FALLBACK_DATE_FORMATS: &[&str] = &[ISO_DATE, "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];

fn parse_date(raw: &str, preferred: &str) -> Result<NaiveDate> {
    std::iter::once(preferred)
        .chain(FALLBACK_DATE_FORMATS.iter().copied())
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .with_context(|| format!("'{raw}' matches neither {preferred} nor a known date layout"))
}

/// Signed amount of a cell. Empty cells are zero; `(12.50)` is negative.
fn parse_amount(raw: &str) -> Result<Decimal> {
    let trimmed = raw.trim().trim_matches('"').trim();
    if trimmed.is_empty() {
        return Ok(Decimal::ZERO);
    }
    let (negated, body) = match trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };
    let digits: String = body
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    let value = Decimal::from_str(&digits).with_context(|| format!("'{raw}' is not an amount"))?;
    Ok(if negated { -value } else { value })
}

#[cfg(test)]
#[path = "csv_import_tests.rs"]
mod tests;
