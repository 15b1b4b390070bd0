mod schema;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::Result;
use crate::models::{Ledger, MonthKey, MonthlyBucket, Transaction, TransactionKind};

/// SQLite home of a ledger. The whole ledger is loaded at startup and written
/// back after each successful change.
pub struct BucketStore {
    conn: Connection,
}

impl BucketStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let mut store = Self { conn };
        store.migrate()?;
        debug!(path = %path.display(), "bucket store opened");
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let mut store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&mut self) -> Result<()> {
        let has_version_table: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            [],
            |row| row.get(0),
        )?;

        if !has_version_table {
            self.conn.execute_batch(schema::SCHEMA_V1)?;
            self.conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![schema::CURRENT_VERSION],
            )?;
            return Ok(());
        }

        let current: i32 = self
            .conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })?;

        for &(from_version, sql) in schema::MIGRATIONS {
            if current <= from_version {
                self.conn.execute_batch(sql)?;
            }
        }

        if current < schema::CURRENT_VERSION {
            self.conn.execute(
                "UPDATE schema_version SET version = ?1",
                params![schema::CURRENT_VERSION],
            )?;
        }

        Ok(())
    }

    pub fn load_ledger(&self) -> Result<Ledger> {
        let opening_balance = match self.conn.query_row(
            "SELECT value FROM ledger_meta WHERE key = 'opening_balance'",
            [],
            |row| decimal_at(row, 0),
        ) {
            Ok(balance) => balance,
            Err(rusqlite::Error::QueryReturnedNoRows) => Decimal::ZERO,
            Err(e) => return Err(e.into()),
        };

        let mut transactions: BTreeMap<MonthKey, Vec<Transaction>> = BTreeMap::new();
        let mut stmt = self.conn.prepare(
            "SELECT id, month, date, amount, kind, description FROM transactions
             ORDER BY date, id",
        )?;
        let rows = stmt.query_map([], |row| {
            let month = month_at(row, 1)?;
            let kind_str: String = row.get(4)?;
            let kind = TransactionKind::parse(&kind_str).ok_or_else(|| {
                conversion_error(4, format!("unknown transaction kind '{kind_str}'"))
            })?;
            let amount = decimal_at(row, 3)?;
            if amount.is_sign_negative() {
                return Err(conversion_error(3, format!("negative amount '{amount}'")));
            }
            Ok((
                month,
                Transaction {
                    id: row.get(0)?,
                    date: date_at(row, 2)?,
                    amount,
                    kind,
                    description: row.get(5)?,
                },
            ))
        })?;
        for row in rows {
            let (month, txn) = row?;
            transactions.entry(month).or_default().push(txn);
        }

        let mut ledger = Ledger::with_opening_balance(opening_balance);
        let mut stmt = self.conn.prepare(
            "SELECT month, initial_balance, final_balance, last_modified, checksum, is_calculated
             FROM months ORDER BY month",
        )?;
        let rows = stmt.query_map([], |row| {
            let key = month_at(row, 0)?;
            Ok(MonthlyBucket {
                key,
                initial_balance: decimal_at(row, 1)?,
                final_balance: decimal_at(row, 2)?,
                transactions: Vec::new(),
                last_modified: timestamp_at(row, 3)?,
                checksum: row.get(4)?,
                is_calculated: row.get(5)?,
            })
        })?;
        for row in rows {
            let mut bucket = row?;
            bucket.transactions = transactions.remove(&bucket.key).unwrap_or_default();
            ledger.insert_bucket(bucket);
        }

        info!(
            months = ledger.len(),
            transactions = ledger.transaction_count(),
            "ledger loaded"
        );
        Ok(ledger)
    }

    /// Replace the stored ledger with `ledger` in one SQLite transaction.
    pub fn save_ledger(&mut self, ledger: &Ledger) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM transactions", [])?;
        tx.execute("DELETE FROM months", [])?;
        tx.execute(
            "INSERT INTO ledger_meta (key, value) VALUES ('opening_balance', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![ledger.opening_balance().to_string()],
        )?;

        for bucket in ledger.buckets() {
            let month = bucket.key.to_string();
            tx.execute(
                "INSERT INTO months (month, initial_balance, final_balance, last_modified, checksum, is_calculated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    month,
                    bucket.initial_balance.to_string(),
                    bucket.final_balance.to_string(),
                    bucket.last_modified.to_rfc3339(),
                    bucket.checksum,
                    bucket.is_calculated,
                ],
            )?;
            for txn in &bucket.transactions {
                tx.execute(
                    "INSERT INTO transactions (id, month, date, amount, kind, description)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        txn.id,
                        month,
                        txn.date.format("%Y-%m-%d").to_string(),
                        txn.amount.to_string(),
                        txn.kind.as_str(),
                        txn.description,
                    ],
                )?;
            }
        }
        tx.commit()?;

        debug!(months = ledger.len(), "ledger saved");
        Ok(())
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| conversion_error(idx, format!("bad amount '{text}': {e}")))
}

fn month_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<MonthKey> {
    let text: String = row.get(idx)?;
    MonthKey::parse(&text).ok_or_else(|| conversion_error(idx, format!("bad month '{text}'")))
}

fn date_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let text: String = row.get(idx)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|e| conversion_error(idx, format!("bad date '{text}': {e}")))
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{text}': {e}")))
}
