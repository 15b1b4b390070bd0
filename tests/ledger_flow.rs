#![allow(clippy::unwrap_used)]

use chrono::{NaiveDate, TimeZone, Utc};
use rust_decimal_macros::dec;
use std::io::Write;
use std::sync::Arc;

use monthledger::clock::FixedClock;
use monthledger::config::LedgerConfig;
use monthledger::db::BucketStore;
use monthledger::impact::{Operation, TransactionChange};
use monthledger::import::{CsvImporter, CsvProfile};
use monthledger::models::{Ledger, MonthKey, Transaction, TransactionKind};
use monthledger::Engine;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn month(y: i32, m: u32) -> MonthKey {
    MonthKey::new(y, m).unwrap()
}

fn engine(ledger: Ledger) -> Engine {
    let clock = FixedClock(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
    Engine::with_ledger(ledger, LedgerConfig::default(), Arc::new(clock))
}

fn assert_chain(ledger: &Ledger) {
    let buckets: Vec<_> = ledger.buckets().collect();
    for bucket in &buckets {
        assert!(bucket.is_balanced(), "{} is not balanced", bucket.key);
    }
    for pair in buckets.windows(2) {
        assert_eq!(
            pair[0].final_balance, pair[1].initial_balance,
            "gap between {} and {}",
            pair[0].key, pair[1].key
        );
    }
}

#[test]
fn test_salary_lifecycle() {
    let mut engine = engine(Ledger::with_opening_balance(dec!(0)));
    let salary = Transaction::new(1, date(2025, 1, 15), dec!(500000), TransactionKind::Income);

    let created = engine
        .process_transaction_change(Operation::Create, &salary, None)
        .unwrap();
    assert!(created.success);

    let raised = Transaction::new(1, date(2025, 1, 15), dec!(800000), TransactionKind::Income);
    let impact = engine
        .calculator()
        .calculate_impact(Operation::Update, &raised, Some(&salary))
        .unwrap();
    assert_eq!(impact.difference, dec!(300000));
    engine
        .process_transaction_change(Operation::Update, &raised, Some(&salary))
        .unwrap();
    assert_eq!(
        engine.month_balance(month(2025, 1)).final_balance,
        dec!(800000)
    );

    engine
        .process_transaction_change(Operation::Delete, &raised, None)
        .unwrap();
    assert_eq!(engine.month_balance(month(2025, 1)).final_balance, dec!(0));
    assert_chain(engine.ledger());
}

#[test]
fn test_import_persist_and_reload() {
    let mut csv = tempfile::NamedTempFile::new().unwrap();
    csv.write_all(
        b"Date,Amount,Kind,Description\n\
          2025-01-31,3000,income,Salary\n\
          2025-02-03,-1200,,Rent\n\
          2025-04-10,-80.25,,Groceries\n\
          2025-04-12,15,info,Pending refund\n",
    )
    .unwrap();

    let mut engine = engine(Ledger::with_opening_balance(dec!(250)));
    let first_id = engine.ledger().next_transaction_id();
    let txns = CsvImporter::import(csv.path(), &CsvProfile::default(), first_id).unwrap();
    let changes: Vec<_> = txns.into_iter().map(TransactionChange::create).collect();

    let result = engine.process_batch_changes(&changes).unwrap();
    assert!(result.success, "{:?}", result.errors);
    assert_chain(engine.ledger());
    assert_eq!(
        engine.month_balance(month(2025, 4)).final_balance,
        dec!(1954.75)
    );

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let mut store = BucketStore::open(&path).unwrap();
    store.save_ledger(engine.ledger()).unwrap();

    let reloaded = store.load_ledger().unwrap();
    assert_eq!(&reloaded, engine.ledger());

    let mut engine = self::engine(reloaded);
    let validation = engine.validate_and_correct_integrity().unwrap();
    assert!(validation.is_valid);
    assert!(validation.corrections.is_empty());
}

#[test]
fn test_out_of_order_entries_keep_chain() {
    let mut engine = engine(Ledger::with_opening_balance(dec!(100)));
    let entries = [
        (1, date(2025, 5, 1), dec!(10), TransactionKind::Income),
        (2, date(2025, 2, 1), dec!(20), TransactionKind::Expense),
        (3, date(2025, 8, 1), dec!(30), TransactionKind::Income),
        (4, date(2025, 1, 1), dec!(40), TransactionKind::Income),
    ];
    for (id, d, amount, kind) in entries {
        let txn = Transaction::new(id, d, amount, kind);
        engine
            .process_transaction_change(Operation::Create, &txn, None)
            .unwrap();
        assert_chain(engine.ledger());
    }

    assert_eq!(
        engine.ledger().get(&month(2025, 8)).unwrap().final_balance,
        dec!(160)
    );
}
