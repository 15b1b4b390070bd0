#![allow(clippy::unwrap_used)]

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::*;
use crate::clock::FixedClock;
use crate::models::TransactionKind;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn month(y: i32, m: u32) -> MonthKey {
    MonthKey::new(y, m).unwrap()
}

fn clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()))
}

/// Empty buckets for the given 2025 months, all at the opening balance.
fn ledger_with(opening: Decimal, months: &[u32]) -> Ledger {
    let mut ledger = Ledger::with_opening_balance(opening);
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    for m in months {
        ledger.get_or_create(month(2025, *m), now);
    }
    ledger
}

fn engine_with(ledger: Ledger) -> Engine {
    Engine::with_ledger(ledger, LedgerConfig::default(), clock())
}

fn five_month_engine() -> Engine {
    engine_with(ledger_with(dec!(1000), &[1, 2, 3, 4, 5]))
}

fn income(id: i64, d: NaiveDate, amount: Decimal) -> Transaction {
    Transaction::new(id, d, amount, TransactionKind::Income)
}

fn balances(engine: &Engine) -> Vec<(MonthKey, Decimal, Decimal)> {
    engine
        .ledger()
        .buckets()
        .map(|b| (b.key, b.initial_balance, b.final_balance))
        .collect()
}

fn assert_consistent(engine: &Engine) {
    let validation = engine
        .cascade()
        .validate_propagation_integrity(engine.ledger(), None);
    assert!(validation.is_valid, "{:?}", validation.errors);
}

// ── single changes ────────────────────────────────────────────

#[test]
fn test_create_propagates_to_later_months() {
    let mut engine = five_month_engine();
    let salary = income(1, date(2025, 2, 10), dec!(500));

    let result = engine
        .process_transaction_change(Operation::Create, &salary, None)
        .unwrap();

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(
        result.processed_months,
        vec![month(2025, 2), month(2025, 3), month(2025, 4), month(2025, 5)]
    );
    assert_eq!(result.affected_transactions, 1);
    assert_eq!(
        balances(&engine),
        vec![
            (month(2025, 1), dec!(1000), dec!(1000)),
            (month(2025, 2), dec!(1000), dec!(1500)),
            (month(2025, 3), dec!(1500), dec!(1500)),
            (month(2025, 4), dec!(1500), dec!(1500)),
            (month(2025, 5), dec!(1500), dec!(1500)),
        ]
    );
    assert_consistent(&engine);
}

#[test]
fn test_create_in_new_month_starts_from_predecessor() {
    let mut engine = five_month_engine();
    let bonus = income(1, date(2025, 7, 3), dec!(250));

    engine
        .process_transaction_change(Operation::Create, &bonus, None)
        .unwrap();

    let july = engine.ledger().get(&month(2025, 7)).unwrap();
    assert_eq!(july.initial_balance, dec!(1000));
    assert_eq!(july.final_balance, dec!(1250));
    assert!(engine.ledger().get(&month(2025, 6)).is_none());
    assert_consistent(&engine);
}

#[test]
fn test_create_before_first_month() {
    let mut engine = engine_with(ledger_with(dec!(1000), &[3, 4]));
    let rent = Transaction::new(1, date(2025, 1, 1), dec!(400), TransactionKind::Expense);

    engine
        .process_transaction_change(Operation::Create, &rent, None)
        .unwrap();

    assert_eq!(
        balances(&engine),
        vec![
            (month(2025, 1), dec!(1000), dec!(600)),
            (month(2025, 3), dec!(600), dec!(600)),
            (month(2025, 4), dec!(600), dec!(600)),
        ]
    );
}

#[test]
fn test_update_amount_shifts_by_difference() {
    let mut engine = five_month_engine();
    let original = income(1, date(2025, 1, 15), dec!(500000));
    engine
        .process_transaction_change(Operation::Create, &original, None)
        .unwrap();

    let raised = income(1, date(2025, 1, 15), dec!(800000));
    engine
        .process_transaction_change(Operation::Update, &raised, Some(&original))
        .unwrap();

    let may = engine.ledger().get(&month(2025, 5)).unwrap();
    assert_eq!(may.final_balance, dec!(801000));
    assert_eq!(
        engine.ledger().find_transaction(1).unwrap().amount,
        dec!(800000)
    );
    assert_consistent(&engine);
}

#[test]
fn test_create_then_delete_restores_balances() {
    let mut engine = five_month_engine();
    let before = balances(&engine);
    let salary = income(1, date(2025, 3, 1), dec!(321.45));

    engine
        .process_transaction_change(Operation::Create, &salary, None)
        .unwrap();
    engine
        .process_transaction_change(Operation::Delete, &salary, None)
        .unwrap();

    assert_eq!(balances(&engine), before);
    assert_eq!(engine.ledger().transaction_count(), 0);
}

#[test]
fn test_informational_entry_reduces_balance() {
    let mut engine = five_month_engine();
    let note = Transaction::new(1, date(2025, 4, 2), dec!(20), TransactionKind::Informational);

    engine
        .process_transaction_change(Operation::Create, &note, None)
        .unwrap();

    assert_eq!(
        engine.ledger().get(&month(2025, 5)).unwrap().final_balance,
        dec!(980)
    );
}

#[test]
fn test_update_moving_forward_across_months() {
    let mut engine = five_month_engine();
    let original = income(1, date(2025, 2, 10), dec!(500));
    engine
        .process_transaction_change(Operation::Create, &original, None)
        .unwrap();

    let moved = income(1, date(2025, 4, 10), dec!(500));
    let result = engine
        .process_transaction_change(Operation::Update, &moved, Some(&original))
        .unwrap();

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(
        balances(&engine),
        vec![
            (month(2025, 1), dec!(1000), dec!(1000)),
            (month(2025, 2), dec!(1000), dec!(1000)),
            (month(2025, 3), dec!(1000), dec!(1000)),
            (month(2025, 4), dec!(1000), dec!(1500)),
            (month(2025, 5), dec!(1500), dec!(1500)),
        ]
    );
    assert!(engine.ledger().get(&month(2025, 4)).unwrap().find(1).is_some());
    assert!(engine.ledger().get(&month(2025, 2)).unwrap().find(1).is_none());
}

#[test]
fn test_update_moving_backward_with_new_amount() {
    let mut engine = five_month_engine();
    let original = income(1, date(2025, 4, 10), dec!(500));
    engine
        .process_transaction_change(Operation::Create, &original, None)
        .unwrap();

    let moved = income(1, date(2025, 2, 10), dec!(200));
    engine
        .process_transaction_change(Operation::Update, &moved, Some(&original))
        .unwrap();

    assert_eq!(
        balances(&engine),
        vec![
            (month(2025, 1), dec!(1000), dec!(1000)),
            (month(2025, 2), dec!(1000), dec!(1200)),
            (month(2025, 3), dec!(1200), dec!(1200)),
            (month(2025, 4), dec!(1200), dec!(1200)),
            (month(2025, 5), dec!(1200), dec!(1200)),
        ]
    );
    assert_consistent(&engine);
}

#[test]
fn test_create_with_existing_id_is_rejected() {
    let mut engine = five_month_engine();
    let salary = income(1, date(2025, 2, 10), dec!(500));
    engine
        .process_transaction_change(Operation::Create, &salary, None)
        .unwrap();
    let before = engine.ledger().clone();

    let err = engine
        .process_transaction_change(Operation::Create, &salary, None)
        .unwrap_err();

    assert!(matches!(err, LedgerError::InvalidOperation(_)));
    assert_eq!(engine.ledger(), &before);
}

#[test]
fn test_update_with_stale_previous_is_rejected() {
    let mut engine = five_month_engine();
    let salary = income(1, date(2025, 2, 10), dec!(500));
    engine
        .process_transaction_change(Operation::Create, &salary, None)
        .unwrap();

    let stale = income(1, date(2025, 2, 10), dec!(450));
    let raised = income(1, date(2025, 2, 10), dec!(900));
    let err = engine
        .process_transaction_change(Operation::Update, &raised, Some(&stale))
        .unwrap_err();

    assert!(matches!(err, LedgerError::InvalidOperation(_)));
    assert_eq!(engine.ledger().find_transaction(1).unwrap().amount, dec!(500));
}

#[test]
fn test_delete_unknown_transaction_is_rejected() {
    let mut engine = five_month_engine();
    let ghost = income(42, date(2025, 2, 10), dec!(500));

    let err = engine
        .process_transaction_change(Operation::Delete, &ghost, None)
        .unwrap_err();

    assert!(matches!(err, LedgerError::InvalidOperation(_)));
}

#[test]
fn test_failed_propagation_undoes_the_change() {
    let mut ledger = ledger_with(dec!(1000), &[1, 2, 3, 4, 5]);
    let april = ledger.get_mut(&month(2025, 4)).unwrap();
    april.initial_balance = Decimal::MAX;
    april.final_balance = Decimal::MAX;
    april.refresh_checksum();
    let mut engine = engine_with(ledger);
    let before = engine.ledger().clone();

    let salary = income(1, date(2025, 2, 10), dec!(500));
    let result = engine
        .process_transaction_change(Operation::Create, &salary, None)
        .unwrap();

    assert!(!result.success);
    assert!(result.rollback_performed);
    assert_eq!(engine.ledger(), &before);
    assert_eq!(engine.cascade().phase(), crate::cascade::PropagationPhase::RolledBack);
}

#[test]
fn test_origin_overflow_is_abandoned() {
    let mut ledger = ledger_with(dec!(1000), &[1, 2]);
    let feb = ledger.get_mut(&month(2025, 2)).unwrap();
    feb.initial_balance = Decimal::MAX;
    feb.final_balance = Decimal::MAX;
    let mut engine = engine_with(ledger);
    let before = engine.ledger().clone();

    let salary = income(1, date(2025, 2, 10), dec!(1));
    let result = engine
        .process_transaction_change(Operation::Create, &salary, None)
        .unwrap();

    assert!(!result.success);
    assert!(matches!(
        result.errors.as_slice(),
        [PropagationError::BatchFailure { month: m, .. }] if *m == month(2025, 2)
    ));
    assert_eq!(engine.ledger(), &before);
}

// ── batches ───────────────────────────────────────────────────

#[test]
fn test_batch_changes_across_months() {
    let mut engine = five_month_engine();
    let changes = vec![
        TransactionChange::create(income(1, date(2025, 1, 5), dec!(100))),
        TransactionChange::create(Transaction::new(
            2,
            date(2025, 3, 5),
            dec!(40),
            TransactionKind::Expense,
        )),
        TransactionChange::create(income(3, date(2025, 5, 5), dec!(7))),
    ];

    let result = engine.process_batch_changes(&changes).unwrap();

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.processed_months.len(), 5);
    assert_eq!(result.affected_transactions, 3);
    assert_eq!(
        balances(&engine),
        vec![
            (month(2025, 1), dec!(1000), dec!(1100)),
            (month(2025, 2), dec!(1100), dec!(1100)),
            (month(2025, 3), dec!(1100), dec!(1060)),
            (month(2025, 4), dec!(1060), dec!(1060)),
            (month(2025, 5), dec!(1060), dec!(1067)),
        ]
    );
}

#[test]
fn test_batch_creating_buckets_counts_each_change_once() {
    let mut engine = engine_with(ledger_with(dec!(1000), &[1]));
    let changes = vec![
        TransactionChange::create(income(1, date(2025, 3, 1), dec!(100))),
        TransactionChange::create(income(2, date(2025, 5, 1), dec!(200))),
    ];

    engine.process_batch_changes(&changes).unwrap();

    assert_eq!(
        balances(&engine),
        vec![
            (month(2025, 1), dec!(1000), dec!(1000)),
            (month(2025, 3), dec!(1000), dec!(1100)),
            (month(2025, 5), dec!(1100), dec!(1300)),
        ]
    );
}

#[test]
fn test_batch_skips_invalid_changes() {
    let mut engine = five_month_engine();
    let changes = vec![
        TransactionChange::create(income(1, date(2025, 2, 1), dec!(10))),
        TransactionChange::delete(income(99, date(2025, 2, 1), dec!(10))),
        TransactionChange::create(income(1, date(2025, 3, 1), dec!(10))),
    ];

    let result = engine.process_batch_changes(&changes).unwrap();

    assert!(result.success);
    assert_eq!(result.warnings.len(), 2);
    assert_eq!(engine.ledger().transaction_count(), 1);
    assert_eq!(
        engine.ledger().get(&month(2025, 5)).unwrap().final_balance,
        dec!(1010)
    );
    assert!(engine.ledger().get(&month(2025, 3)).unwrap().find(1).is_none());
}

#[test]
fn test_wide_batch_falls_back_to_recalculation() {
    let mut engine = five_month_engine();
    let changes = vec![
        TransactionChange::create(income(1, date(2025, 1, 5), dec!(100))),
        TransactionChange::create(income(2, date(2026, 3, 5), dec!(50))),
    ];

    let result = engine.process_batch_changes(&changes).unwrap();

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(engine.performance_stats().recalculations, 1);
    assert_eq!(
        engine.ledger().get(&month(2026, 3)).unwrap().final_balance,
        dec!(1150)
    );
    assert_consistent(&engine);
}

#[test]
fn test_empty_batch_is_a_successful_noop() {
    let mut engine = five_month_engine();
    let before = engine.ledger().clone();

    let result = engine.process_batch_changes(&[]).unwrap();

    assert!(result.success);
    assert!(result.processed_months.is_empty());
    assert_eq!(engine.ledger(), &before);
}

// ── recalculation and self-healing ────────────────────────────

#[test]
fn test_recalculate_from_date_rebuilds_chain() {
    let mut ledger = ledger_with(dec!(1000), &[1, 2, 3, 4]);
    let mar = ledger.get_mut(&month(2025, 3)).unwrap();
    mar.initial_balance = dec!(5);
    mar.final_balance = dec!(5);
    let mut engine = engine_with(ledger);

    let result = engine.recalculate_from_date(date(2025, 2, 14)).unwrap();

    assert!(result.success);
    assert_eq!(
        result.processed_months,
        vec![month(2025, 2), month(2025, 3), month(2025, 4)]
    );
    assert_consistent(&engine);
    assert_eq!(
        engine.ledger().get(&month(2025, 4)).unwrap().final_balance,
        dec!(1000)
    );
}

#[test]
fn test_validate_and_correct_repairs_discontinuity() {
    let mut ledger = ledger_with(dec!(1000), &[1, 2, 3]);
    let feb = ledger.get_mut(&month(2025, 2)).unwrap();
    feb.initial_balance = dec!(850);
    feb.final_balance = dec!(850);
    let mut engine = engine_with(ledger);

    let result = engine.validate_and_correct_integrity().unwrap();

    assert!(result.is_valid, "{:?}", result.errors);
    assert_eq!(result.corrections, vec![Correction::RecalculatedFrom(month(2025, 1))]);
    assert_eq!(
        engine.ledger().get(&month(2025, 3)).unwrap().initial_balance,
        dec!(1000)
    );
}

#[test]
fn test_validate_and_correct_recomputes_last_month() {
    let mut ledger = ledger_with(dec!(1000), &[1, 2]);
    let feb = ledger.get_mut(&month(2025, 2)).unwrap();
    feb.final_balance = dec!(1234);
    let mut engine = engine_with(ledger);

    let result = engine.validate_and_correct_integrity().unwrap();

    assert!(result.is_valid);
    assert_eq!(result.corrections, vec![Correction::RecomputedMonth(month(2025, 2))]);
    assert_eq!(
        engine.ledger().get(&month(2025, 2)).unwrap().final_balance,
        dec!(1000)
    );
}

#[test]
fn test_validate_and_correct_is_idempotent() {
    let mut ledger = ledger_with(dec!(1000), &[1, 2, 3]);
    ledger.get_mut(&month(2025, 2)).unwrap().final_balance = dec!(1);
    let mut engine = engine_with(ledger);

    engine.validate_and_correct_integrity().unwrap();
    let snapshot = balances(&engine);
    let second = engine.validate_and_correct_integrity().unwrap();

    assert!(second.is_valid);
    assert!(second.corrections.is_empty());
    assert_eq!(balances(&engine), snapshot);
}

// ── cache ─────────────────────────────────────────────────────

#[test]
fn test_month_balance_hits_rebuilt_cache() {
    let mut engine = five_month_engine();

    let balance = engine.month_balance(month(2025, 3));

    assert_eq!(balance.initial_balance, dec!(1000));
    assert_eq!(balance.final_balance, dec!(1000));
    let stats = engine.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
    assert_eq!(stats.snapshot_count, 5);
}

#[test]
fn test_invalidated_month_misses_once() {
    let mut engine = five_month_engine();

    assert_eq!(engine.invalidate_cache(date(2025, 4, 20)), 2);
    engine.month_balance(month(2025, 4));
    engine.month_balance(month(2025, 4));

    let stats = engine.cache_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.invalidated_count, 1);
}

#[test]
fn test_cache_follows_changes() {
    let mut engine = five_month_engine();
    engine.month_balance(month(2025, 5));

    let salary = income(1, date(2025, 2, 10), dec!(500));
    engine
        .process_transaction_change(Operation::Create, &salary, None)
        .unwrap();

    assert_eq!(engine.month_balance(month(2025, 5)).final_balance, dec!(1500));
    assert!(!engine.cache.is_invalidated(&month(2025, 5)));
}

#[test]
fn test_missing_month_reports_carried_balance() {
    let mut engine = engine_with(ledger_with(dec!(1000), &[1, 3]));
    let salary = income(1, date(2025, 1, 10), dec!(75));
    engine
        .process_transaction_change(Operation::Create, &salary, None)
        .unwrap();

    let feb = engine.month_balance(month(2025, 2));

    assert_eq!(feb.initial_balance, dec!(1075));
    assert_eq!(feb.final_balance, dec!(1075));
    assert_eq!(feb.transaction_count, 0);
}

#[test]
fn test_clear_cache_resets_counters() {
    let mut engine = five_month_engine();
    engine.month_balance(month(2025, 1));

    engine.clear_cache();

    let stats = engine.cache_stats();
    assert_eq!(stats.snapshot_count, 0);
    assert_eq!(stats.hits, 0);
    assert!(stats.estimated_memory_bytes > 0);
}

// ── stats ─────────────────────────────────────────────────────

#[test]
fn test_performance_stats_count_propagations() {
    let mut engine = five_month_engine();
    let salary = income(1, date(2025, 2, 10), dec!(500));

    engine
        .process_transaction_change(Operation::Create, &salary, None)
        .unwrap();
    engine
        .process_transaction_change(Operation::Delete, &salary, None)
        .unwrap();

    let stats = engine.performance_stats();
    assert_eq!(stats.propagations, 2);
    assert_eq!(stats.committed, 2);
    assert_eq!(stats.months_processed, 6);
}
