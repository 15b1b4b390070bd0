//! Incremental balance engine.
//!
//! Owns the ledger and ties the impact calculator, the cascade manager and
//! the balance cache together. Every mutation follows the same path: compute
//! the impact, invalidate the cache from the origin month, apply the change
//! to the origin bucket(s), recompute them, then carry the delta forward.

mod cache;

pub use cache::{BalanceCache, BalanceSnapshot, CacheStats, MonthBalance};

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cascade::{
    CascadeManager, Correction, IntegrityViolation, PerformanceStats, PropagationError,
    PropagationOptions, PropagationResult, ValidationResult,
};
use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::impact::{optimize_impact_order, Impact, ImpactCalculator, Operation, TransactionChange};
use crate::models::{Ledger, MonthKey, MonthlyBucket, Transaction};

/// Buckets as they were before the engine touched them. `None` marks a
/// bucket the engine created.
type Originals = BTreeMap<MonthKey, Option<MonthlyBucket>>;

pub struct Engine {
    ledger: Ledger,
    calculator: ImpactCalculator,
    cascade: CascadeManager,
    cache: BalanceCache,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(config: LedgerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_ledger(Ledger::new(), config, clock)
    }

    pub fn with_ledger(ledger: Ledger, config: LedgerConfig, clock: Arc<dyn Clock>) -> Self {
        let mut engine = Self {
            ledger,
            calculator: ImpactCalculator::new(config.impact),
            cascade: CascadeManager::new(config.propagation, Arc::clone(&clock)),
            cache: BalanceCache::new(),
            clock,
        };
        engine.rebuild_cache();
        engine
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn into_ledger(self) -> Ledger {
        self.ledger
    }

    pub fn calculator(&self) -> &ImpactCalculator {
        &self.calculator
    }

    pub fn cascade(&self) -> &CascadeManager {
        &self.cascade
    }

    /// Apply one create, update or delete and propagate its balance effect.
    ///
    /// The change is checked against the stored ledger first: a create must
    /// use a new id, an update or delete must name the stored version. A
    /// failed propagation that rolled back also undoes the change itself.
    pub fn process_transaction_change(
        &mut self,
        operation: Operation,
        transaction: &Transaction,
        old_transaction: Option<&Transaction>,
    ) -> Result<PropagationResult> {
        let impact = self
            .calculator
            .calculate_impact(operation, transaction, old_transaction)?;
        check_against_ledger(&self.ledger, operation, transaction, old_transaction)?;

        let origin = impact.origin_month();
        self.cache.invalidate_from(origin);
        self.cache.mark_invalidated(&impact.affected_periods);

        let move_impacts = moved_update(operation, transaction, old_transaction)
            .map(|old| self.split_move(old, transaction))
            .transpose()?;

        let now = self.clock.now();
        let mut originals = Originals::new();
        let touched = match apply_change(
            &mut self.ledger,
            operation,
            transaction,
            old_transaction,
            now,
            &mut originals,
        ) {
            Ok(touched) => touched,
            Err(err) => return self.abandon(originals, err),
        };

        let options = self.options_covering_ledger();
        let outcome = match move_impacts {
            Some(impacts) => self
                .cascade
                .propagate_batch(&mut self.ledger, &impacts, &options),
            None => self.cascade.propagate_from_date(
                &mut self.ledger,
                origin.next().first_day(),
                &impact,
                &options,
            ),
        };
        self.settle(outcome, originals, touched, now)
    }

    /// Apply a set of changes and propagate them together.
    ///
    /// Changes that fail validation are skipped and reported as warnings.
    /// When the batch reaches too many months it is settled with a full
    /// recalculation from the earliest touched month instead.
    pub fn process_batch_changes(
        &mut self,
        changes: &[TransactionChange],
    ) -> Result<PropagationResult> {
        let now = self.clock.now();
        let mut originals = Originals::new();
        let mut touched = BTreeSet::new();
        let mut applied = Vec::with_capacity(changes.len());
        let mut impacts = Vec::new();
        let mut skipped = Vec::new();

        // Every bucket the batch may need exists before the first change
        // lands, so none of them starts from an already-updated balance.
        for change in changes {
            let months = target_months(
                change.operation,
                &change.transaction,
                change.previous.as_ref(),
            );
            ensure_buckets(&mut self.ledger, &months, now, &mut originals);
        }

        for change in changes {
            let previous = change.previous.as_ref();
            let prepared = self
                .calculator
                .calculate_impact(change.operation, &change.transaction, previous)
                .and_then(|impact| {
                    check_against_ledger(
                        &self.ledger,
                        change.operation,
                        &change.transaction,
                        previous,
                    )
                    .map(|()| impact)
                });
            let prepared = prepared.and_then(|impact| {
                match moved_update(change.operation, &change.transaction, previous) {
                    Some(old) => self.split_move(old, &change.transaction),
                    None => Ok(vec![impact]),
                }
            });
            let change_impacts = match prepared {
                Ok(change_impacts) => change_impacts,
                Err(err) => {
                    warn!(
                        transaction_id = change.transaction.id,
                        operation = %change.operation,
                        "skipping change: {err}"
                    );
                    skipped.push(format!(
                        "Skipped {} of transaction {}: {err}",
                        change.operation, change.transaction.id
                    ));
                    continue;
                }
            };

            match apply_change(
                &mut self.ledger,
                change.operation,
                &change.transaction,
                previous,
                now,
                &mut originals,
            ) {
                Ok(months) => touched.extend(months),
                Err(err) => return self.abandon(originals, err),
            }

            impacts.extend(change_impacts);
            applied.push(change.clone());
        }

        let unused: Vec<MonthKey> = originals
            .iter()
            .filter(|(month, original)| original.is_none() && !touched.contains(*month))
            .map(|(month, _)| *month)
            .collect();
        for month in unused {
            self.ledger.remove_bucket(&month);
            originals.remove(&month);
        }

        let hint = self.calculator.calculate_batch_impact(&applied);
        for impact in &hint.impacts {
            self.cache.mark_invalidated(&impact.affected_periods);
        }
        if let Some(earliest) = touched.first() {
            self.cache.invalidate_from(*earliest);
        }
        debug!(
            changes = changes.len(),
            applied = applied.len(),
            affected_months = hint.total_affected_months,
            estimated_us = hint.estimated_processing_time.as_micros() as u64,
            "batch prepared"
        );

        optimize_impact_order(&mut impacts);
        let touched: Vec<MonthKey> = touched.into_iter().collect();
        let outcome = match touched.first() {
            Some(earliest) if hint.requires_full_recalculation => {
                info!(
                    affected_months = hint.total_affected_months,
                    from = %earliest,
                    "batch too wide for incremental propagation, recalculating"
                );
                self.recalculate_from_month(*earliest)
            }
            _ => {
                let options = self.options_covering_ledger();
                self.cascade
                    .propagate_batch(&mut self.ledger, &impacts, &options)
            }
        };

        let mut result = self.settle(outcome, originals, touched, now)?;
        result.warnings.extend(skipped);
        Ok(result)
    }

    /// Rebuild every bucket from the month of `date` onward: each initial
    /// balance is taken from its predecessor, each final balance recomputed.
    pub fn recalculate_from_date(&mut self, date: NaiveDate) -> Result<PropagationResult> {
        self.recalculate_from_month(MonthKey::from_date(date))
    }

    /// Validate the whole ledger, repair what can be repaired, and validate
    /// again. Repairs are attempted once.
    pub fn validate_and_correct_integrity(&mut self) -> Result<ValidationResult> {
        let first = self.cascade.validate_propagation_integrity(&self.ledger, None);
        if first.is_valid {
            return Ok(first);
        }

        let mut recalculate_from: Option<MonthKey> = None;
        let mut recompute_only = BTreeSet::new();
        for violation in &first.errors {
            let month = violation.month();
            let standalone = matches!(violation, IntegrityViolation::BalanceInconsistent { .. })
                && self.ledger.successor(month).is_none();
            if standalone {
                recompute_only.insert(month);
            } else {
                recalculate_from = Some(recalculate_from.map_or(month, |m| m.min(month)));
            }
        }

        let mut corrections = Vec::new();
        let now = self.clock.now();
        {
            let _guard = self.cascade.try_begin()?;
            for month in &recompute_only {
                if recalculate_from.is_some_and(|from| from <= *month) {
                    continue;
                }
                if let Some(bucket) = self.ledger.get_mut(month) {
                    match bucket.recompute(now) {
                        Ok(_) => corrections.push(Correction::RecomputedMonth(*month)),
                        Err(err) => warn!(%month, "could not recompute: {err}"),
                    }
                }
            }
        }
        let recomputed: Vec<MonthKey> = recompute_only.into_iter().collect();
        self.cache.refresh(&self.ledger, &recomputed, now);

        if let Some(from) = recalculate_from {
            let result = self.recalculate_from_month(from)?;
            if result.success {
                corrections.push(Correction::RecalculatedFrom(from));
            } else {
                for failure in &result.errors {
                    warn!(%from, "recalculation incomplete: {failure}");
                }
            }
        }

        let mut second = self.cascade.validate_propagation_integrity(&self.ledger, None);
        info!(
            violations_before = first.errors.len(),
            violations_after = second.errors.len(),
            corrections = corrections.len(),
            "integrity check finished"
        );
        second.corrections = corrections;
        Ok(second)
    }

    /// Balances of `month`, from the cache when fresh.
    pub fn month_balance(&mut self, month: MonthKey) -> MonthBalance {
        let now = self.clock.now();
        self.cache.lookup(&self.ledger, month, now)
    }

    pub fn rebuild_cache(&mut self) {
        let now = self.clock.now();
        self.cache.rebuild(&self.ledger, now);
        debug!(months = self.cache.len(), "balance cache rebuilt");
    }

    /// Mark the month of `from_date` and everything after it stale.
    pub fn invalidate_cache(&mut self, from_date: NaiveDate) -> usize {
        self.cache.invalidate_from(MonthKey::from_date(from_date))
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats(&self.ledger)
    }

    pub fn performance_stats(&self) -> PerformanceStats {
        self.cascade.performance_stats()
    }

    fn recalculate_from_month(&mut self, from: MonthKey) -> Result<PropagationResult> {
        let batch_size = self.cascade.default_options().batch_size.max(1);
        let guard = self.cascade.try_begin()?;
        let started = Instant::now();
        let now = self.clock.now();
        let propagation_id = Uuid::new_v4().to_string();
        info!(%propagation_id, %from, "starting recalculation");

        self.cache.invalidate_from(from);
        let (processed, errors) =
            recalculate_chain(&mut self.ledger, from, batch_size, now, &propagation_id);
        self.cache.refresh(&self.ledger, &processed, now);
        drop(guard);

        let elapsed = started.elapsed();
        self.cascade
            .record_recalculation(&propagation_id, processed.len(), elapsed);
        info!(
            %propagation_id,
            months = processed.len(),
            failures = errors.len(),
            elapsed_us = elapsed.as_micros() as u64,
            "recalculation finished"
        );

        Ok(PropagationResult {
            propagation_id,
            success: errors.is_empty(),
            affected_transactions: count_transactions(&self.ledger, &processed),
            processed_months: processed,
            errors,
            warnings: Vec::new(),
            rollback_performed: false,
            elapsed,
        })
    }

    /// Default options with the end date pushed out to cover the last bucket.
    fn options_covering_ledger(&self) -> PropagationOptions {
        let mut options = self.cascade.default_options();
        let default_end = self.cascade.default_end_date();
        let end = self
            .ledger
            .last_month()
            .map(|m| m.last_day().max(default_end))
            .unwrap_or(default_end);
        options.end_date = Some(end);
        options
    }

    /// A transaction moved between months leaves its old month and arrives
    /// in its new one.
    fn split_move(&self, old: &Transaction, new: &Transaction) -> Result<Vec<Impact>> {
        Ok(vec![
            self.calculator.calculate_impact(Operation::Delete, old, None)?,
            self.calculator.calculate_impact(Operation::Create, new, None)?,
        ])
    }

    fn settle(
        &mut self,
        outcome: Result<PropagationResult>,
        originals: Originals,
        touched: Vec<MonthKey>,
        now: DateTime<Utc>,
    ) -> Result<PropagationResult> {
        let mut result = match outcome {
            Ok(result) => result,
            Err(LedgerError::ConcurrentPropagation) => {
                restore_originals(&mut self.ledger, originals);
                return Err(LedgerError::ConcurrentPropagation);
            }
            Err(err) => return Err(err),
        };

        if result.rollback_performed {
            let restored: Vec<MonthKey> = originals.keys().copied().collect();
            restore_originals(&mut self.ledger, originals);
            self.cache.refresh(&self.ledger, &restored, now);
            warn!(
                propagation_id = %result.propagation_id,
                "change undone after rolled back propagation"
            );
            return Ok(result);
        }

        let months: BTreeSet<MonthKey> = touched
            .into_iter()
            .chain(result.processed_months.iter().copied())
            .collect();
        result.processed_months = months.into_iter().collect();
        result.affected_transactions = count_transactions(&self.ledger, &result.processed_months);
        self.cache.refresh(&self.ledger, &result.processed_months, now);
        Ok(result)
    }

    /// Undo a change whose origin buckets could not be updated.
    fn abandon(&mut self, originals: Originals, err: LedgerError) -> Result<PropagationResult> {
        restore_originals(&mut self.ledger, originals);
        match err {
            LedgerError::BatchFailure { month, .. } => {
                let failure = PropagationError::batch_failure(month, err);
                warn!("change abandoned: {failure}");
                Ok(PropagationResult {
                    propagation_id: Uuid::new_v4().to_string(),
                    success: false,
                    processed_months: Vec::new(),
                    affected_transactions: 0,
                    errors: vec![failure],
                    warnings: Vec::new(),
                    rollback_performed: true,
                    elapsed: Duration::ZERO,
                })
            }
            other => Err(other),
        }
    }
}

fn moved_update<'a>(
    operation: Operation,
    transaction: &Transaction,
    old_transaction: Option<&'a Transaction>,
) -> Option<&'a Transaction> {
    match (operation, old_transaction) {
        (Operation::Update, Some(old)) if old.month() != transaction.month() => Some(old),
        _ => None,
    }
}

fn check_against_ledger(
    ledger: &Ledger,
    operation: Operation,
    transaction: &Transaction,
    old_transaction: Option<&Transaction>,
) -> Result<()> {
    let id = transaction.id;
    let stored = ledger.find_transaction(id);
    match operation {
        Operation::Create => {
            if stored.is_some() {
                return Err(LedgerError::InvalidOperation(format!(
                    "transaction {id} already exists"
                )));
            }
        }
        Operation::Update | Operation::Delete => {
            let stored = stored.ok_or_else(|| {
                LedgerError::InvalidOperation(format!("transaction {id} not found"))
            })?;
            let expected = match operation {
                Operation::Update => old_transaction,
                _ => Some(transaction),
            };
            if expected != Some(stored) {
                return Err(LedgerError::InvalidOperation(format!(
                    "transaction {id} does not match the stored version"
                )));
            }
        }
    }
    Ok(())
}

/// Write the change into its origin bucket(s) and recompute them. Buckets are
/// created before anything is mutated so new ones start from the untouched
/// preceding balance.
fn apply_change(
    ledger: &mut Ledger,
    operation: Operation,
    transaction: &Transaction,
    old_transaction: Option<&Transaction>,
    now: DateTime<Utc>,
    originals: &mut Originals,
) -> Result<Vec<MonthKey>> {
    let new_month = transaction.month();
    let months = target_months(operation, transaction, old_transaction);
    ensure_buckets(ledger, &months, now, originals);

    let source_month = match (operation, old_transaction) {
        (Operation::Update, Some(old)) => old.month(),
        _ => new_month,
    };
    if matches!(operation, Operation::Update | Operation::Delete)
        && bucket_mut(ledger, source_month)?.remove(transaction.id).is_none()
    {
        return Err(LedgerError::InvalidOperation(format!(
            "transaction {} not found in {source_month}",
            transaction.id
        )));
    }
    if matches!(operation, Operation::Create | Operation::Update)
        && !bucket_mut(ledger, new_month)?.insert(transaction.clone())
    {
        return Err(LedgerError::InvalidOperation(format!(
            "transaction {} already exists in {new_month}",
            transaction.id
        )));
    }

    for month in &months {
        bucket_mut(ledger, *month)?.recompute(now)?;
    }
    Ok(months)
}

/// Months whose buckets a change writes to, in order.
fn target_months(
    operation: Operation,
    transaction: &Transaction,
    old_transaction: Option<&Transaction>,
) -> Vec<MonthKey> {
    let new_month = transaction.month();
    match old_transaction.filter(|_| operation == Operation::Update) {
        Some(old) if old.month() < new_month => vec![old.month(), new_month],
        Some(old) if old.month() > new_month => vec![new_month, old.month()],
        _ => vec![new_month],
    }
}

fn ensure_buckets(
    ledger: &mut Ledger,
    months: &[MonthKey],
    now: DateTime<Utc>,
    originals: &mut Originals,
) {
    for month in months {
        originals
            .entry(*month)
            .or_insert_with(|| ledger.get(month).cloned());
        ledger.get_or_create(*month, now);
    }
}

fn bucket_mut(ledger: &mut Ledger, month: MonthKey) -> Result<&mut MonthlyBucket> {
    ledger.get_mut(&month).ok_or(LedgerError::BatchFailure {
        month,
        reason: "bucket missing".into(),
    })
}

fn restore_originals(ledger: &mut Ledger, originals: Originals) {
    for (month, original) in originals {
        match original {
            Some(bucket) => {
                ledger.insert_bucket(bucket);
            }
            None => {
                ledger.remove_bucket(&month);
            }
        }
    }
}

/// Walk every bucket from `from` onward in batches, chaining balances. Stops
/// at the first month that cannot be recomputed.
fn recalculate_chain(
    ledger: &mut Ledger,
    from: MonthKey,
    batch_size: usize,
    now: DateTime<Utc>,
    propagation_id: &str,
) -> (Vec<MonthKey>, Vec<PropagationError>) {
    let months = ledger.months_from(from);
    let mut carry = ledger.predecessor(from).map(|b| b.final_balance);
    let mut processed = Vec::with_capacity(months.len());

    for (index, batch) in months.chunks(batch_size).enumerate() {
        debug!(%propagation_id, batch = index, months = batch.len(), "recalculating batch");
        for month in batch {
            let Some(bucket) = ledger.get_mut(month) else {
                continue;
            };
            if let Some(initial) = carry {
                bucket.initial_balance = initial;
            }
            match bucket.recompute(now) {
                Ok(final_balance) => {
                    carry = Some(final_balance);
                    processed.push(*month);
                }
                Err(err) => {
                    let failure = PropagationError::batch_failure(*month, err);
                    warn!(%propagation_id, "{failure}");
                    return (processed, vec![failure]);
                }
            }
        }
    }
    (processed, Vec::new())
}

fn count_transactions(ledger: &Ledger, months: &[MonthKey]) -> usize {
    months
        .iter()
        .filter_map(|m| ledger.get(m))
        .map(|b| b.transaction_count())
        .sum()
}

#[cfg(test)]
mod tests;
