//! Pushes balance deltas forward through the monthly buckets.
//!
//! One propagation runs at a time per manager. A propagation walks the
//! affected months in fixed-size batches, strictly in chronological order,
//! optionally under a snapshot that is restored if any month fails.

mod integrity;
mod snapshot;

pub use integrity::{Correction, IntegrityViolation, ValidationResult};
pub use snapshot::PropagationSnapshot;

pub(crate) use integrity::validate;

use chrono::{Datelike, NaiveDate};
use parking_lot::{Mutex, MutexGuard};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::PropagationConfig;
use crate::error::{LedgerError, Result};
use crate::impact::Impact;
use crate::models::{Ledger, MonthKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationPhase {
    Idle,
    Snapshotting,
    Batching,
    Validating,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationOptions {
    pub batch_size: usize,
    pub rollback_on_error: bool,
    pub validate_integrity: bool,
    /// Last day to propagate into. Defaults to December 31, two years out.
    pub end_date: Option<NaiveDate>,
}

impl From<&PropagationConfig> for PropagationOptions {
    fn from(config: &PropagationConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            rollback_on_error: config.rollback_on_error,
            validate_integrity: config.validate_integrity,
            end_date: None,
        }
    }
}

impl Default for PropagationOptions {
    fn default() -> Self {
        Self::from(&PropagationConfig::default())
    }
}

/// Expected failure inside a propagation, carried in the result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropagationError {
    #[error("Failed to apply balance change to {month}: {reason}")]
    BatchFailure { month: MonthKey, reason: String },

    #[error(transparent)]
    Integrity(#[from] IntegrityViolation),
}

impl PropagationError {
    pub(crate) fn batch_failure(month: MonthKey, err: LedgerError) -> Self {
        let reason = match err {
            LedgerError::BatchFailure { reason, .. } => reason,
            other => other.to_string(),
        };
        Self::BatchFailure { month, reason }
    }
}

#[derive(Debug, Clone)]
pub struct PropagationResult {
    pub propagation_id: String,
    pub success: bool,
    pub processed_months: Vec<MonthKey>,
    pub affected_transactions: usize,
    pub errors: Vec<PropagationError>,
    pub warnings: Vec<String>,
    pub rollback_performed: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerformanceStats {
    pub propagations: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub rejected: u64,
    pub recalculations: u64,
    pub months_processed: u64,
    pub total_elapsed: Duration,
    pub last_propagation_id: Option<String>,
}

impl PerformanceStats {
    pub fn average_elapsed(&self) -> Duration {
        if self.propagations == 0 {
            Duration::ZERO
        } else {
            self.total_elapsed / self.propagations as u32
        }
    }
}

/// Proof that the caller holds the manager's single propagation slot.
pub struct PropagationGuard<'a> {
    _slot: MutexGuard<'a, ()>,
}

pub struct CascadeManager {
    config: PropagationConfig,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<()>,
    phase: Mutex<PropagationPhase>,
    stats: Mutex<PerformanceStats>,
}

impl CascadeManager {
    pub fn new(config: PropagationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            in_flight: Mutex::new(()),
            phase: Mutex::new(PropagationPhase::Idle),
            stats: Mutex::new(PerformanceStats::default()),
        }
    }

    pub fn default_options(&self) -> PropagationOptions {
        PropagationOptions::from(&self.config)
    }

    /// December 31, `default_horizon_years` after today.
    pub fn default_end_date(&self) -> NaiveDate {
        i32::try_from(self.config.default_horizon_years)
            .ok()
            .and_then(|years| self.clock.today().year().checked_add(years))
            .and_then(|year| NaiveDate::from_ymd_opt(year, 12, 31))
            .unwrap_or(NaiveDate::MAX)
    }

    /// Claim the propagation slot, failing immediately if it is taken.
    pub fn try_begin(&self) -> Result<PropagationGuard<'_>> {
        match self.in_flight.try_lock() {
            Some(slot) => Ok(PropagationGuard { _slot: slot }),
            None => {
                self.stats.lock().rejected += 1;
                warn!("rejected propagation: another propagation is in progress");
                Err(LedgerError::ConcurrentPropagation)
            }
        }
    }

    pub fn is_propagating(&self) -> bool {
        self.in_flight.is_locked()
    }

    /// Phase of the running propagation, or the outcome of the last one.
    pub fn phase(&self) -> PropagationPhase {
        *self.phase.lock()
    }

    pub fn performance_stats(&self) -> PerformanceStats {
        self.stats.lock().clone()
    }

    /// Count a full recalculation run outside the cascade itself.
    pub(crate) fn record_recalculation(
        &self,
        propagation_id: &str,
        months: usize,
        elapsed: Duration,
    ) {
        let mut stats = self.stats.lock();
        stats.recalculations += 1;
        stats.months_processed += months as u64;
        stats.total_elapsed += elapsed;
        stats.last_propagation_id = Some(propagation_id.to_string());
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = PerformanceStats::default();
    }

    /// Carry `impact.difference` into every existing bucket from
    /// `start_date`'s month through the end date.
    pub fn propagate_from_date(
        &self,
        ledger: &mut Ledger,
        start_date: NaiveDate,
        impact: &Impact,
        options: &PropagationOptions,
    ) -> Result<PropagationResult> {
        let _guard = self.try_begin()?;
        let propagation_id = Uuid::new_v4().to_string();
        let start = MonthKey::from_date(start_date);
        let end = MonthKey::from_date(options.end_date.unwrap_or_else(|| self.default_end_date()));

        info!(
            %propagation_id,
            transaction_id = impact.transaction_id,
            operation = %impact.operation,
            difference = %impact.difference,
            from = %start,
            to = %end,
            "starting propagation"
        );

        let plan: Vec<(MonthKey, Decimal)> = ledger
            .months_between(start, end)
            .into_iter()
            .map(|m| (m, impact.difference))
            .collect();
        self.run(ledger, propagation_id, plan, options)
    }

    /// Net the impacts per origin month, then carry each month's net delta
    /// into every later bucket.
    pub fn propagate_batch(
        &self,
        ledger: &mut Ledger,
        impacts: &[Impact],
        options: &PropagationOptions,
    ) -> Result<PropagationResult> {
        let _guard = self.try_begin()?;
        let propagation_id = Uuid::new_v4().to_string();

        let mut net: BTreeMap<MonthKey, Decimal> = BTreeMap::new();
        for impact in impacts {
            let month = impact.origin_month();
            let entry = net.entry(month).or_default();
            match entry.checked_add(impact.difference) {
                Some(sum) => *entry = sum,
                None => return Ok(self.reject_overflow(ledger, propagation_id, month)),
            }
        }

        let Some(first) = net.keys().next().copied() else {
            return self.run(ledger, propagation_id, Vec::new(), options);
        };
        let end = MonthKey::from_date(options.end_date.unwrap_or_else(|| self.default_end_date()));
        info!(
            %propagation_id,
            impacts = impacts.len(),
            origin_months = net.len(),
            from = %first,
            to = %end,
            "starting batch propagation"
        );

        let plan = match carry_plan(ledger.months_between(first.next(), end), &net) {
            Ok(plan) => plan,
            Err(month) => return Ok(self.reject_overflow(ledger, propagation_id, month)),
        };
        self.run(ledger, propagation_id, plan, options)
    }

    pub fn validate_propagation_integrity(
        &self,
        ledger: &Ledger,
        months: Option<&[MonthKey]>,
    ) -> ValidationResult {
        validate(ledger, months)
    }

    fn reject_overflow(
        &self,
        ledger: &Ledger,
        propagation_id: String,
        month: MonthKey,
    ) -> PropagationResult {
        warn!(%propagation_id, %month, "net delta overflow, nothing applied");
        let errors = vec![PropagationError::BatchFailure {
            month,
            reason: "net delta overflow".into(),
        }];
        self.finish(ledger, propagation_id, Vec::new(), errors, Vec::new(), false, Instant::now())
    }

    fn set_phase(&self, phase: PropagationPhase) {
        *self.phase.lock() = phase;
    }

    fn run(
        &self,
        ledger: &mut Ledger,
        propagation_id: String,
        plan: Vec<(MonthKey, Decimal)>,
        options: &PropagationOptions,
    ) -> Result<PropagationResult> {
        let started = Instant::now();
        let now = self.clock.now();
        let batch_size = options.batch_size.max(1);

        self.set_phase(PropagationPhase::Snapshotting);
        let snapshot = options.rollback_on_error.then(|| {
            let months: Vec<MonthKey> = plan.iter().map(|(m, _)| *m).collect();
            PropagationSnapshot::capture(&propagation_id, ledger, &months)
        });

        self.set_phase(PropagationPhase::Batching);
        let mut processed = Vec::with_capacity(plan.len());
        let mut errors = Vec::new();

        for (index, batch) in plan.chunks(batch_size).enumerate() {
            debug!(%propagation_id, batch = index, months = batch.len(), "processing batch");
            for (month, delta) in batch {
                let applied = match ledger.get_mut(month) {
                    Some(bucket) => bucket.shift(*delta, now),
                    None => Err(LedgerError::BatchFailure {
                        month: *month,
                        reason: "bucket missing".into(),
                    }),
                };
                match applied {
                    Ok(()) => processed.push(*month),
                    Err(err) => {
                        let failure = PropagationError::batch_failure(*month, err);
                        warn!(%propagation_id, "{failure}");
                        errors.push(failure);

                        if let Some(snapshot) = &snapshot {
                            return self.roll_back(
                                ledger,
                                snapshot,
                                propagation_id,
                                errors,
                                started,
                            );
                        }
                        // Partial application: drop the rest of this batch.
                        break;
                    }
                }
            }
        }

        let mut warnings = Vec::new();
        if options.validate_integrity {
            self.set_phase(PropagationPhase::Validating);
            let validation = validate(ledger, Some(&processed));
            for violation in &validation.errors {
                warn!(%propagation_id, "integrity violation after propagation: {violation}");
            }
            errors.extend(validation.errors.into_iter().map(PropagationError::from));
            warnings.extend(validation.warnings);
        }

        Ok(self.finish(ledger, propagation_id, processed, errors, warnings, false, started))
    }

    fn roll_back(
        &self,
        ledger: &mut Ledger,
        snapshot: &PropagationSnapshot,
        propagation_id: String,
        errors: Vec<PropagationError>,
        started: Instant,
    ) -> Result<PropagationResult> {
        match snapshot.restore(ledger) {
            Ok(restored) => {
                warn!(propagation_id = snapshot.propagation_id(), restored, "propagation rolled back");
                Ok(self.finish(ledger, propagation_id, Vec::new(), errors, Vec::new(), true, started))
            }
            Err(err) => {
                error!(%propagation_id, "rollback failed, ledger may be inconsistent: {err}");
                self.set_phase(PropagationPhase::RolledBack);
                let mut stats = self.stats.lock();
                stats.propagations += 1;
                stats.rolled_back += 1;
                stats.last_propagation_id = Some(propagation_id);
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        ledger: &Ledger,
        propagation_id: String,
        processed_months: Vec<MonthKey>,
        errors: Vec<PropagationError>,
        warnings: Vec<String>,
        rollback_performed: bool,
        started: Instant,
    ) -> PropagationResult {
        let elapsed = started.elapsed();
        let affected_transactions = processed_months
            .iter()
            .filter_map(|m| ledger.get(m))
            .map(|b| b.transaction_count())
            .sum();
        let success = errors.is_empty() && !rollback_performed;

        self.set_phase(if rollback_performed {
            PropagationPhase::RolledBack
        } else {
            PropagationPhase::Committed
        });
        {
            let mut stats = self.stats.lock();
            stats.propagations += 1;
            if rollback_performed {
                stats.rolled_back += 1;
            } else {
                stats.committed += 1;
            }
            stats.months_processed += processed_months.len() as u64;
            stats.total_elapsed += elapsed;
            stats.last_propagation_id = Some(propagation_id.clone());
        }

        info!(
            %propagation_id,
            success,
            months = processed_months.len(),
            rollback_performed,
            elapsed_us = elapsed.as_micros() as u64,
            "propagation finished"
        );

        PropagationResult {
            propagation_id,
            success,
            processed_months,
            affected_transactions,
            errors,
            warnings,
            rollback_performed,
            elapsed,
        }
    }
}

/// Pair each month with the sum of net deltas from origin months strictly
/// before it. Months with nothing to carry are left out. `Err` names the
/// month whose carry overflows.
fn carry_plan(
    months: Vec<MonthKey>,
    net: &BTreeMap<MonthKey, Decimal>,
) -> std::result::Result<Vec<(MonthKey, Decimal)>, MonthKey> {
    let mut origins = net.iter().peekable();
    let mut carry = Decimal::ZERO;
    let mut plan = Vec::with_capacity(months.len());

    for month in months {
        while let Some((origin, delta)) = origins.next_if(|(origin, _)| **origin < month) {
            carry = carry.checked_add(*delta).ok_or(*origin)?;
        }
        if !carry.is_zero() {
            plan.push((month, carry));
        }
    }
    Ok(plan)
}
