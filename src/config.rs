use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{LedgerError, Result};

/// Smallest accepted forward horizon, in months.
pub const MIN_HORIZON_MONTHS: u32 = 24;

/// Largest accepted `propagation.default_horizon_years`.
pub const MAX_HORIZON_YEARS: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub impact: ImpactConfig,
    pub propagation: PropagationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpactConfig {
    /// Months marked as affected by a change, the change's own month included.
    pub horizon_months: u32,
    /// Distinct affected months above which a batch asks for a full recalculation.
    pub full_recalculation_threshold: usize,
    pub high_priority_threshold: Decimal,
    pub medium_priority_threshold: Decimal,
    /// Rough processing cost per affected month, in microseconds.
    pub estimated_cost_per_month_us: u64,
}

impl Default for ImpactConfig {
    fn default() -> Self {
        Self {
            horizon_months: 36,
            full_recalculation_threshold: 48,
            high_priority_threshold: Decimal::from(1000),
            medium_priority_threshold: Decimal::from(100),
            estimated_cost_per_month_us: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    pub batch_size: usize,
    pub rollback_on_error: bool,
    pub validate_integrity: bool,
    /// Default propagation end: December 31 this many years after today.
    pub default_horizon_years: u32,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            batch_size: 12,
            rollback_on_error: true,
            validate_integrity: true,
            default_horizon_years: 2,
        }
    }
}

impl LedgerConfig {
    pub fn from_toml(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.propagation.batch_size == 0 {
            return Err(LedgerError::Config("propagation.batch_size must be at least 1".into()));
        }
        if self.propagation.default_horizon_years > MAX_HORIZON_YEARS {
            return Err(LedgerError::Config(format!(
                "propagation.default_horizon_years must be at most {MAX_HORIZON_YEARS}, got {}",
                self.propagation.default_horizon_years
            )));
        }
        if self.impact.horizon_months < MIN_HORIZON_MONTHS {
            return Err(LedgerError::Config(format!(
                "impact.horizon_months must be at least {MIN_HORIZON_MONTHS}, got {}",
                self.impact.horizon_months
            )));
        }
        if self.impact.medium_priority_threshold > self.impact.high_priority_threshold {
            return Err(LedgerError::Config(
                "impact.medium_priority_threshold exceeds impact.high_priority_threshold".into(),
            ));
        }
        Ok(())
    }
}
