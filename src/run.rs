mod cli;

pub(crate) use cli::as_cli;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use monthledger::cascade::PropagationResult;
use monthledger::clock::SystemClock;
use monthledger::config::LedgerConfig;
use monthledger::db::BucketStore;
use monthledger::engine::Engine;

/// The stored ledger loaded into an engine for the length of one command.
pub(crate) struct Session {
    store: BucketStore,
    engine: Engine,
}

impl Session {
    pub(crate) fn open(db_path: &Path, config: LedgerConfig) -> Result<Self> {
        let store = BucketStore::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        let ledger = store.load_ledger().context("Failed to load ledger")?;
        let engine = Engine::with_ledger(ledger, config, Arc::new(SystemClock));
        Ok(Self { store, engine })
    }

    pub(crate) fn engine(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Write the ledger back only when the change propagated cleanly.
    pub(crate) fn commit(&mut self, result: &PropagationResult) -> Result<()> {
        for error in &result.errors {
            eprintln!("  error: {error}");
        }
        for warning in &result.warnings {
            eprintln!("  warning: {warning}");
        }
        if result.rollback_performed {
            anyhow::bail!("Change rolled back, nothing saved");
        }
        if !result.success {
            warn!(
                propagation_id = %result.propagation_id,
                errors = result.errors.len(),
                "propagation failed, ledger not saved"
            );
            anyhow::bail!(
                "Change failed with {} errors, nothing saved (run `validate --fix`)",
                result.errors.len()
            );
        }
        self.save()
    }

    pub(crate) fn save(&mut self) -> Result<()> {
        self.store
            .save_ledger(self.engine.ledger())
            .context("Failed to save ledger")
    }
}
