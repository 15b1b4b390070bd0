use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;

use monthledger::config::LedgerConfig;
use monthledger::impact::{Operation, TransactionChange};
use monthledger::import::{CsvImporter, CsvProfile};
use monthledger::models::{MonthKey, Transaction, TransactionKind};

use super::Session;

pub(crate) fn as_cli(args: &[String], db_path: &Path, config: LedgerConfig) -> Result<()> {
    let Some(command) = args.get(1) else {
        print_usage();
        return Ok(());
    };
    match command.as_str() {
        "add" => cli_add(&args[2..], db_path, config),
        "edit" => cli_edit(&args[2..], db_path, config),
        "delete" | "rm" => cli_delete(&args[2..], db_path, config),
        "import" => cli_import(&args[2..], db_path, config),
        "recalc" => cli_recalc(&args[2..], db_path, config),
        "validate" => cli_validate(&args[2..], db_path, config),
        "months" | "m" => cli_months(&args[2..], db_path, config),
        "stats" => cli_stats(db_path, config),
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        "--version" | "-V" | "version" => {
            println!("monthledger {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => {
            print_usage();
            anyhow::bail!("Unknown command: {other}");
        }
    }
}

fn print_usage() {
    println!("monthledger: monthly balances kept current on every change");
    println!();
    println!("Usage: monthledger <command>");
    println!();
    println!("Commands:");
    println!("  add <YYYY-MM-DD> <amount> [kind] [description]");
    println!("                                Record a transaction (kind: income, expense, info)");
    println!("  edit <id> [--date D] [--amount A] [--kind K] [--desc TEXT]");
    println!("                                Change a transaction");
    println!("  delete <id>                   Remove a transaction");
    println!("  import <file.csv>             Import date,amount,kind,description rows");
    println!("    --date-format <FMT>         chrono format of the date column (default %Y-%m-%d)");
    println!("  recalc [YYYY-MM]              Rebuild balances from a month (default: first)");
    println!("  validate [--fix]              Check continuity and conservation");
    println!("  months [YYYY-MM]              List month balances (optionally up to a month)");
    println!("  stats                         Show ledger and cache statistics");
    println!("  --help, -h                    Show this help");
    println!("  --version, -V                 Show version");
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == name)
        .map(|w| w[1].as_str())
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{s}', expected YYYY-MM-DD"))
}

fn parse_amount(s: &str) -> Result<Decimal> {
    Decimal::from_str(&s.replace(['$', ','], ""))
        .with_context(|| format!("Invalid amount '{s}'"))
}

fn parse_kind(s: &str) -> Result<TransactionKind> {
    TransactionKind::parse(s).with_context(|| {
        let known: Vec<&str> = TransactionKind::all().iter().map(|k| k.as_str()).collect();
        format!("Unknown kind '{s}' (expected one of: {})", known.join(", "))
    })
}

fn parse_id(args: &[String], usage: &str) -> Result<i64> {
    let raw = args
        .first()
        .with_context(|| format!("Usage: monthledger {usage}"))?;
    raw.parse()
        .with_context(|| format!("Invalid transaction id '{raw}'"))
}

fn cli_add(args: &[String], db_path: &Path, config: LedgerConfig) -> Result<()> {
    if args.len() < 2 {
        anyhow::bail!("Usage: monthledger add <YYYY-MM-DD> <amount> [kind] [description]");
    }
    let date = parse_date(&args[0])?;
    let amount = parse_amount(&args[1])?;
    let (kind, description) = match args.get(2).map(|s| TransactionKind::parse(s)) {
        Some(Some(kind)) => (kind, args[3..].join(" ")),
        _ if amount.is_sign_negative() => (TransactionKind::Expense, args[2..].join(" ")),
        _ => (TransactionKind::Income, args[2..].join(" ")),
    };

    let mut session = Session::open(db_path, config)?;
    let id = session.engine().ledger().next_transaction_id();
    let mut txn = Transaction::new(id, date, amount, kind);
    if !description.is_empty() {
        txn = txn.with_description(description);
    }

    let result = session
        .engine()
        .process_transaction_change(Operation::Create, &txn, None)?;
    session.commit(&result)?;
    println!(
        "Added #{id}: {} {} {} ({} months updated)",
        txn.date,
        kind,
        txn.amount,
        result.processed_months.len()
    );
    Ok(())
}

fn cli_edit(args: &[String], db_path: &Path, config: LedgerConfig) -> Result<()> {
    let usage = "edit <id> [--date D] [--amount A] [--kind K] [--desc TEXT]";
    let id = parse_id(args, usage)?;

    let mut session = Session::open(db_path, config)?;
    let previous = session
        .engine()
        .ledger()
        .find_transaction(id)
        .cloned()
        .with_context(|| format!("Transaction #{id} not found"))?;

    let mut updated = previous.clone();
    if let Some(date) = flag(args, "--date") {
        updated.date = parse_date(date)?;
    }
    if let Some(amount) = flag(args, "--amount") {
        updated.amount = parse_amount(amount)?.abs();
    }
    if let Some(kind) = flag(args, "--kind") {
        updated.kind = parse_kind(kind)?;
    }
    if let Some(desc) = flag(args, "--desc") {
        updated.description = Some(desc.to_string()).filter(|d| !d.is_empty());
    }
    if updated == previous {
        println!("Nothing to change");
        return Ok(());
    }

    let result = session
        .engine()
        .process_transaction_change(Operation::Update, &updated, Some(&previous))?;
    session.commit(&result)?;
    println!(
        "Updated #{id} ({} months updated)",
        result.processed_months.len()
    );
    Ok(())
}

fn cli_delete(args: &[String], db_path: &Path, config: LedgerConfig) -> Result<()> {
    let id = parse_id(args, "delete <id>")?;

    let mut session = Session::open(db_path, config)?;
    let txn = session
        .engine()
        .ledger()
        .find_transaction(id)
        .cloned()
        .with_context(|| format!("Transaction #{id} not found"))?;

    let result = session
        .engine()
        .process_transaction_change(Operation::Delete, &txn, None)?;
    session.commit(&result)?;
    println!(
        "Deleted #{id} ({} months updated)",
        result.processed_months.len()
    );
    Ok(())
}

fn cli_import(args: &[String], db_path: &Path, config: LedgerConfig) -> Result<()> {
    let file_path = args
        .first()
        .filter(|a| !a.starts_with('-'))
        .context("Usage: monthledger import <file.csv> [--date-format <FMT>]")?;
    let path = Path::new(file_path);
    if !path.exists() {
        anyhow::bail!("File not found: {file_path}");
    }

    let mut profile = CsvProfile::default();
    if let Some(format) = flag(args, "--date-format") {
        profile.date_format = format.to_string();
    }

    let mut session = Session::open(db_path, config)?;
    let first_id = session.engine().ledger().next_transaction_id();
    let txns = CsvImporter::import(path, &profile, first_id)?;
    println!("Parsed {} transactions", txns.len());
    if txns.is_empty() {
        return Ok(());
    }

    let changes: Vec<TransactionChange> = txns.into_iter().map(TransactionChange::create).collect();
    let result = session.engine().process_batch_changes(&changes)?;
    session.commit(&result)?;
    println!(
        "Imported {} transactions, {} months updated",
        changes.len().saturating_sub(result.warnings.len()),
        result.processed_months.len()
    );
    Ok(())
}

fn cli_recalc(args: &[String], db_path: &Path, config: LedgerConfig) -> Result<()> {
    let mut session = Session::open(db_path, config)?;
    let from = match args.first() {
        Some(raw) => MonthKey::parse(raw).with_context(|| format!("Invalid month '{raw}'"))?,
        None => match session.engine().ledger().first_month() {
            Some(month) => month,
            None => {
                println!("Ledger is empty");
                return Ok(());
            }
        },
    };

    let result = session.engine().recalculate_from_date(from.first_day())?;
    session.commit(&result)?;
    println!(
        "Recalculated {} months from {from} in {:?}",
        result.processed_months.len(),
        result.elapsed
    );
    Ok(())
}

fn cli_validate(args: &[String], db_path: &Path, config: LedgerConfig) -> Result<()> {
    let fix = args.iter().any(|a| a == "--fix");
    let mut session = Session::open(db_path, config)?;

    let result = if fix {
        let result = session.engine().validate_and_correct_integrity()?;
        if !result.corrections.is_empty() {
            session.save()?;
        }
        result
    } else {
        let engine = session.engine();
        engine
            .cascade()
            .validate_propagation_integrity(engine.ledger(), None)
    };

    for correction in &result.corrections {
        println!("  fixed: {correction:?}");
    }
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    for error in &result.errors {
        println!("  error: {error}");
    }
    if result.is_valid {
        println!("Ledger is consistent");
        Ok(())
    } else {
        anyhow::bail!("{} integrity violations", result.errors.len())
    }
}

fn cli_months(args: &[String], db_path: &Path, config: LedgerConfig) -> Result<()> {
    let until = args
        .first()
        .map(|raw| MonthKey::parse(raw).with_context(|| format!("Invalid month '{raw}'")))
        .transpose()?;

    let mut session = Session::open(db_path, config)?;
    let engine = session.engine();
    let Some(first) = engine.ledger().first_month() else {
        println!("No months");
        return Ok(());
    };
    let last = until
        .or_else(|| engine.ledger().last_month())
        .unwrap_or(first);

    println!("{:<8} {:>14} {:>14} {:>6}", "Month", "Initial", "Final", "Txns");
    println!("{}", "─".repeat(45));
    for month in first.through(last) {
        let balance = engine.month_balance(month);
        println!(
            "{:<8} {:>14.2} {:>14.2} {:>6}",
            month, balance.initial_balance, balance.final_balance, balance.transaction_count
        );
    }
    Ok(())
}

fn cli_stats(db_path: &Path, config: LedgerConfig) -> Result<()> {
    let mut session = Session::open(db_path, config)?;
    let engine = session.engine();
    let ledger = engine.ledger();
    let cache = engine.cache_stats();

    println!("Ledger");
    println!("{}", "─".repeat(40));
    println!("  Opening balance: {:.2}", ledger.opening_balance());
    println!("  Months:          {}", ledger.len());
    println!("  Transactions:    {}", ledger.transaction_count());
    if let (Some(first), Some(last)) = (ledger.first_month(), ledger.last_month()) {
        println!("  Range:           {first} .. {last}");
    }
    println!();
    println!("Cache");
    println!("{}", "─".repeat(40));
    println!("  Snapshots:       {}", cache.snapshot_count);
    println!("  Invalidated:     {}", cache.invalidated_count);
    println!("  Memory (est.):   {} bytes", cache.estimated_memory_bytes);
    Ok(())
}
