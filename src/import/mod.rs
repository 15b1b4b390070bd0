//! Loading transactions from bank-style CSV exports.

mod csv_import;

pub use csv_import::{CsvImporter, CsvProfile};
