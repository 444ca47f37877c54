//! This module contains all the components needed to read and write data from files (specifically CSV)
//!
//! The [`reader`] module reads ledger operations from CSV and the [`writer`] module writes the accounts report into CSV.
//! Other file formats can be supported by implementing the traits [`OperationsReader`] and [`AccountsReportWriter`].
//!
//! The [`account`] and [`operation`] modules contain the structs used to serialize/deserialize data,
//! kept apart from the domain model so that the file formats can evolve on their own.
//!

mod account;
mod operation;
mod reader;
mod writer;

pub use reader::{CsvOperationsReader, OperationsReader};
pub use writer::{AccountsReportWriter, CsvAccountsReportWriter};
