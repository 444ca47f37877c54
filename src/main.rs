mod config;
mod io;
mod ledger;
mod processors;
mod runtime;
mod store;

use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncRead;
use tokio_stream::StreamExt;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::LedgerConfig;
use crate::io::{CsvAccountsReportWriter, CsvOperationsReader};
use crate::runtime::{InMemoryAccountStore, InMemoryTransferStore, Ledger};

#[tokio::main]
async fn main() -> Result<()> {
  init_tracing();

  let config = LedgerConfig::from_env()?;
  let reader = get_operations_async_read().await?;
  let operations_reader = CsvOperationsReader::new(reader);
  let ledger = Ledger::new(
    Arc::new(InMemoryAccountStore::new()),
    Arc::new(InMemoryTransferStore::new()),
    config,
  );
  ledger.recover_transfers().await?;
  let accounts_report_writer = CsvAccountsReportWriter::new(tokio::io::stdout());

  let result = processors::simple::run(operations_reader, &ledger, accounts_report_writer).await;
  log_transfer_journal(&ledger).await;
  result
}

/// Follow every persisted transfer event from the beginning of the journal, in persisted order.
async fn log_transfer_journal(ledger: &Ledger<InMemoryAccountStore, InMemoryTransferStore>) {
  let mut events = ledger.transfer_events(0);
  let mut count = 0usize;
  while let Some(envelope) = events.next().await {
    count += 1;
    debug!(
      persistence_id = %envelope.persistence_id,
      sequence_nr = envelope.sequence_nr,
      offset = envelope.offset,
      event = envelope.event.name(),
      "Transfer journal"
    );
  }
  info!(events = count, "Transfer journal followed");
}

/// Logs go to stderr, so that stdout only carries the accounts report.
/// The level defaults to `info` and can be changed with `RUST_LOG`.
fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();
}

type OperationsAsyncRead = Box<dyn AsyncRead + Unpin + Send + Sync>;

/// This allows to use either a file if the path is specified in the command line,
/// or the stdin otherwise, which might be more convenient for pipe the data.
async fn get_operations_async_read() -> Result<OperationsAsyncRead> {
  match std::env::args().nth(1) {
    Some(path) => tokio::fs::File::open(path)
      .await
      .map(|file| Box::new(file) as OperationsAsyncRead)
      .map_err(anyhow::Error::from),
    None => Ok(Box::new(tokio::io::stdin()) as OperationsAsyncRead),
  }
}
