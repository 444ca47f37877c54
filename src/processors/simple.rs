use anyhow::Result;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::io::{AccountsReportWriter, OperationsReader};
use crate::ledger::TransferId;
use crate::runtime::{LedgerService, TransferOutcome};

use super::Operation;

/// This is a simple processor of operations that
/// - reads operations from an [`OperationsReader`]
/// - applies them one after the other on a [`LedgerService`], waiting for every transfer to settle
/// - writes a report including the state of every account using an [`AccountsReportWriter`]
///
/// Transfers get sequential ids (`Transfer-1`, `Transfer-2`, ...) in the order they are read.
///
/// This processor tries to be as resilient as possible, meaning that:
/// - errors from the operations reader will be logged and skipped
/// - operations refused by the ledger will be logged and skipped
///
pub async fn run<R, L, W>(
  mut operations_reader: R,
  ledger: &L,
  mut accounts_report_writer: W,
) -> Result<()>
where
  R: OperationsReader,
  L: LedgerService,
  W: AccountsReportWriter,
{
  let mut operations = operations_reader.read_operations();
  let mut transfers = 0u64;

  while let Some(maybe_operation) = operations.next().await {
    match maybe_operation {
      Ok(Operation::Open {
        account_id,
        name,
        balance,
      }) => {
        if let Err(err) = ledger.open_account(account_id.clone(), name, balance).await {
          warn!(%account_id, %err, "Account not opened");
        }
      }
      Ok(Operation::Transfer {
        debtor,
        creditor,
        amount,
      }) => {
        transfers += 1;
        let transfer_id = TransferId::new(format!("Transfer-{}", transfers));
        match ledger
          .transfer(transfer_id.clone(), amount, creditor, debtor)
          .await
        {
          Ok(TransferOutcome::Completed) => info!(%transfer_id, "Transfer completed"),
          Ok(outcome) => warn!(%transfer_id, ?outcome, "Transfer not completed"),
          Err(err) => warn!(%transfer_id, %err, "Transfer not processed"),
        }
      }
      Err(err) => warn!(%err, "Skipping unreadable operation"),
    }
  }

  let report = ledger.accounts_report().await?;
  accounts_report_writer
    .write_accounts_report(report.into_iter())
    .await
}
