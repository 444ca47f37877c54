use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tracing::debug;

use super::account::AccountRecord;
use crate::runtime::AccountReport;

/// Interface for an account report writer
#[async_trait(?Send)]
pub trait AccountsReportWriter {
  /// Write one row per account provided by the [`Iterator`], in the order they come.
  async fn write_accounts_report<'a, T>(&'a mut self, report: T) -> Result<()>
  where
    T: Iterator<Item = AccountReport> + 'a;
}

/// An implementation of [`AccountsReportWriter`] for the CSV format.
pub struct CsvAccountsReportWriter<W>(W);

impl<W> CsvAccountsReportWriter<W>
where
  W: AsyncWrite + Unpin + Send + Sync,
{
  pub fn new(writer: W) -> Self {
    Self(writer)
  }
}

#[async_trait(?Send)]
impl<W> AccountsReportWriter for CsvAccountsReportWriter<W>
where
  W: AsyncWrite + Unpin + Send + Sync,
{
  async fn write_accounts_report<'a, T>(&'a mut self, report: T) -> Result<()>
  where
    T: Iterator<Item = AccountReport> + 'a,
  {
    let mut serializer = csv_async::AsyncSerializer::from_writer(&mut self.0);
    let mut rows = 0usize;
    for account_report in report {
      serializer
        .serialize(AccountRecord::from(account_report))
        .await?;
      rows += 1;
    }
    serializer.flush().await?;
    debug!(rows, "Accounts report written");
    Ok(())
  }
}
