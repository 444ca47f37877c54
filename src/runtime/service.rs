use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::LedgerConfig;
use crate::ledger::{
  AccountId, AccountOverview, Money, TransferEvent, TransferId, TransferNotification,
  TransferState, TransferStatus, TRANSFER_TAG,
};
use crate::store::{EventStream, Journal, Offset};

use super::{
  spawn_transfer, transfer_persistence_id, AccountDirectory, AccountStore, Directory, Result,
  TransferHandle, TransferStore,
};

/// State of an account used to generate reports.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountReport {
  pub account_id: AccountId,
  pub balance: Money,
  pub allocated_balance: Money,
  pub pending_transfers: usize,
}

impl AccountReport {
  pub fn new(account_id: AccountId, overview: AccountOverview) -> Self {
    Self {
      account_id,
      balance: overview.balance,
      allocated_balance: overview.allocated_balance,
      pending_transfers: overview.pending_transfers,
    }
  }
}

/// How a transfer ended, as seen by whoever requested it.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
  Completed,
  Failed { reason: String },
  Rejected { reason: String },
  /// No terminal notification arrived in time. The saga keeps going on its own.
  Unsettled,
}

/// Interface used by processors to drive a ledger
#[async_trait]
pub trait LedgerService {
  async fn open_account(&self, account_id: AccountId, name: String, balance: Money) -> Result<()>;

  /// Execute a transfer and wait for it to settle.
  async fn transfer(
    &self,
    transfer_id: TransferId,
    amount: Money,
    creditor: AccountId,
    debtor: AccountId,
  ) -> Result<TransferOutcome>;

  /// A report for every account, sorted by account id.
  async fn accounts_report(&self) -> Result<Vec<AccountReport>>;
}

/// Accounts and transfer sagas sharing one configuration.
pub struct Ledger<A, T> {
  directory: Arc<AccountDirectory<A>>,
  transfer_store: Arc<T>,
  config: LedgerConfig,
  transfers: Mutex<HashMap<TransferId, TransferHandle>>,
}

impl<A, T> Ledger<A, T>
where
  A: AccountStore,
  T: TransferStore,
{
  pub fn new(account_store: Arc<A>, transfer_store: Arc<T>, config: LedgerConfig) -> Self {
    Self {
      directory: Arc::new(AccountDirectory::new(account_store, config.clone())),
      transfer_store,
      config,
      transfers: Mutex::new(HashMap::new()),
    }
  }

  pub async fn open_account(&self, account_id: AccountId, name: String, balance: Money) -> Result<()> {
    self.directory.create(account_id, name, balance).await
  }

  /// Send `ExecuteTransfer` to the saga of `transfer_id`, starting it if needed.
  pub fn execute_transfer(
    &self,
    transfer_id: TransferId,
    amount: Money,
    creditor: AccountId,
    debtor: AccountId,
  ) -> Result<mpsc::UnboundedReceiver<TransferNotification>> {
    self.saga(transfer_id).execute(amount, creditor, debtor)
  }

  /// The status recorded in the journal of a transfer.
  pub async fn transfer_status(&self, transfer_id: &TransferId) -> Result<TransferStatus> {
    Ok(self.transfer_state(transfer_id).await?.status)
  }

  /// Every transfer event persisted after `after`, in persisted order.
  pub fn transfer_events(&self, after: Offset) -> EventStream<TransferEvent> {
    self.transfer_store.events_by_tag(TRANSFER_TAG, after)
  }

  pub async fn account_overview(&self, account_id: &AccountId) -> Result<AccountOverview> {
    self.directory.overview(account_id).await
  }

  /// Restart the sagas that were not finished when the journal was last written.
  pub async fn recover_transfers(&self) -> Result<Vec<TransferId>> {
    let mut recovered = Vec::new();
    for persistence_id in self.transfer_store.persistence_ids().await? {
      let transfer_id = match persistence_id.strip_prefix("transfer-") {
        Some(id) => TransferId::new(id),
        None => continue,
      };
      let state = self.transfer_state(&transfer_id).await?;
      if !state.is_finished() {
        info!(%transfer_id, status = ?state.status, "Resuming transfer");
        self.saga(transfer_id.clone());
        recovered.push(transfer_id);
      }
    }
    Ok(recovered)
  }

  async fn transfer_state(&self, transfer_id: &TransferId) -> Result<TransferState> {
    let (_, state) = Journal::recover(
      self.transfer_store.clone(),
      transfer_persistence_id(transfer_id),
      0,
      TransferState::new(transfer_id.clone()),
    )
    .await?;
    Ok(state)
  }

  fn saga(&self, transfer_id: TransferId) -> TransferHandle {
    let mut transfers = self.transfers.lock();
    transfers.retain(|_, handle| !handle.is_stopped());
    let directory: Arc<dyn Directory> = self.directory.clone();
    transfers
      .entry(transfer_id.clone())
      .or_insert_with(|| {
        spawn_transfer(
          transfer_id,
          self.transfer_store.clone(),
          directory,
          self.config.clone(),
        )
      })
      .clone()
  }
}

#[async_trait]
impl<A, T> LedgerService for Ledger<A, T>
where
  A: AccountStore,
  T: TransferStore,
{
  async fn open_account(&self, account_id: AccountId, name: String, balance: Money) -> Result<()> {
    Ledger::open_account(self, account_id, name, balance).await
  }

  async fn transfer(
    &self,
    transfer_id: TransferId,
    amount: Money,
    creditor: AccountId,
    debtor: AccountId,
  ) -> Result<TransferOutcome> {
    let mut notifications = self.execute_transfer(transfer_id.clone(), amount, creditor, debtor)?;

    let settled = tokio::time::timeout(self.config.settle_timeout, async {
      while let Some(notification) = notifications.recv().await {
        match notification {
          TransferNotification::Initiated { .. } => continue,
          TransferNotification::Completed { .. } => return Some(TransferOutcome::Completed),
          TransferNotification::Failed { reason, .. } => {
            return Some(TransferOutcome::Failed { reason })
          }
          TransferNotification::Rejected { reason, .. } => {
            return Some(TransferOutcome::Rejected { reason })
          }
        }
      }
      None
    })
    .await;

    match settled {
      Ok(Some(outcome)) => Ok(outcome),
      Ok(None) => {
        let status = self.transfer_status(&transfer_id).await?;
        warn!(%transfer_id, ?status, "Transfer saga went silent");
        Ok(TransferOutcome::Unsettled)
      }
      Err(_) => {
        let status = self.transfer_status(&transfer_id).await?;
        warn!(
          %transfer_id,
          ?status,
          timeout = ?self.config.settle_timeout,
          "Transfer not settled in time"
        );
        Ok(TransferOutcome::Unsettled)
      }
    }
  }

  async fn accounts_report(&self) -> Result<Vec<AccountReport>> {
    let account_ids = self.directory.account_ids().await?;
    let overviews = join_all(
      account_ids
        .iter()
        .map(|account_id| self.account_overview(account_id)),
    )
    .await;

    let mut report = Vec::with_capacity(account_ids.len());
    for (account_id, overview) in account_ids.into_iter().zip(overviews) {
      match overview {
        Ok(overview) => report.push(AccountReport::new(account_id, overview)),
        Err(err) => warn!(%account_id, %err, "Account left out of the report"),
      }
    }
    Ok(report)
  }
}
