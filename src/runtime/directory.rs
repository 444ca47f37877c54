use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::LedgerConfig;
use crate::ledger::{AccountId, AccountOverview, Money};
use crate::store;

use super::{
  account_persistence_id, spawn_account, AccountHandle, AccountMessage, AccountStore, LedgerError,
  Result,
};

/// Routes messages to account instances by account id.
#[async_trait]
pub trait Directory: Send + Sync {
  /// Send a message to an account. Messages for accounts that were never created are dropped.
  async fn forward(&self, account_id: &AccountId, message: AccountMessage);
}

/// Keeps at most one live instance per account, started on demand.
pub struct AccountDirectory<S> {
  store: Arc<S>,
  config: LedgerConfig,
  accounts: Mutex<HashMap<AccountId, AccountHandle>>,
}

impl<S: AccountStore> AccountDirectory<S> {
  pub fn new(store: Arc<S>, config: LedgerConfig) -> Self {
    Self {
      store,
      config,
      accounts: Mutex::new(HashMap::new()),
    }
  }

  pub async fn create(&self, account_id: AccountId, name: String, balance: Money) -> Result<()> {
    let handle = self.spawn_or_get(&account_id);
    let (reply, response) = oneshot::channel();
    if !handle.tell(AccountMessage::Create {
      name,
      balance,
      reply,
    }) {
      return Err(LedgerError::AccountUnavailable(account_id));
    }
    response
      .await
      .map_err(|_| LedgerError::AccountUnavailable(account_id))?
      .map_err(LedgerError::from)
  }

  pub async fn overview(&self, account_id: &AccountId) -> Result<AccountOverview> {
    let (reply, response) = oneshot::channel();
    self
      .forward(account_id, AccountMessage::GetOverview { reply })
      .await;
    response
      .await
      .map_err(|_| LedgerError::AccountUnavailable(account_id.clone()))
  }

  /// Ids of every account with a stream in the store, sorted.
  pub async fn account_ids(&self) -> Result<Vec<AccountId>> {
    let persistence_ids = self.store.persistence_ids().await?;
    Ok(
      persistence_ids
        .iter()
        .filter_map(|persistence_id| persistence_id.strip_prefix("account-"))
        .map(AccountId::new)
        .collect(),
    )
  }

  async fn locate(&self, account_id: &AccountId) -> store::Result<Option<AccountHandle>> {
    let live = self.accounts.lock().get(account_id).cloned();
    if live.is_some() {
      return Ok(live);
    }

    let persistence_id = account_persistence_id(account_id);
    if self.store.highest_sequence_nr(&persistence_id).await? == 0 {
      return Ok(None);
    }
    Ok(Some(self.spawn_or_get(account_id)))
  }

  fn spawn_or_get(&self, account_id: &AccountId) -> AccountHandle {
    let mut accounts = self.accounts.lock();
    accounts
      .entry(account_id.clone())
      .or_insert_with(|| {
        debug!(%account_id, "Starting account");
        spawn_account(account_id.clone(), self.store.clone(), self.config.clone())
      })
      .clone()
  }
}

#[async_trait]
impl<S: AccountStore> Directory for AccountDirectory<S> {
  async fn forward(&self, account_id: &AccountId, message: AccountMessage) {
    match self.locate(account_id).await {
      Ok(Some(handle)) => {
        if !handle.tell(message) {
          warn!(%account_id, "Account instance is gone, message dropped");
        }
      }
      Ok(None) => debug!(%account_id, "Unknown account, message dropped"),
      Err(err) => warn!(%account_id, %err, "Failed to locate account, message dropped"),
    }
  }
}

#[cfg(test)]
mod tests {

  use rust_decimal_macros::dec;
  use tokio::sync::mpsc;

  use crate::ledger::{AccountCommand, AccountError, Delivery, TransferId};
  use crate::runtime::testing::test_config;
  use crate::runtime::InMemoryAccountStore;

  use super::*;

  fn directory() -> AccountDirectory<InMemoryAccountStore> {
    AccountDirectory::new(Arc::new(InMemoryAccountStore::new()), test_config())
  }

  #[tokio::test]
  async fn create_and_overview() {
    let directory = directory();
    let account_id = AccountId::new("A");

    directory
      .create(account_id.clone(), "Alice".to_string(), dec!(15))
      .await
      .unwrap();

    assert_eq!(
      directory.overview(&account_id).await,
      Ok(AccountOverview {
        balance: dec!(15),
        allocated_balance: dec!(0),
        pending_transfers: 0,
      })
    );
  }

  #[tokio::test]
  async fn create_rejected() {
    let directory = directory();
    let account_id = AccountId::new("A");

    let result = directory
      .create(account_id.clone(), "Alice".to_string(), dec!(-1))
      .await;

    assert_eq!(
      result,
      Err(LedgerError::Account(AccountError::NegativeBalance(account_id)))
    );
  }

  #[tokio::test]
  async fn unknown_account() {
    let directory = directory();
    let account_id = AccountId::new("Nobody");

    let (reply_to, mut replies) = mpsc::unbounded_channel();
    directory
      .forward(
        &account_id,
        AccountMessage::Deliver {
          delivery: Delivery {
            delivery_id: 1,
            payload: AccountCommand::Debit {
              transfer_id: TransferId::new("T1"),
            },
          },
          reply_to,
        },
      )
      .await;

    assert!(replies.recv().await.is_none());
    assert_eq!(
      directory.overview(&account_id).await,
      Err(LedgerError::AccountUnavailable(account_id))
    );
    assert!(directory.accounts.lock().is_empty());
  }

  #[tokio::test]
  async fn starts_accounts_found_in_the_store() {
    let store = Arc::new(InMemoryAccountStore::new());
    let account_id = AccountId::new("A");

    let previous = AccountDirectory::new(store.clone(), test_config());
    previous
      .create(account_id.clone(), "Alice".to_string(), dec!(7))
      .await
      .unwrap();
    drop(previous);

    let directory = AccountDirectory::new(store, test_config());
    assert_eq!(directory.overview(&account_id).await.unwrap().balance, dec!(7));
  }

  #[tokio::test]
  async fn account_ids_from_the_store() {
    let directory = directory();
    for id in &["C", "A", "B"] {
      directory
        .create(AccountId::new(*id), id.to_string(), dec!(1))
        .await
        .unwrap();
    }

    assert_eq!(
      directory.account_ids().await,
      Ok(vec![AccountId::new("A"), AccountId::new("B"), AccountId::new("C")])
    );
  }
}
