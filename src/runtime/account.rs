use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::LedgerConfig;
use crate::ledger::{
  Account, AccountCommand, AccountError, AccountId, AccountOverview, AccountReply, Decision, Delivery,
  Money,
};
use crate::store::{self, Journal};

use super::AccountStore;

pub fn account_persistence_id(account_id: &AccountId) -> String {
  format!("account-{}", account_id)
}

#[derive(Debug)]
pub enum AccountMessage {
  Create {
    name: String,
    balance: Money,
    reply: oneshot::Sender<Result<(), AccountError>>,
  },
  /// A command sent by a transfer saga. The reply goes to `reply_to` once the outcome is durable.
  Deliver {
    delivery: Delivery<AccountCommand>,
    reply_to: mpsc::UnboundedSender<AccountReply>,
  },
  GetOverview {
    reply: oneshot::Sender<AccountOverview>,
  },
}

/// The inbox of a running account instance.
#[derive(Debug, Clone)]
pub struct AccountHandle {
  sender: mpsc::UnboundedSender<AccountMessage>,
}

impl AccountHandle {
  /// Enqueue a message, returning false if the instance is gone.
  pub fn tell(&self, message: AccountMessage) -> bool {
    self.sender.send(message).is_ok()
  }
}

/// Start an account instance. It recovers its state from `store` before handling any message,
/// and runs until every handle is dropped.
pub fn spawn_account<S: AccountStore>(
  account_id: AccountId,
  store: Arc<S>,
  config: LedgerConfig,
) -> AccountHandle {
  let (sender, inbox) = mpsc::unbounded_channel();
  tokio::spawn(run(account_id, store, config, inbox));
  AccountHandle { sender }
}

async fn run<S: AccountStore>(
  account_id: AccountId,
  store: Arc<S>,
  config: LedgerConfig,
  mut inbox: mpsc::UnboundedReceiver<AccountMessage>,
) {
  let persistence_id = account_persistence_id(&account_id);
  loop {
    let recovered = Journal::recover(
      store.clone(),
      persistence_id.clone(),
      config.snapshot_interval,
      Account::new(account_id.clone()),
    )
    .await;

    let result = match recovered {
      Ok((journal, account)) => {
        debug!(%account_id, sequence_nr = journal.sequence_nr(), "Account recovered");
        process(journal, account, &mut inbox).await
      }
      Err(err) => Err(err),
    };

    match result {
      Ok(()) => {
        debug!(%account_id, "Account stopped");
        return;
      }
      Err(err) => {
        error!(%account_id, %err, "Account failed, recovering");
        tokio::time::sleep(config.restart_backoff).await;
      }
    }
  }
}

async fn process<S: AccountStore>(
  mut journal: Journal<S>,
  mut account: Account,
  inbox: &mut mpsc::UnboundedReceiver<AccountMessage>,
) -> store::Result<()> {
  while let Some(message) = inbox.recv().await {
    account = handle(&mut journal, account, message).await?;
  }
  Ok(())
}

async fn handle<S: AccountStore>(
  journal: &mut Journal<S>,
  account: Account,
  message: AccountMessage,
) -> store::Result<Account> {
  match message {
    AccountMessage::Create {
      name,
      balance,
      reply,
    } => match account.create(name, balance) {
      Ok(event) => {
        let account = journal.persist(account, vec![event]).await?;
        info!(account_id = %account.account_id(), %balance, "Account created");
        reply.send(Ok(())).ok();
        Ok(account)
      }
      Err(err) => {
        warn!(%err, "Account not created");
        reply.send(Err(err)).ok();
        Ok(account)
      }
    },

    AccountMessage::GetOverview { reply } => {
      match account.state() {
        Some(state) => {
          reply.send(state.overview()).ok();
        }
        None => error!(
          account_id = %account.account_id(),
          "Overview requested before the account was created"
        ),
      }
      Ok(account)
    }

    AccountMessage::Deliver { delivery, reply_to } => {
      let Delivery {
        delivery_id,
        payload: command,
      } = delivery;

      let decision = match account.state() {
        Some(state) => state.decide(delivery_id, &command),
        None => {
          error!(
            account_id = %account.account_id(),
            delivery_id,
            ?command,
            "Command delivered before the account was created"
          );
          return Ok(account);
        }
      };

      let (account, outcome) = match decision {
        Decision::Persist(event) => {
          let outcome = event.processed().map(|(_, processed)| processed.outcome);
          let name = event.name();
          let account = journal.persist(account, vec![event]).await?;
          if let Some(state) = account.state() {
            debug!(
              account_id = %state.account_id,
              delivery_id,
              event = name,
              overview = ?state.overview(),
              "Persisted"
            );
          }
          (account, outcome)
        }
        Decision::Reply(outcome) => {
          warn!(account_id = %account.account_id(), delivery_id, ?outcome, "Command refused");
          (account, Some(outcome))
        }
        Decision::Acknowledge(outcome) => {
          debug!(account_id = %account.account_id(), delivery_id, "Delivery already applied");
          (account, Some(outcome))
        }
        Decision::Ignore => {
          debug!(account_id = %account.account_id(), delivery_id, "Stale delivery ignored");
          (account, None)
        }
      };

      if let Some(outcome) = outcome {
        let reply = AccountReply {
          delivery_id,
          transfer_id: command.transfer_id().clone(),
          account_id: account.account_id().clone(),
          outcome,
        };
        if reply_to.send(reply).is_err() {
          debug!(delivery_id, "Nobody is waiting for the reply");
        }
      }
      Ok(account)
    }
  }
}
