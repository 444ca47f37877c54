use std::collections::HashMap;

use rust_decimal::Decimal;
use thiserror::Error;

use super::types::{AccountId, DeliveryId, Money, TransferId};
use crate::store::{EventSourced, Tagged};

/// Tag shared by all the account events
pub const ACCOUNT_TAG: &str = "account";

pub const NOT_ENOUGH_BALANCE: &str = "Not enough balance!";
pub const NON_POSITIVE_AMOUNT: &str = "Amount must be positive";
pub const NO_ALLOCATED_MONEY: &str = "No allocated money for such transfer";

pub type Result<T> = core::result::Result<T, AccountError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AccountError {
  #[error("Account already exists: {0}")]
  AlreadyExists(AccountId),

  #[error("Invalid negative balance for account {0}")]
  NegativeBalance(AccountId),
}

/// Money allocated for a transfer that has not been debited yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransfer {
  pub transfer_id: TransferId,
  pub amount: Money,
  pub creditor: AccountId,
}

/// Commands that a transfer saga delivers to an account.
#[derive(Debug, Clone, PartialEq)]
pub enum AccountCommand {
  AllocateMoney {
    transfer_id: TransferId,
    creditor: AccountId,
    amount: Money,
  },
  Credit {
    transfer_id: TransferId,
    amount: Money,
  },
  Debit {
    transfer_id: TransferId,
  },
}

impl AccountCommand {
  pub fn transfer_id(&self) -> &TransferId {
    match self {
      AccountCommand::AllocateMoney { transfer_id, .. }
      | AccountCommand::Credit { transfer_id, .. }
      | AccountCommand::Debit { transfer_id } => transfer_id,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccountEvent {
  Created {
    account_id: AccountId,
    name: String,
    balance: Money,
  },
  MoneyAllocated {
    delivery_id: DeliveryId,
    transfer_id: TransferId,
    debtor: AccountId,
    creditor: AccountId,
    amount: Money,
  },
  /// Only recorded so that a redelivered allocation gets the same answer.
  MoneyAllocationFailed {
    delivery_id: DeliveryId,
    transfer_id: TransferId,
    debtor: AccountId,
    reason: String,
  },
  CreditSuccessful {
    delivery_id: DeliveryId,
    transfer_id: TransferId,
    creditor: AccountId,
    amount: Money,
  },
  DebitSuccessful {
    delivery_id: DeliveryId,
    debtor: AccountId,
    pending_transfer: PendingTransfer,
  },
}

impl AccountEvent {
  pub fn name(&self) -> &'static str {
    match self {
      AccountEvent::Created { .. } => "Created",
      AccountEvent::MoneyAllocated { .. } => "MoneyAllocated",
      AccountEvent::MoneyAllocationFailed { .. } => "MoneyAllocationFailed",
      AccountEvent::CreditSuccessful { .. } => "CreditSuccessful",
      AccountEvent::DebitSuccessful { .. } => "DebitSuccessful",
    }
  }

  /// The delivered command this event settles, and the outcome to reply with.
  pub fn processed(&self) -> Option<(&TransferId, ProcessedDelivery)> {
    match self {
      AccountEvent::Created { .. } => None,
      AccountEvent::MoneyAllocated {
        delivery_id,
        transfer_id,
        amount,
        ..
      } => Some((
        transfer_id,
        ProcessedDelivery::new(*delivery_id, AccountOutcome::MoneyAllocated { amount: *amount }),
      )),
      AccountEvent::MoneyAllocationFailed {
        delivery_id,
        transfer_id,
        reason,
        ..
      } => Some((
        transfer_id,
        ProcessedDelivery::new(
          *delivery_id,
          AccountOutcome::MoneyAllocationFailed {
            reason: reason.clone(),
          },
        ),
      )),
      AccountEvent::CreditSuccessful {
        delivery_id,
        transfer_id,
        amount,
        ..
      } => Some((
        transfer_id,
        ProcessedDelivery::new(*delivery_id, AccountOutcome::CreditSuccessful { amount: *amount }),
      )),
      AccountEvent::DebitSuccessful {
        delivery_id,
        pending_transfer,
        ..
      } => Some((
        &pending_transfer.transfer_id,
        ProcessedDelivery::new(
          *delivery_id,
          AccountOutcome::DebitSuccessful {
            amount: pending_transfer.amount,
          },
        ),
      )),
    }
  }
}

impl Tagged for AccountEvent {
  fn tags(&self) -> Vec<&'static str> {
    vec![ACCOUNT_TAG, self.name()]
  }
}

/// What happened to a delivered command, as seen by the saga that sent it.
#[derive(Debug, Clone, PartialEq)]
pub enum AccountOutcome {
  MoneyAllocated { amount: Money },
  MoneyAllocationFailed { reason: String },
  CreditSuccessful { amount: Money },
  DebitSuccessful { amount: Money },
  DebitFailed { reason: String },
}

/// Reply to a delivered command. It carries back the delivery id so the sender can confirm it.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountReply {
  pub delivery_id: DeliveryId,
  pub transfer_id: TransferId,
  pub account_id: AccountId,
  pub outcome: AccountOutcome,
}

/// The last delivery applied for a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedDelivery {
  pub delivery_id: DeliveryId,
  pub outcome: AccountOutcome,
}

impl ProcessedDelivery {
  pub fn new(delivery_id: DeliveryId, outcome: AccountOutcome) -> Self {
    Self {
      delivery_id,
      outcome,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountOverview {
  pub balance: Money,
  pub allocated_balance: Money,
  pub pending_transfers: usize,
}

/// How an account answers a delivered command.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
  /// Persist the event, then reply with its outcome.
  Persist(AccountEvent),
  /// Reply without persisting anything.
  Reply(AccountOutcome),
  /// The delivery was already applied: reply again with the recorded outcome.
  Acknowledge(AccountOutcome),
  /// Older than the last delivery applied for the same transfer, its sender already moved on.
  Ignore,
}

/// State of a created account.
///
/// The `allocated_balance` is always covered by the `balance`,
/// and it is the sum of the amounts of the `pending_transfers`.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountState {
  pub account_id: AccountId,
  pub name: String,
  pub balance: Money,
  pub allocated_balance: Money,
  pub pending_transfers: Vec<PendingTransfer>,
  pub processed: HashMap<TransferId, ProcessedDelivery>,
}

impl AccountState {
  pub fn new(account_id: AccountId, name: String, balance: Money) -> Self {
    Self {
      account_id,
      name,
      balance,
      allocated_balance: Decimal::ZERO,
      pending_transfers: Vec::new(),
      processed: HashMap::default(),
    }
  }

  pub fn available_balance(&self) -> Money {
    self.balance - self.allocated_balance
  }

  pub fn overview(&self) -> AccountOverview {
    AccountOverview {
      balance: self.balance,
      allocated_balance: self.allocated_balance,
      pending_transfers: self.pending_transfers.len(),
    }
  }

  pub fn pending_transfer(&self, transfer_id: &TransferId) -> Option<&PendingTransfer> {
    self
      .pending_transfers
      .iter()
      .find(|pending| &pending.transfer_id == transfer_id)
  }

  pub fn decide(&self, delivery_id: DeliveryId, command: &AccountCommand) -> Decision {
    if let Some(processed) = self.processed.get(command.transfer_id()) {
      if delivery_id == processed.delivery_id {
        return Decision::Acknowledge(processed.outcome.clone());
      } else if delivery_id < processed.delivery_id {
        return Decision::Ignore;
      }
    }

    match command {
      AccountCommand::AllocateMoney {
        transfer_id,
        creditor,
        amount,
      } => {
        let rejection = if *amount <= Decimal::ZERO {
          Some(NON_POSITIVE_AMOUNT)
        } else if self.available_balance() < *amount {
          Some(NOT_ENOUGH_BALANCE)
        } else {
          None
        };

        match rejection {
          Some(reason) => Decision::Persist(AccountEvent::MoneyAllocationFailed {
            delivery_id,
            transfer_id: transfer_id.clone(),
            debtor: self.account_id.clone(),
            reason: reason.to_string(),
          }),
          None => Decision::Persist(AccountEvent::MoneyAllocated {
            delivery_id,
            transfer_id: transfer_id.clone(),
            debtor: self.account_id.clone(),
            creditor: creditor.clone(),
            amount: *amount,
          }),
        }
      }
      AccountCommand::Credit {
        transfer_id,
        amount,
      } => Decision::Persist(AccountEvent::CreditSuccessful {
        delivery_id,
        transfer_id: transfer_id.clone(),
        creditor: self.account_id.clone(),
        amount: *amount,
      }),
      AccountCommand::Debit { transfer_id } => match self.pending_transfer(transfer_id) {
        Some(pending_transfer) => Decision::Persist(AccountEvent::DebitSuccessful {
          delivery_id,
          debtor: self.account_id.clone(),
          pending_transfer: pending_transfer.clone(),
        }),
        None => Decision::Reply(AccountOutcome::DebitFailed {
          reason: NO_ALLOCATED_MONEY.to_string(),
        }),
      },
    }
  }

  fn apply(mut self, event: &AccountEvent) -> Self {
    match event {
      AccountEvent::Created { .. } => {}
      AccountEvent::MoneyAllocated {
        transfer_id,
        creditor,
        amount,
        ..
      } => {
        self.allocated_balance += *amount;
        self.pending_transfers.push(PendingTransfer {
          transfer_id: transfer_id.clone(),
          amount: *amount,
          creditor: creditor.clone(),
        });
      }
      AccountEvent::MoneyAllocationFailed { .. } => {}
      AccountEvent::CreditSuccessful { amount, .. } => {
        self.balance += *amount;
      }
      AccountEvent::DebitSuccessful {
        pending_transfer, ..
      } => {
        self
          .pending_transfers
          .retain(|pending| pending.transfer_id != pending_transfer.transfer_id);
        self.balance -= pending_transfer.amount;
        self.allocated_balance -= pending_transfer.amount;
      }
    }

    if let Some((transfer_id, processed)) = event.processed() {
      self.processed.insert(transfer_id.clone(), processed);
    }

    self
  }
}

/// The account aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum Account {
  Uninitialized(AccountId),
  Ready(AccountState),
}

impl Account {
  pub fn new(account_id: AccountId) -> Self {
    Account::Uninitialized(account_id)
  }

  pub fn account_id(&self) -> &AccountId {
    match self {
      Account::Uninitialized(account_id) => account_id,
      Account::Ready(state) => &state.account_id,
    }
  }

  pub fn state(&self) -> Option<&AccountState> {
    match self {
      Account::Uninitialized(_) => None,
      Account::Ready(state) => Some(state),
    }
  }

  /// Validate a `Create` command and return the event to persist.
  pub fn create(&self, name: String, balance: Money) -> Result<AccountEvent> {
    match self {
      Account::Ready(state) => Err(AccountError::AlreadyExists(state.account_id.clone())),
      Account::Uninitialized(account_id) if balance < Decimal::ZERO => {
        Err(AccountError::NegativeBalance(account_id.clone()))
      }
      Account::Uninitialized(account_id) => Ok(AccountEvent::Created {
        account_id: account_id.clone(),
        name,
        balance,
      }),
    }
  }
}

impl EventSourced for Account {
  type Event = AccountEvent;
  type Snapshot = AccountState;

  fn apply(self, event: &AccountEvent) -> Self {
    match (self, event) {
      (
        Account::Uninitialized(_),
        AccountEvent::Created {
          account_id,
          name,
          balance,
        },
      ) => Account::Ready(AccountState::new(
        account_id.clone(),
        name.clone(),
        *balance,
      )),
      (Account::Uninitialized(account_id), _) => Account::Uninitialized(account_id),
      (Account::Ready(state), event) => Account::Ready(state.apply(event)),
    }
  }

  fn snapshot(&self) -> Option<AccountState> {
    self.state().cloned()
  }

  fn restore(state: AccountState) -> Self {
    Account::Ready(state)
  }
}
