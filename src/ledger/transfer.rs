use rust_decimal::Decimal;
use thiserror::Error;

use super::account::{AccountCommand, AccountOutcome, AccountReply};
use super::delivery::DeliveryLedger;
use super::types::{AccountId, DeliveryId, Money, TransferId};
use crate::store::{EventSourced, Tagged};

/// Tag shared by all the transfer events
pub const TRANSFER_TAG: &str = "transfer";

/// Reasons for a transfer saga to refuse an `ExecuteTransfer` command.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransferRejection {
  #[error("Debtor and creditor must be different accounts: {0}")]
  SelfTransfer(AccountId),

  #[error("Transfer amount must be positive: {0}")]
  NonPositiveAmount(Money),

  #[error("Transfer {0} was already executed")]
  AlreadyExecuted(TransferId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
  New,
  Initiated,
  AllocationPending,
  Settling,
  Completed,
  Failed,
}

impl TransferStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, TransferStatus::Completed | TransferStatus::Failed)
  }
}

/// What the debtor and the creditor agreed to move.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferTerms {
  pub debtor: AccountId,
  pub creditor: AccountId,
  pub amount: Money,
}

/// A delivery confirmed by the saga, together with what it confirmed.
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
  MoneyAllocated,
  MoneyAllocationFailed { reason: String },
  CreditSuccessful,
  DebitSuccessful,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
  TransferInitiated {
    transfer_id: TransferId,
    debtor: AccountId,
    creditor: AccountId,
    amount: Money,
  },
  MessageSent {
    delivery_id: DeliveryId,
    destination: AccountId,
    command: AccountCommand,
  },
  MessageConfirmed {
    delivery_id: DeliveryId,
    confirmation: Confirmation,
  },
  TransferCompleted {
    transfer_id: TransferId,
    debtor: AccountId,
    creditor: AccountId,
    amount: Money,
  },
  TransferFailed {
    transfer_id: TransferId,
    debtor: AccountId,
    creditor: AccountId,
    amount: Money,
    reason: String,
  },
}

impl TransferEvent {
  pub fn name(&self) -> &'static str {
    match self {
      TransferEvent::TransferInitiated { .. } => "TransferInitiated",
      TransferEvent::MessageSent { .. } => "MessageSent",
      TransferEvent::MessageConfirmed { .. } => "MessageConfirmed",
      TransferEvent::TransferCompleted { .. } => "TransferCompleted",
      TransferEvent::TransferFailed { .. } => "TransferFailed",
    }
  }
}

impl Tagged for TransferEvent {
  fn tags(&self) -> Vec<&'static str> {
    vec![TRANSFER_TAG, self.name()]
  }
}

/// Notifications received by whoever requested a transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferNotification {
  Initiated {
    transfer_id: TransferId,
    debtor: AccountId,
    creditor: AccountId,
    amount: Money,
  },
  Completed {
    transfer_id: TransferId,
    debtor: AccountId,
    creditor: AccountId,
    amount: Money,
  },
  Failed {
    transfer_id: TransferId,
    debtor: AccountId,
    creditor: AccountId,
    amount: Money,
    reason: String,
  },
  Rejected {
    transfer_id: TransferId,
    reason: String,
  },
}

impl TransferNotification {
  pub fn is_terminal(&self) -> bool {
    !matches!(self, TransferNotification::Initiated { .. })
  }

  /// The notification for the requester that a persisted event stands for, if any.
  pub fn from_event(event: &TransferEvent) -> Option<Self> {
    match event.clone() {
      TransferEvent::TransferInitiated {
        transfer_id,
        debtor,
        creditor,
        amount,
      } => Some(TransferNotification::Initiated {
        transfer_id,
        debtor,
        creditor,
        amount,
      }),
      TransferEvent::TransferCompleted {
        transfer_id,
        debtor,
        creditor,
        amount,
      } => Some(TransferNotification::Completed {
        transfer_id,
        debtor,
        creditor,
        amount,
      }),
      TransferEvent::TransferFailed {
        transfer_id,
        debtor,
        creditor,
        amount,
        reason,
      } => Some(TransferNotification::Failed {
        transfer_id,
        debtor,
        creditor,
        amount,
        reason,
      }),
      TransferEvent::MessageSent { .. } | TransferEvent::MessageConfirmed { .. } => None,
    }
  }
}

/// State of a transfer saga.
///
/// The credit and the debit settle on different accounts, so their confirmations can arrive in any order:
/// the saga completes once both flags are set.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferState {
  pub transfer_id: TransferId,
  pub terms: Option<TransferTerms>,
  pub status: TransferStatus,
  pub credit_confirmed: bool,
  pub debit_confirmed: bool,
  pub deliveries: DeliveryLedger<AccountCommand>,
}

impl TransferState {
  pub fn new(transfer_id: TransferId) -> Self {
    Self {
      transfer_id,
      terms: None,
      status: TransferStatus::New,
      credit_confirmed: false,
      debit_confirmed: false,
      deliveries: DeliveryLedger::new(),
    }
  }

  /// A saga with nothing left to do: terminal and with every delivery confirmed.
  pub fn is_finished(&self) -> bool {
    self.status.is_terminal() && self.deliveries.is_empty()
  }

  /// Validate an `ExecuteTransfer` command and return the events to persist.
  pub fn execute(
    &self,
    amount: Money,
    creditor: AccountId,
    debtor: AccountId,
  ) -> Result<Vec<TransferEvent>, TransferRejection> {
    if self.status != TransferStatus::New {
      return Err(TransferRejection::AlreadyExecuted(self.transfer_id.clone()));
    }
    if creditor == debtor {
      return Err(TransferRejection::SelfTransfer(debtor));
    }
    if amount <= Decimal::ZERO {
      return Err(TransferRejection::NonPositiveAmount(amount));
    }

    Ok(vec![
      TransferEvent::TransferInitiated {
        transfer_id: self.transfer_id.clone(),
        debtor: debtor.clone(),
        creditor: creditor.clone(),
        amount,
      },
      TransferEvent::MessageSent {
        delivery_id: self.deliveries.next_delivery_id(),
        destination: debtor,
        command: AccountCommand::AllocateMoney {
          transfer_id: self.transfer_id.clone(),
          creditor,
          amount,
        },
      },
    ])
  }

  /// Events to persist in response to an account reply.
  ///
  /// Replies for deliveries that are not pending anymore, or that do not answer
  /// the command that was delivered, are ignored.
  pub fn on_reply(&self, reply: &AccountReply) -> Vec<TransferEvent> {
    let (record, terms) = match (self.deliveries.unconfirmed(reply.delivery_id), &self.terms) {
      (Some(record), Some(terms)) => (record, terms),
      _ => return vec![],
    };
    let delivery_id = reply.delivery_id;

    match (&reply.outcome, command_kind(&record.payload), self.status) {
      (AccountOutcome::MoneyAllocated { .. }, CommandKind::Allocate, TransferStatus::AllocationPending) => {
        let next_delivery_id = self.deliveries.next_delivery_id();
        vec![
          TransferEvent::MessageConfirmed {
            delivery_id,
            confirmation: Confirmation::MoneyAllocated,
          },
          TransferEvent::MessageSent {
            delivery_id: next_delivery_id,
            destination: terms.creditor.clone(),
            command: AccountCommand::Credit {
              transfer_id: self.transfer_id.clone(),
              amount: terms.amount,
            },
          },
          TransferEvent::MessageSent {
            delivery_id: next_delivery_id + 1,
            destination: terms.debtor.clone(),
            command: AccountCommand::Debit {
              transfer_id: self.transfer_id.clone(),
            },
          },
        ]
      }
      (
        AccountOutcome::MoneyAllocationFailed { reason },
        CommandKind::Allocate,
        TransferStatus::AllocationPending,
      ) => vec![
        TransferEvent::MessageConfirmed {
          delivery_id,
          confirmation: Confirmation::MoneyAllocationFailed {
            reason: reason.clone(),
          },
        },
        TransferEvent::TransferFailed {
          transfer_id: self.transfer_id.clone(),
          debtor: terms.debtor.clone(),
          creditor: terms.creditor.clone(),
          amount: terms.amount,
          reason: reason.clone(),
        },
      ],
      (AccountOutcome::CreditSuccessful { .. }, CommandKind::Credit, TransferStatus::Settling) => {
        self.settle(delivery_id, Confirmation::CreditSuccessful, self.debit_confirmed, terms)
      }
      (AccountOutcome::DebitSuccessful { .. }, CommandKind::Debit, TransferStatus::Settling) => {
        self.settle(delivery_id, Confirmation::DebitSuccessful, self.credit_confirmed, terms)
      }
      _ => vec![],
    }
  }

  fn settle(
    &self,
    delivery_id: DeliveryId,
    confirmation: Confirmation,
    other_side_confirmed: bool,
    terms: &TransferTerms,
  ) -> Vec<TransferEvent> {
    let mut events = vec![TransferEvent::MessageConfirmed {
      delivery_id,
      confirmation,
    }];
    if other_side_confirmed {
      events.push(TransferEvent::TransferCompleted {
        transfer_id: self.transfer_id.clone(),
        debtor: terms.debtor.clone(),
        creditor: terms.creditor.clone(),
        amount: terms.amount,
      });
    }
    events
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CommandKind {
  Allocate,
  Credit,
  Debit,
}

fn command_kind(command: &AccountCommand) -> CommandKind {
  match command {
    AccountCommand::AllocateMoney { .. } => CommandKind::Allocate,
    AccountCommand::Credit { .. } => CommandKind::Credit,
    AccountCommand::Debit { .. } => CommandKind::Debit,
  }
}

impl EventSourced for TransferState {
  type Event = TransferEvent;
  type Snapshot = TransferState;

  fn apply(mut self, event: &TransferEvent) -> Self {
    match event {
      TransferEvent::TransferInitiated {
        debtor,
        creditor,
        amount,
        ..
      } => {
        self.terms = Some(TransferTerms {
          debtor: debtor.clone(),
          creditor: creditor.clone(),
          amount: *amount,
        });
        self.status = TransferStatus::Initiated;
      }
      TransferEvent::MessageSent {
        delivery_id,
        destination,
        command,
      } => {
        self
          .deliveries
          .record_sent(*delivery_id, destination.clone(), command.clone());
        if self.status == TransferStatus::Initiated {
          self.status = TransferStatus::AllocationPending;
        }
      }
      TransferEvent::MessageConfirmed {
        delivery_id,
        confirmation,
      } => {
        self.deliveries.record_confirmed(*delivery_id);
        match confirmation {
          Confirmation::MoneyAllocated => self.status = TransferStatus::Settling,
          Confirmation::MoneyAllocationFailed { .. } => {}
          Confirmation::CreditSuccessful => self.credit_confirmed = true,
          Confirmation::DebitSuccessful => self.debit_confirmed = true,
        }
      }
      TransferEvent::TransferCompleted { .. } => self.status = TransferStatus::Completed,
      TransferEvent::TransferFailed { .. } => self.status = TransferStatus::Failed,
    }
    self
  }

  fn snapshot(&self) -> Option<TransferState> {
    Some(self.clone())
  }

  fn restore(state: TransferState) -> Self {
    state
  }
}
