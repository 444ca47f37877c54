//! This module contains the domain logic of money transfers between accounts.
//!
//! There are two kinds of aggregates, both event sourced and both free of any IO:
//! - the [`Account`], guarding the balance and the money allocated for pending transfers,
//! - the [`TransferState`] of a transfer saga, moving money from a debtor to a creditor in two steps:
//!   allocation on the debtor, then credit and debit in parallel.
//!
//! The saga talks to the accounts through an at-least-once delivery ledger,
//! and the accounts make redelivered commands harmless by remembering the last delivery applied per transfer.
//

mod account;
mod delivery;
mod transfer;
mod types;

pub use account::{
  Account, AccountCommand, AccountError, AccountEvent, AccountOutcome, AccountOverview,
  AccountReply, AccountState, Decision,
};
pub use delivery::Delivery;
pub use transfer::{
  TransferEvent, TransferNotification, TransferRejection, TransferState, TransferStatus,
  TRANSFER_TAG,
};
pub use types::{AccountId, DeliveryId, Money, TransferId};

#[cfg(test)]
pub(crate) use account::NOT_ENOUGH_BALANCE;
#[cfg(test)]
pub(crate) use transfer::Confirmation;
