//! This module runs the aggregates of the [`ledger`](crate::ledger) module.
//!
//! Every aggregate instance is a tokio task that owns its state and drains its own inbox one message at a time,
//! so an instance never processes two commands concurrently and different instances never share state.
//! Each instance persists through its [`Journal`](crate::store::Journal) before replying,
//! and when persisting fails it throws its state away and recovers it again from the store.
//!
//! Aggregates never hold handles to each other: sagas reach accounts by id through a [`Directory`].
//

mod account;
mod directory;
mod service;
mod transfer;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

use crate::ledger::{
  AccountError, AccountEvent, AccountId, AccountState, TransferEvent, TransferId, TransferState,
};
use crate::store::{EventStore, InMemoryEventStore, StoreError};

pub use account::{account_persistence_id, spawn_account, AccountHandle, AccountMessage};
pub use directory::{AccountDirectory, Directory};
pub use service::{AccountReport, Ledger, LedgerService, TransferOutcome};
pub use transfer::{spawn_transfer, transfer_persistence_id, TransferHandle};

pub type Result<T> = core::result::Result<T, LedgerError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
  #[error(transparent)]
  Account(#[from] AccountError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("Account unavailable: {0}")]
  AccountUnavailable(AccountId),

  #[error("Transfer unavailable: {0}")]
  TransferUnavailable(TransferId),
}

/// Event stores holding account streams
pub trait AccountStore: EventStore<Event = AccountEvent, Snapshot = AccountState> + 'static {}

impl<S> AccountStore for S where S: EventStore<Event = AccountEvent, Snapshot = AccountState> + 'static {}

/// Event stores holding transfer saga streams
pub trait TransferStore: EventStore<Event = TransferEvent, Snapshot = TransferState> + 'static {}

impl<S> TransferStore for S where S: EventStore<Event = TransferEvent, Snapshot = TransferState> + 'static {}

pub type InMemoryAccountStore = InMemoryEventStore<AccountEvent, AccountState>;

pub type InMemoryTransferStore = InMemoryEventStore<TransferEvent, TransferState>;
