//! Processors drive a [`LedgerService`](crate::runtime::LedgerService) with operations read from some source.
//

pub mod simple;

use crate::ledger::{AccountId, Money};

/// An operation requested to the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
  Open {
    account_id: AccountId,
    name: String,
    balance: Money,
  },
  Transfer {
    debtor: AccountId,
    creditor: AccountId,
    amount: Money,
  },
}
