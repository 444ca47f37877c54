use std::convert::TryFrom;

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::ledger::AccountId;
use crate::processors;

/// The types of operations supported by the reader
#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
  Open,
  Transfer,
}

/// A deserializable operation.
///
/// The meaning of `reference` depends on the type: the holder name for `open`, the creditor for `transfer`.
#[derive(Debug, Deserialize)]
pub struct Operation {
  #[serde(rename = "type")]
  kind: OperationType,

  account: String,

  reference: String,

  amount: Decimal,
}

impl TryFrom<Operation> for processors::Operation {
  type Error = anyhow::Error;

  /// Conversion from a deserializable Operation into one that can be used by the processors.
  fn try_from(operation: Operation) -> Result<Self> {
    if operation.account.is_empty() {
      bail!("Missing account");
    }
    match operation.kind {
      OperationType::Open => {
        let name = if operation.reference.is_empty() {
          operation.account.clone()
        } else {
          operation.reference
        };
        Ok(processors::Operation::Open {
          account_id: AccountId::new(operation.account),
          name,
          balance: operation.amount,
        })
      }
      OperationType::Transfer => {
        if operation.reference.is_empty() {
          bail!("Missing creditor for a transfer from {}", operation.account);
        }
        Ok(processors::Operation::Transfer {
          debtor: AccountId::new(operation.account),
          creditor: AccountId::new(operation.reference),
          amount: operation.amount,
        })
      }
    }
  }
}

#[cfg(test)]
mod tests {

  use rust_decimal_macros::dec;

  use super::*;

  fn operation(kind: OperationType, account: &str, reference: &str, amount: Decimal) -> Operation {
    Operation {
      kind,
      account: account.to_string(),
      reference: reference.to_string(),
      amount,
    }
  }

  #[test]
  fn processors_operation_try_from() {
    let cases = vec![
      (
        operation(OperationType::Open, "A", "Alice", dec!(10)),
        processors::Operation::Open {
          account_id: AccountId::new("A"),
          name: "Alice".to_string(),
          balance: dec!(10),
        },
      ),
      (
        operation(OperationType::Open, "B", "", dec!(0)),
        processors::Operation::Open {
          account_id: AccountId::new("B"),
          name: "B".to_string(),
          balance: dec!(0),
        },
      ),
      (
        operation(OperationType::Transfer, "A", "B", dec!(2.5)),
        processors::Operation::Transfer {
          debtor: AccountId::new("A"),
          creditor: AccountId::new("B"),
          amount: dec!(2.5),
        },
      ),
    ];

    for (input, expected) in cases {
      assert_eq!(processors::Operation::try_from(input).unwrap(), expected)
    }
  }

  #[test]
  fn processors_operation_try_from_fails() {
    let cases = vec![
      operation(OperationType::Open, "", "Alice", dec!(10)),
      operation(OperationType::Transfer, "A", "", dec!(1)),
    ];

    for input in cases {
      assert!(processors::Operation::try_from(input).is_err())
    }
  }
}
