use rust_decimal::Decimal;
use serde::Serialize;

use crate::runtime;

const MAX_PRECISION: u32 = 4;

/// A row of the accounts report as serialized into CSV
#[derive(Debug, PartialEq, Serialize)]
pub struct AccountRecord {
  account: String,
  balance: Decimal,
  allocated: Decimal,
  pending: usize,
}

impl From<runtime::AccountReport> for AccountRecord {
  /// A conversion between the domain representation of an account report into a serializable structure
  fn from(account_report: runtime::AccountReport) -> Self {
    AccountRecord {
      account: account_report.account_id.to_string(),
      balance: with_max_precission(account_report.balance),
      allocated: with_max_precission(account_report.allocated_balance),
      pending: account_report.pending_transfers,
    }
  }
}

fn with_max_precission(mut value: Decimal) -> Decimal {
  if value.scale() > MAX_PRECISION {
    value.rescale(MAX_PRECISION);
  }
  if value.is_zero() {
    value = Decimal::ZERO;
  }
  value
}

#[cfg(test)]
mod tests {

  use super::*;
  use crate::ledger::AccountId;
  use rust_decimal_macros::dec;

  #[test]
  fn from_runtime_account_report() {
    let runtime_account_report = runtime::AccountReport {
      account_id: AccountId::new("A"),
      balance: dec!(100.12345),
      allocated_balance: dec!(10.012345),
      pending_transfers: 2,
    };

    let account_record: AccountRecord = runtime_account_report.into();

    assert_eq!(
      account_record,
      AccountRecord {
        account: "A".to_string(),
        balance: dec!(100.1235),
        allocated: dec!(10.0123),
        pending: 2,
      }
    )
  }

  #[test]
  fn with_max_precission_rescales() {
    let cases = vec![
      (dec!(0.00), "0"),
      (dec!(-0.00004), "0"),
      (dec!(0.00005), "0.0001"),
      (dec!(1.23456789), "1.2346"),
      (dec!(5.50), "5.50"),
    ];

    for (input, expected) in cases {
      assert_eq!(format!("{}", with_max_precission(input)).as_str(), expected);
    }
  }
}
