use std::collections::BTreeMap;

use super::types::{AccountId, DeliveryId};

/// A payload as it travels to its destination, tagged with the id used to confirm it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<P> {
  pub delivery_id: DeliveryId,
  pub payload: P,
}

/// A sent payload that was not confirmed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord<P> {
  pub delivery_id: DeliveryId,
  pub destination: AccountId,
  pub payload: P,
  /// Dispatch attempts since this record was loaded in memory. It is not persisted.
  pub attempts: u32,
}

impl<P: Clone> DeliveryRecord<P> {
  pub fn delivery(&self) -> Delivery<P> {
    Delivery {
      delivery_id: self.delivery_id,
      payload: self.payload.clone(),
    }
  }
}

/// Book-keeping of the at-least-once delivery of payloads to accounts.
///
/// The ledger is fed from the events of its owner: a sent event inserts a record
/// and a confirmation removes it. Whatever remains is eligible for redelivery.
/// Delivery ids start at 1 and are never reused, not even across recoveries,
/// because the highest id sent is derived from the same events.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryLedger<P> {
  next_delivery_id: DeliveryId,
  unconfirmed: BTreeMap<DeliveryId, DeliveryRecord<P>>,
}

impl<P> DeliveryLedger<P> {
  pub fn new() -> Self {
    Self {
      next_delivery_id: 1,
      unconfirmed: BTreeMap::new(),
    }
  }

  /// The id that the next sent payload must use.
  pub fn next_delivery_id(&self) -> DeliveryId {
    self.next_delivery_id
  }

  pub fn record_sent(&mut self, delivery_id: DeliveryId, destination: AccountId, payload: P) {
    self.next_delivery_id = self.next_delivery_id.max(delivery_id + 1);
    self.unconfirmed.insert(
      delivery_id,
      DeliveryRecord {
        delivery_id,
        destination,
        payload,
        attempts: 0,
      },
    );
  }

  /// Remove the record, returning it if it was still unconfirmed.
  pub fn record_confirmed(&mut self, delivery_id: DeliveryId) -> Option<DeliveryRecord<P>> {
    self.unconfirmed.remove(&delivery_id)
  }

  pub fn unconfirmed(&self, delivery_id: DeliveryId) -> Option<&DeliveryRecord<P>> {
    self.unconfirmed.get(&delivery_id)
  }

  pub fn is_empty(&self) -> bool {
    self.unconfirmed.is_empty()
  }

  pub fn len(&self) -> usize {
    self.unconfirmed.len()
  }

  /// Mark every unconfirmed record as dispatched once more and return them, oldest first.
  pub fn redeliveries(&mut self) -> impl Iterator<Item = &DeliveryRecord<P>> + '_ {
    self.unconfirmed.values_mut().map(|record| {
      record.attempts = record.attempts.saturating_add(1);
      &*record
    })
  }

  /// Mark a single record as dispatched.
  pub fn attempted(&mut self, delivery_id: DeliveryId) {
    if let Some(record) = self.unconfirmed.get_mut(&delivery_id) {
      record.attempts = record.attempts.saturating_add(1);
    }
  }
}

impl<P> Default for DeliveryLedger<P> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {

  use super::*;

  fn destination() -> AccountId {
    AccountId::new("Account-1")
  }

  #[test]
  fn delivery_ids_increase_monotonically() {
    let mut ledger = DeliveryLedger::new();
    assert_eq!(ledger.next_delivery_id(), 1);

    ledger.record_sent(1, destination(), "allocate");
    ledger.record_sent(2, destination(), "credit");
    ledger.record_confirmed(2);

    assert_eq!(ledger.next_delivery_id(), 3);
    assert_eq!(ledger.len(), 1);
  }

  #[test]
  fn confirmation_removes_record_once() {
    let mut ledger = DeliveryLedger::new();
    ledger.record_sent(1, destination(), "allocate");

    let confirmed = ledger.record_confirmed(1);

    assert_eq!(
      confirmed,
      Some(DeliveryRecord {
        delivery_id: 1,
        destination: destination(),
        payload: "allocate",
        attempts: 0,
      })
    );
    assert_eq!(ledger.record_confirmed(1), None);
    assert!(ledger.is_empty());
  }

  #[test]
  fn redeliveries_count_attempts() {
    let mut ledger = DeliveryLedger::new();
    ledger.record_sent(1, destination(), "allocate");
    ledger.attempted(1);
    ledger.record_sent(2, destination(), "debit");

    let first: Vec<(DeliveryId, u32)> = ledger
      .redeliveries()
      .map(|record| (record.delivery_id, record.attempts))
      .collect();
    assert_eq!(first, vec![(1, 2), (2, 1)]);

    ledger.record_confirmed(1);
    let second: Vec<Delivery<&str>> = ledger.redeliveries().map(|record| record.delivery()).collect();
    assert_eq!(
      second,
      vec![Delivery {
        delivery_id: 2,
        payload: "debit"
      }]
    );
    assert_eq!(ledger.unconfirmed(2).map(|record| record.attempts), Some(2));
  }

  #[test]
  fn attempts_saturate() {
    let mut ledger = DeliveryLedger::new();
    ledger.record_sent(1, destination(), "credit");
    if let Some(record) = ledger.unconfirmed.get_mut(&1) {
      record.attempts = u32::MAX - 1;
    }

    ledger.attempted(1);
    let attempts: Vec<u32> = ledger.redeliveries().map(|record| record.attempts).collect();

    assert_eq!(attempts, vec![u32::MAX]);
  }
}
