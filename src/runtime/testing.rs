use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::LedgerConfig;
use crate::store::{
  EventEnvelope, EventStore, EventStream, InMemoryEventStore, Offset, Result, SequenceNr, Snapshot,
  StoreError, Tagged,
};

/// Settings with short timers so that tests run fast.
pub fn test_config() -> LedgerConfig {
  LedgerConfig {
    snapshot_interval: 100,
    redelivery_interval: Duration::from_millis(20),
    restart_backoff: Duration::from_millis(5),
    settle_timeout: Duration::from_secs(2),
  }
}

/// An in-memory store whose next appends fail.
pub struct FlakyStore<E, S> {
  inner: InMemoryEventStore<E, S>,
  failures: AtomicUsize,
}

impl<E, S> FlakyStore<E, S> {
  pub fn failing(appends: usize) -> Self {
    Self {
      inner: InMemoryEventStore::new(),
      failures: AtomicUsize::new(appends),
    }
  }

  pub fn fail_next_appends(&self, appends: usize) {
    self.failures.store(appends, Ordering::SeqCst);
  }

  fn should_fail(&self) -> bool {
    self
      .failures
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |failures| {
        failures.checked_sub(1)
      })
      .is_ok()
  }
}

#[async_trait]
impl<E, S> EventStore for FlakyStore<E, S>
where
  E: Tagged + Clone + Send + Sync + 'static,
  S: Clone + Send + Sync + 'static,
{
  type Event = E;
  type Snapshot = S;

  async fn append(
    &self,
    persistence_id: &str,
    expected_sequence_nr: SequenceNr,
    events: &[E],
  ) -> Result<SequenceNr> {
    if self.should_fail() {
      return Err(StoreError::Unavailable("injected failure".to_string()));
    }
    self
      .inner
      .append(persistence_id, expected_sequence_nr, events)
      .await
  }

  async fn replay(&self, persistence_id: &str, after: SequenceNr) -> Result<Vec<EventEnvelope<E>>> {
    self.inner.replay(persistence_id, after).await
  }

  async fn highest_sequence_nr(&self, persistence_id: &str) -> Result<SequenceNr> {
    self.inner.highest_sequence_nr(persistence_id).await
  }

  async fn save_snapshot(&self, persistence_id: &str, snapshot: Snapshot<S>) -> Result<()> {
    self.inner.save_snapshot(persistence_id, snapshot).await
  }

  async fn load_snapshot(&self, persistence_id: &str) -> Result<Option<Snapshot<S>>> {
    self.inner.load_snapshot(persistence_id).await
  }

  async fn persistence_ids(&self) -> Result<Vec<String>> {
    self.inner.persistence_ids().await
  }

  fn events_by_tag(&self, tag: &str, after: Offset) -> EventStream<E> {
    self.inner.events_by_tag(tag, after)
  }
}
