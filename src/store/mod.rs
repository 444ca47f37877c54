//! Event sourcing persistence.
//!
//! An [`EventStore`] keeps one append-only stream of events per aggregate instance (its persistence id),
//! plus the latest snapshot of that aggregate's state. Every event is also tagged so read-side consumers
//! can follow all the events of a kind, in persisted order, resuming from a durable offset.
//!
//! The [`Journal`] is what aggregates use on top of the store: it rebuilds their state on start
//! (snapshot + tail replay) and persists new events, taking a snapshot every fixed number of events.
//

mod journal;
mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio_stream::Stream;

pub use journal::{EventSourced, Journal};
pub use memory::InMemoryEventStore;

/// Position of an event inside its own stream, starting at 1.
pub type SequenceNr = u64;

/// Position of an event in the whole store, starting at 1. Used to resume tagged subscriptions.
pub type Offset = u64;

pub type Result<T> = core::result::Result<T, StoreError>;

/// Ordered stream of persisted events returned by a tagged query.
pub type EventStream<E> = Box<dyn Stream<Item = EventEnvelope<E>> + Unpin + Send>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
  #[error("Sequence conflict on {persistence_id}: expected {expected}, found {actual}")]
  SequenceConflict {
    persistence_id: String,
    expected: SequenceNr,
    actual: SequenceNr,
  },

  #[cfg(test)]
  #[error("Event store unavailable: {0}")]
  Unavailable(String),
}

/// Events declare the tags under which they can be queried.
pub trait Tagged {
  fn tags(&self) -> Vec<&'static str>;
}

/// A persisted event together with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope<E> {
  pub persistence_id: String,
  pub sequence_nr: SequenceNr,
  pub offset: Offset,
  pub event: E,
}

/// State of an aggregate after applying all the events up to `sequence_nr`.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<S> {
  pub sequence_nr: SequenceNr,
  pub state: S,
}

/// Interface implemented by event stores.
///
/// Every persistence id has exactly one writer, the aggregate instance that owns it.
/// The expected sequence number passed on append is only a safety net against a second writer.
#[async_trait]
pub trait EventStore: Send + Sync {
  type Event: Clone + Send + Sync + 'static;
  type Snapshot: Clone + Send + Sync + 'static;

  /// Append events right after `expected_sequence_nr` and return the new highest sequence number.
  async fn append(
    &self,
    persistence_id: &str,
    expected_sequence_nr: SequenceNr,
    events: &[Self::Event],
  ) -> Result<SequenceNr>;

  /// Events of a stream with a sequence number greater than `after`, in order.
  async fn replay(
    &self,
    persistence_id: &str,
    after: SequenceNr,
  ) -> Result<Vec<EventEnvelope<Self::Event>>>;

  async fn highest_sequence_nr(&self, persistence_id: &str) -> Result<SequenceNr>;

  /// Replace the snapshot of a stream
  async fn save_snapshot(
    &self,
    persistence_id: &str,
    snapshot: Snapshot<Self::Snapshot>,
  ) -> Result<()>;

  async fn load_snapshot(&self, persistence_id: &str) -> Result<Option<Snapshot<Self::Snapshot>>>;

  /// All the persistence ids with at least one event, sorted.
  async fn persistence_ids(&self) -> Result<Vec<String>>;

  /// All the events tagged with `tag` whose offset is greater than `after`, in persisted order.
  fn events_by_tag(&self, tag: &str, after: Offset) -> EventStream<Self::Event>;
}
