use std::sync::Arc;

use tracing::{debug, warn};

use super::{EventStore, Result, SequenceNr, Snapshot};

/// An aggregate whose state is derived solely from its events.
pub trait EventSourced: Sized {
  type Event;
  type Snapshot;

  /// Transition function: the state after applying `event`.
  fn apply(self, event: &Self::Event) -> Self;

  /// The state to store as a snapshot, if there is anything worth storing yet.
  fn snapshot(&self) -> Option<Self::Snapshot>;

  fn restore(snapshot: Self::Snapshot) -> Self;
}

/// Write access to the stream of one aggregate instance.
///
/// The journal remembers the sequence number of the last event it persisted,
/// so it is only valid for the aggregate value returned together with it by [`Journal::recover`].
pub struct Journal<S> {
  store: Arc<S>,
  persistence_id: String,
  sequence_nr: SequenceNr,
  snapshot_interval: u64,
}

impl<S> Journal<S>
where
  S: EventStore,
{
  /// Rebuild an aggregate from the latest snapshot (if any) and the events persisted after it.
  /// `initial` is the state of an aggregate that never persisted anything.
  pub async fn recover<A>(
    store: Arc<S>,
    persistence_id: String,
    snapshot_interval: u64,
    initial: A,
  ) -> Result<(Self, A)>
  where
    A: EventSourced<Event = S::Event, Snapshot = S::Snapshot>,
  {
    let (mut aggregate, from) = match store.load_snapshot(&persistence_id).await? {
      Some(snapshot) => (A::restore(snapshot.state), snapshot.sequence_nr),
      None => (initial, 0),
    };

    let events = store.replay(&persistence_id, from).await?;
    let replayed = events.len();
    let mut sequence_nr = from;
    for envelope in events {
      aggregate = aggregate.apply(&envelope.event);
      sequence_nr = envelope.sequence_nr;
    }

    debug!(
      %persistence_id,
      snapshot_sequence_nr = from,
      replayed,
      sequence_nr,
      "Recovered"
    );

    let journal = Self {
      store,
      persistence_id,
      sequence_nr,
      snapshot_interval,
    };
    Ok((journal, aggregate))
  }

  /// Durably append `events` and return the aggregate with them applied.
  /// If the append fails the aggregate is dropped: the caller must recover again before going on.
  pub async fn persist<A>(&mut self, aggregate: A, events: Vec<S::Event>) -> Result<A>
  where
    A: EventSourced<Event = S::Event, Snapshot = S::Snapshot>,
  {
    if events.is_empty() {
      return Ok(aggregate);
    }

    let previous = self.sequence_nr;
    self.sequence_nr = self
      .store
      .append(&self.persistence_id, previous, &events)
      .await?;

    let aggregate = events.iter().fold(aggregate, A::apply);

    if self.snapshot_due(previous) {
      if let Some(state) = aggregate.snapshot() {
        let snapshot = Snapshot {
          sequence_nr: self.sequence_nr,
          state,
        };
        match self.store.save_snapshot(&self.persistence_id, snapshot).await {
          Ok(()) => debug!(
            persistence_id = %self.persistence_id,
            sequence_nr = self.sequence_nr,
            "Snapshot saved"
          ),
          // snapshots only shorten recovery, the events are already safe
          Err(err) => warn!(
            persistence_id = %self.persistence_id,
            %err,
            "Failed to save snapshot"
          ),
        }
      }
    }

    Ok(aggregate)
  }

  pub fn sequence_nr(&self) -> SequenceNr {
    self.sequence_nr
  }

  fn snapshot_due(&self, previous: SequenceNr) -> bool {
    self.snapshot_interval > 0
      && self.sequence_nr / self.snapshot_interval > previous / self.snapshot_interval
  }
}
