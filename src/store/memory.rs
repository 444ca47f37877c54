use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
  EventEnvelope, EventStore, EventStream, Offset, Result, SequenceNr, Snapshot, StoreError, Tagged,
};

/// Implementation of the [`EventStore`] that keeps the journal and the snapshots in memory.
pub struct InMemoryEventStore<E, S> {
  inner: Mutex<Inner<E, S>>,
}

struct Inner<E, S> {
  /// All the events of all the streams, in persisted order. The offset of an event is its index + 1.
  journal: Vec<StoredEvent<E>>,
  /// Indices into the journal for every stream.
  streams: HashMap<String, Vec<usize>>,
  snapshots: HashMap<String, Snapshot<S>>,
}

struct StoredEvent<E> {
  envelope: EventEnvelope<E>,
  tags: Vec<&'static str>,
}

impl<E, S> InMemoryEventStore<E, S> {
  pub fn new() -> Self {
    Self {
      inner: Mutex::new(Inner {
        journal: Vec::new(),
        streams: HashMap::default(),
        snapshots: HashMap::default(),
      }),
    }
  }
}

impl<E, S> Default for InMemoryEventStore<E, S> {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl<E, S> EventStore for InMemoryEventStore<E, S>
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
    let mut inner = self.inner.lock();
    let Inner {
      journal, streams, ..
    } = &mut *inner;

    let stream = streams.entry(persistence_id.to_string()).or_default();
    let actual = stream.len() as SequenceNr;
    if actual != expected_sequence_nr {
      return Err(StoreError::SequenceConflict {
        persistence_id: persistence_id.to_string(),
        expected: expected_sequence_nr,
        actual,
      });
    }

    for event in events {
      let index = journal.len();
      journal.push(StoredEvent {
        envelope: EventEnvelope {
          persistence_id: persistence_id.to_string(),
          sequence_nr: stream.len() as SequenceNr + 1,
          offset: index as Offset + 1,
          event: event.clone(),
        },
        tags: event.tags(),
      });
      stream.push(index);
    }

    Ok(stream.len() as SequenceNr)
  }

  async fn replay(&self, persistence_id: &str, after: SequenceNr) -> Result<Vec<EventEnvelope<E>>> {
    let inner = self.inner.lock();
    let events: Vec<EventEnvelope<E>> = inner
      .streams
      .get(persistence_id)
      .map(|stream| {
        stream
          .iter()
          .skip(after as usize)
          .map(|index| inner.journal[*index].envelope.clone())
          .collect()
      })
      .unwrap_or_default();
    Ok(events)
  }

  async fn highest_sequence_nr(&self, persistence_id: &str) -> Result<SequenceNr> {
    let inner = self.inner.lock();
    Ok(
      inner
        .streams
        .get(persistence_id)
        .map(|stream| stream.len() as SequenceNr)
        .unwrap_or(0),
    )
  }

  async fn save_snapshot(&self, persistence_id: &str, snapshot: Snapshot<S>) -> Result<()> {
    self
      .inner
      .lock()
      .snapshots
      .insert(persistence_id.to_string(), snapshot);
    Ok(())
  }

  async fn load_snapshot(&self, persistence_id: &str) -> Result<Option<Snapshot<S>>> {
    Ok(self.inner.lock().snapshots.get(persistence_id).cloned())
  }

  async fn persistence_ids(&self) -> Result<Vec<String>> {
    let inner = self.inner.lock();
    let mut ids: Vec<String> = inner
      .streams
      .iter()
      .filter(|(_, stream)| !stream.is_empty())
      .map(|(id, _)| id.clone())
      .collect();
    ids.sort();
    Ok(ids)
  }

  fn events_by_tag(&self, tag: &str, after: Offset) -> EventStream<E> {
    let inner = self.inner.lock();
    let events: Vec<EventEnvelope<E>> = inner
      .journal
      .iter()
      .skip(after as usize)
      .filter(|stored| stored.tags.iter().any(|stored_tag| *stored_tag == tag))
      .map(|stored| stored.envelope.clone())
      .collect();
    Box::new(tokio_stream::iter(events))
  }
}
