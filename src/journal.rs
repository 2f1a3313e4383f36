//! Write-side journal: atomic writes, replay, highest sequence number and
//! logical deletion.

use crate::client::EventStoreClient;
use crate::codec::{AdapterRegistry, JournalKind, PersistentRepr, RecordAdapter};
use crate::config::Settings;
use crate::error::{JournalError, Result};
use crate::query::source::{self, SourceOptions};
use crate::query::QueryFilter;
use crate::types::{Direction, ExpectedRevision, ReadFrom, StreamPosition};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// Events of one entity written in a single append.
#[derive(Clone, Debug)]
pub struct AtomicWrite {
    pub persistence_id: String,
    pub payload: Vec<PersistentRepr>,
}

impl AtomicWrite {
    pub fn new(persistence_id: impl Into<String>, payload: Vec<PersistentRepr>) -> Self {
        Self {
            persistence_id: persistence_id.into(),
            payload,
        }
    }

    /// Sequence number of the first event, `None` for an empty write.
    pub fn lowest_sequence_nr(&self) -> Option<u64> {
        self.payload.first().map(|repr| repr.sequence_nr)
    }

    /// Sequence number of the last event.
    pub fn highest_sequence_nr(&self) -> Option<u64> {
        self.payload.last().map(|repr| repr.sequence_nr)
    }
}

/// Expected revision for a write whose first sequence number is `first`.
fn expected_revision(first: u64) -> ExpectedRevision {
    if first <= 1 {
        ExpectedRevision::NoStream
    } else {
        ExpectedRevision::Exact(StreamPosition(first - 2))
    }
}

/// Event journal over the shared store client.
#[derive(Clone)]
pub struct Journal {
    client: Arc<dyn EventStoreClient>,
    adapter: Arc<dyn RecordAdapter>,
    settings: Settings,
}

impl Journal {
    pub fn new(
        client: Arc<dyn EventStoreClient>,
        adapter: Arc<dyn RecordAdapter>,
        settings: Settings,
    ) -> Self {
        Self {
            client,
            adapter,
            settings,
        }
    }

    /// Journal using the adapter named in `settings`.
    pub fn with_adapters(
        client: Arc<dyn EventStoreClient>,
        adapters: &AdapterRegistry,
        settings: Settings,
    ) -> Self {
        let adapter = adapters.resolve(&settings.adapter);
        Self::new(client, adapter, settings)
    }

    /// Write each atomic write as one append.
    ///
    /// The outer error is a store fault; the inner results report per-write
    /// rejections (concurrency conflicts, serialization failures) in input
    /// order.
    pub async fn write_messages(&self, writes: Vec<AtomicWrite>) -> Result<Vec<Result<()>>> {
        let results: Vec<Result<()>> = stream::iter(writes)
            .map(|write| self.write_one(write))
            .buffered(self.settings.max_in_flight.max(1))
            .collect()
            .await;

        let mut outcome = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Err(JournalError::Store(reason)) => return Err(JournalError::Store(reason)),
                other => outcome.push(other),
            }
        }
        Ok(outcome)
    }

    async fn write_one(&self, write: AtomicWrite) -> Result<()> {
        let first = match write.lowest_sequence_nr() {
            Some(first) => first,
            None => return Ok(()),
        };
        let stream = self.settings.stream_for(&write.persistence_id);
        let events = write
            .payload
            .iter()
            .map(|repr| self.adapter.to_event_data(repr))
            .collect::<Result<Vec<_>>>()?;

        match self
            .client
            .append_to_stream(&stream, expected_revision(first), events)
            .await
        {
            Ok(result) => {
                debug!(
                    stream = %stream,
                    first,
                    count = write.payload.len(),
                    position = result.next_expected.0,
                    "events written"
                );
                Ok(())
            }
            Err(e) => {
                warn!(stream = %stream, first, error = %e, "write rejected");
                Err(e)
            }
        }
    }

    /// Replay events `[from_seq, to_seq]` of `persistence_id`, at most `max`,
    /// in sequence order. Returns how many were replayed.
    pub async fn replay_messages<F>(
        &self,
        persistence_id: &str,
        from_seq: u64,
        to_seq: u64,
        max: u64,
        mut callback: F,
    ) -> Result<u64>
    where
        F: FnMut(PersistentRepr),
    {
        let filter = QueryFilter::forwards(from_seq, to_seq);
        if max == 0 || filter.is_empty() {
            return Ok(0);
        }

        let page_size = usize::try_from(max)
            .unwrap_or(usize::MAX)
            .min(self.settings.page_size);
        let options = SourceOptions::new(self.settings.stream_for(persistence_id), filter.from)
            .page_size(page_size);
        let mut records = source::open(Arc::clone(&self.client), options);

        let mut replayed = 0;
        while let Some(record) = records.next().await {
            let record = record?;
            let repr = match self.adapter.from_record(&record)? {
                Some(repr) => repr,
                None => continue,
            };
            let decision = filter.decide(repr.sequence_nr);
            if decision.includes() {
                callback(repr);
                replayed += 1;
                if replayed >= max {
                    break;
                }
            }
            if decision.stops() {
                break;
            }
        }
        Ok(replayed)
    }

    /// Highest sequence number written for `persistence_id`, never below
    /// `from_seq`.
    pub async fn read_highest_sequence_nr(
        &self,
        persistence_id: &str,
        from_seq: u64,
    ) -> Result<u64> {
        let stream = self.settings.stream_for(persistence_id);
        let options = SourceOptions::new(stream.clone(), ReadFrom::End)
            .direction(Direction::Backwards)
            .page_size(self.settings.page_size);
        let mut records = source::open(Arc::clone(&self.client), options);

        while let Some(record) = records.next().await {
            let record = record?;
            if let Some(metadata) = self.adapter.read_metadata(&record) {
                if metadata.journal == JournalKind::Event {
                    return Ok(metadata.sequence_nr.max(from_seq));
                }
            }
        }

        // Everything deleted: the truncation point still remembers how far
        // the stream got.
        let metadata = self.client.get_stream_metadata(&stream).await?;
        let deleted_to = metadata.truncate_before.map_or(0, |tb| tb.0);
        Ok(deleted_to.max(from_seq))
    }

    /// Logically delete events up to and including `to_seq`.
    pub async fn delete_messages_to(&self, persistence_id: &str, to_seq: u64) -> Result<()> {
        let highest = self.read_highest_sequence_nr(persistence_id, 0).await?;
        let to_seq = to_seq.min(highest);
        if to_seq == 0 {
            return Ok(());
        }

        let stream = self.settings.stream_for(persistence_id);
        let mut metadata = self.client.get_stream_metadata(&stream).await?;
        let truncate_before = StreamPosition(to_seq);
        if metadata.truncate_before.map_or(true, |tb| tb < truncate_before) {
            metadata.truncate_before = Some(truncate_before);
            self.client.set_stream_metadata(&stream, metadata).await?;
            debug!(stream = %stream, to_seq, "events deleted");
        }
        Ok(())
    }
}
