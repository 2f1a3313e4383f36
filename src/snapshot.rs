//! Snapshot store.
//!
//! Snapshots live in a stream per entity (`snapshot_stream_prefix + id`),
//! encoded with journal kind `snapshot`. The store is append-only, so
//! deleting a snapshot truncates everything up to and including it.

use crate::client::EventStoreClient;
use crate::codec::{Payload, RecordAdapter};
use crate::config::Settings;
use crate::error::Result;
use crate::query::source::{self, SourceOptions};
use crate::types::{Direction, ExpectedRevision, ReadFrom, StreamPosition, Timestamp};
use futures::StreamExt;
use std::sync::Arc;
use tracing::debug;

/// Identity of one snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub persistence_id: String,
    pub sequence_nr: u64,
    pub timestamp: Timestamp,
}

impl SnapshotMetadata {
    /// Snapshot taken now at `sequence_nr`.
    pub fn new(persistence_id: impl Into<String>, sequence_nr: u64) -> Self {
        Self {
            persistence_id: persistence_id.into(),
            sequence_nr,
            timestamp: Timestamp::now(),
        }
    }
}

/// A loaded snapshot.
#[derive(Clone, Debug)]
pub struct SelectedSnapshot {
    pub metadata: SnapshotMetadata,
    pub snapshot: Payload,
}

/// Bounds a snapshot must fall within. All bounds are inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotSelectionCriteria {
    pub max_sequence_nr: u64,
    pub max_timestamp: Timestamp,
    pub min_sequence_nr: u64,
    pub min_timestamp: Timestamp,
}

impl SnapshotSelectionCriteria {
    /// Any snapshot; the newest one wins.
    pub fn latest() -> Self {
        Self {
            max_sequence_nr: u64::MAX,
            max_timestamp: Timestamp(i64::MAX),
            min_sequence_nr: 0,
            min_timestamp: Timestamp(i64::MIN),
        }
    }

    /// Matches nothing.
    pub fn none() -> Self {
        Self {
            max_sequence_nr: 0,
            max_timestamp: Timestamp(i64::MIN),
            min_sequence_nr: 0,
            min_timestamp: Timestamp(i64::MIN),
        }
    }

    /// Newest snapshot at or below `max_sequence_nr`.
    pub fn up_to(max_sequence_nr: u64) -> Self {
        Self {
            max_sequence_nr,
            ..Self::latest()
        }
    }

    /// Whether `metadata` lies within every bound.
    pub fn matches(&self, metadata: &SnapshotMetadata) -> bool {
        metadata.sequence_nr <= self.max_sequence_nr
            && metadata.sequence_nr >= self.min_sequence_nr
            && metadata.timestamp <= self.max_timestamp
            && metadata.timestamp >= self.min_timestamp
    }
}

impl Default for SnapshotSelectionCriteria {
    fn default() -> Self {
        Self::latest()
    }
}

/// Snapshot store over the shared store client.
#[derive(Clone)]
pub struct SnapshotStore {
    client: Arc<dyn EventStoreClient>,
    adapter: Arc<dyn RecordAdapter>,
    settings: Settings,
}

impl SnapshotStore {
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

    /// Append a snapshot to the entity's snapshot stream.
    pub async fn save(&self, metadata: &SnapshotMetadata, snapshot: &Payload) -> Result<()> {
        let stream = self.settings.snapshot_stream_for(&metadata.persistence_id);
        let data = self.adapter.to_snapshot_data(metadata, snapshot)?;
        let result = self
            .client
            .append_to_stream(&stream, ExpectedRevision::Any, vec![data])
            .await?;
        debug!(
            stream = %stream,
            sequence_nr = metadata.sequence_nr,
            position = result.next_expected.0,
            "snapshot saved"
        );
        Ok(())
    }

    /// Newest snapshot matching `criteria`.
    pub async fn load(
        &self,
        persistence_id: &str,
        criteria: SnapshotSelectionCriteria,
    ) -> Result<Option<SelectedSnapshot>> {
        Ok(self
            .find(persistence_id, &criteria)
            .await?
            .map(|(_, snapshot)| snapshot))
    }

    /// Delete the snapshot identified by `metadata` and every older one.
    pub async fn delete(&self, metadata: &SnapshotMetadata) -> Result<()> {
        let criteria = SnapshotSelectionCriteria {
            max_sequence_nr: metadata.sequence_nr,
            min_sequence_nr: metadata.sequence_nr,
            ..SnapshotSelectionCriteria::latest()
        };
        self.delete_matching(&metadata.persistence_id, criteria)
            .await
    }

    /// Delete the newest snapshot matching `criteria` and every older one.
    pub async fn delete_matching(
        &self,
        persistence_id: &str,
        criteria: SnapshotSelectionCriteria,
    ) -> Result<()> {
        let position = match self.find(persistence_id, &criteria).await? {
            Some((position, _)) => position,
            None => return Ok(()),
        };
        let stream = self.settings.snapshot_stream_for(persistence_id);
        let mut metadata = self.client.get_stream_metadata(&stream).await?;
        let truncate_before = position.next();
        if metadata.truncate_before.map_or(true, |tb| tb < truncate_before) {
            metadata.truncate_before = Some(truncate_before);
            self.client.set_stream_metadata(&stream, metadata).await?;
            debug!(stream = %stream, truncate_before = truncate_before.0, "snapshots deleted");
        }
        Ok(())
    }

    /// Scan the snapshot stream backwards for the first match.
    async fn find(
        &self,
        persistence_id: &str,
        criteria: &SnapshotSelectionCriteria,
    ) -> Result<Option<(StreamPosition, SelectedSnapshot)>> {
        let stream = self.settings.snapshot_stream_for(persistence_id);
        let options = SourceOptions::new(stream, ReadFrom::End)
            .direction(Direction::Backwards)
            .page_size(self.settings.page_size);
        let mut records = source::open(Arc::clone(&self.client), options);

        while let Some(record) = records.next().await {
            let record = record?;
            if let Some(snapshot) = self.adapter.from_snapshot_record(&record)? {
                if criteria.matches(&snapshot.metadata) {
                    return Ok(Some((record.position, snapshot)));
                }
            }
        }
        Ok(None)
    }
}
