//! Flat settings shared by the journal, snapshot store and read journal.

use serde::Deserialize;
use std::time::Duration;

/// Plugin settings.
///
/// Loading is up to the host; every field has a default so partial
/// documents deserialize.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Prefix prepended to a persistence id to form its event stream.
    pub stream_prefix: String,

    /// Prefix prepended to a persistence id to form its snapshot stream.
    pub snapshot_stream_prefix: String,

    /// Prefix of the store-maintained tag projection streams.
    pub tagged_stream_prefix: String,

    /// Projection stream linking every persisted event.
    pub all_events_stream: String,

    /// Projection stream linking the first event of every persistence id.
    pub persistence_ids_stream: String,

    /// Records requested per page read.
    pub page_size: usize,

    /// Poll interval of live (non-current) queries.
    #[serde(with = "millis")]
    pub refresh_interval: Duration,

    /// One-off wait when the first page of a current query comes back empty.
    #[serde(with = "millis_opt")]
    pub first_run_grace: Option<Duration>,

    /// Batch size hint for store-native catch-up subscriptions.
    pub max_in_flight: usize,

    /// Name of the record adapter; unknown names fall back to "default".
    pub adapter: String,

    /// Identifier of the default body serializer.
    pub serializer: String,

    /// Identifier of the metadata serializer.
    pub metadata_serializer: String,

    /// Identity of this writer, stored in every event's metadata.
    pub writer_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stream_prefix: String::new(),
            snapshot_stream_prefix: "snapshot@".to_string(),
            tagged_stream_prefix: "tagged-".to_string(),
            all_events_stream: "persistedevents".to_string(),
            persistence_ids_stream: "persistenceids".to_string(),
            page_size: 500,
            refresh_interval: Duration::from_secs(5),
            first_run_grace: Some(Duration::from_millis(100)),
            max_in_flight: 64,
            adapter: "default".to_string(),
            serializer: "json".to_string(),
            metadata_serializer: "json".to_string(),
            writer_id: "default-writer".to_string(),
        }
    }
}

impl Settings {
    /// Event stream of a persistence id.
    pub fn stream_for(&self, persistence_id: &str) -> String {
        format!("{}{}", self.stream_prefix, persistence_id)
    }

    /// Snapshot stream of a persistence id.
    pub fn snapshot_stream_for(&self, persistence_id: &str) -> String {
        format!("{}{}", self.snapshot_stream_prefix, persistence_id)
    }

    /// Tag projection stream.
    pub fn tag_stream(&self, tag: &str) -> String {
        format!("{}{}", self.tagged_stream_prefix, tag)
    }

    /// Whether a stream name belongs to the event journal (and not to a
    /// snapshot stream or a projection).
    ///
    /// A snapshot prefix equal to the stream prefix means snapshots share
    /// the event streams, so it does not exclude anything.
    pub fn is_journal_stream(&self, stream: &str) -> bool {
        let separate_snapshots = !self.snapshot_stream_prefix.is_empty()
            && self.snapshot_stream_prefix != self.stream_prefix;
        stream.starts_with(&self.stream_prefix)
            && !(separate_snapshots && stream.starts_with(&self.snapshot_stream_prefix))
            && !stream.starts_with(&self.tagged_stream_prefix)
            && stream != self.all_events_stream
            && stream != self.persistence_ids_stream
            && !stream.starts_with('$')
    }

    /// Copy with a different refresh interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod millis_opt {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis))
    }
}
