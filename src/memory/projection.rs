//! Server-side projection emulation.

use crate::codec::{EventMetadata, JournalKind, Serializer, SerializerRegistry};
use crate::config::Settings;
use crate::types::StoredRecord;
use std::sync::Arc;

/// Decides which link streams an appended record is linked into.
///
/// Every event written to a journal stream is linked into the all-events
/// stream and into one stream per tag. The first event of a journal stream
/// is also linked into the persistence-ids stream.
#[derive(Clone)]
pub struct Projection {
    settings: Settings,
    metadata_serializer: Arc<dyn Serializer>,
}

impl Projection {
    pub fn new(settings: &Settings) -> Self {
        let metadata_serializer =
            SerializerRegistry::default().resolve(&settings.metadata_serializer);
        Self {
            settings: settings.clone(),
            metadata_serializer,
        }
    }

    /// Link streams `record`, just appended to `stream`, belongs in.
    pub fn link_targets(&self, stream: &str, record: &StoredRecord) -> Vec<String> {
        if !self.settings.is_journal_stream(stream) {
            return Vec::new();
        }
        let serializer = self.metadata_serializer.as_ref();
        let metadata = match EventMetadata::from_bytes(&record.metadata, serializer) {
            Ok(metadata) if metadata.journal == JournalKind::Event => metadata,
            _ => return Vec::new(),
        };

        let mut targets = vec![self.settings.all_events_stream.clone()];
        if record.position.0 == 0 {
            targets.push(self.settings.persistence_ids_stream.clone());
        }
        targets.extend(metadata.tags.iter().map(|tag| self.settings.tag_stream(tag)));
        targets
    }
}
