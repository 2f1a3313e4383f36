//! Record adapters: persistent representation ⇄ stored record.

use super::metadata::{EventMetadata, JournalKind};
use super::payload::{PathResolver, Payload, PersistentRepr, SenderResolver, Tagged};
use super::registry::TypeRegistry;
use super::serializer::{Serializer, SerializerRegistry};
use crate::config::Settings;
use crate::error::Result;
use crate::snapshot::{SelectedSnapshot, SnapshotMetadata};
use crate::types::{EventData, StoredRecord, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the built-in adapter.
pub const DEFAULT_ADAPTER: &str = "default";

/// Converts journal and snapshot values to and from stored records.
pub trait RecordAdapter: Send + Sync {
    fn to_event_data(&self, repr: &PersistentRepr) -> Result<EventData>;

    /// `Ok(None)` for records that are not events of a known type.
    fn from_record(&self, record: &StoredRecord) -> Result<Option<PersistentRepr>>;

    fn to_snapshot_data(&self, metadata: &SnapshotMetadata, snapshot: &Payload)
        -> Result<EventData>;

    /// `Ok(None)` for records that are not snapshots of a known type.
    fn from_snapshot_record(&self, record: &StoredRecord) -> Result<Option<SelectedSnapshot>>;

    /// Metadata only, without decoding the body.
    fn read_metadata(&self, record: &StoredRecord) -> Option<EventMetadata>;
}

/// The default adapter: registry-resolved bodies, serialized metadata.
#[derive(Clone)]
pub struct EnvelopeCodec {
    types: Arc<TypeRegistry>,
    serializers: SerializerRegistry,
    metadata_serializer: Arc<dyn Serializer>,
    senders: Arc<dyn SenderResolver>,
    writer_id: String,
}

impl EnvelopeCodec {
    /// Codec over `types`, with serializers and writer id taken from `settings`.
    pub fn new(types: Arc<TypeRegistry>, settings: &Settings) -> Self {
        let serializers = SerializerRegistry::with_default(&settings.serializer);
        let metadata_serializer = serializers.resolve(&settings.metadata_serializer);
        Self {
            types,
            serializers,
            metadata_serializer,
            senders: Arc::new(PathResolver),
            writer_id: settings.writer_id.clone(),
        }
    }

    /// Resolve stored sender paths through `senders` instead of keeping them as plain paths.
    pub fn with_sender_resolver(mut self, senders: Arc<dyn SenderResolver>) -> Self {
        self.senders = senders;
        self
    }

    /// Add a serializer that registered types can be bound to.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializers.register(serializer);
        self
    }

    /// Registry manifests are resolved against.
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    fn encode(
        &self,
        payload: &Payload,
        build: impl FnOnce(String, String) -> EventMetadata,
    ) -> Result<EventData> {
        let entry = self.types.for_payload(payload)?;
        let serializer = match entry.serializer() {
            Some(id) => self.serializers.resolve(id),
            None => self.serializers.default_serializer(),
        };
        let data = serializer.to_binary(&entry.to_value(payload)?)?;
        let metadata = build(
            entry.manifest().to_string(),
            serializer.identifier().to_string(),
        );
        Ok(EventData {
            event_type: entry.type_tag().to_string(),
            data,
            metadata: metadata.to_bytes(self.metadata_serializer.as_ref())?,
        })
    }

    fn decode(
        &self,
        record: &StoredRecord,
        expected: JournalKind,
    ) -> Result<Option<(EventMetadata, Payload)>> {
        let metadata = match self.read_metadata(record) {
            Some(metadata) => metadata,
            None => return Ok(None),
        };
        if metadata.journal != expected {
            debug!(
                stream = %record.stream,
                position = record.position.0,
                kind = ?metadata.journal,
                "skipping record of another journal kind"
            );
            return Ok(None);
        }
        let entry = match self.types.by_manifest(&metadata.manifest) {
            Some(entry) => entry,
            None => {
                debug!(
                    stream = %record.stream,
                    manifest = %metadata.manifest,
                    "skipping record with unknown manifest"
                );
                return Ok(None);
            }
        };
        let serializer = self.serializers.resolve(&metadata.serializer);
        let payload = entry.from_value(serializer.from_binary(&record.data)?)?;
        Ok(Some((metadata, payload)))
    }
}

impl RecordAdapter for EnvelopeCodec {
    fn to_event_data(&self, repr: &PersistentRepr) -> Result<EventData> {
        let (payload, tags) = match repr.payload.downcast_ref::<Tagged>() {
            Some(tagged) => {
                let mut tags = repr.tags.clone();
                tags.extend(tagged.tags.iter().cloned());
                (tagged.payload.clone(), tags)
            }
            None => (repr.payload.clone(), repr.tags.clone()),
        };
        let writer_id = if repr.writer_id.is_empty() {
            self.writer_id.clone()
        } else {
            repr.writer_id.clone()
        };

        self.encode(&payload, |manifest, serializer| EventMetadata {
            persistence_id: repr.persistence_id.clone(),
            manifest,
            sequence_nr: repr.sequence_nr,
            writer_id,
            sender: repr.sender.as_ref().map(|s| s.path().to_string()),
            timestamp: repr.timestamp.0,
            journal: JournalKind::Event,
            tags: tags.into_iter().collect(),
            serializer,
        })
    }

    fn from_record(&self, record: &StoredRecord) -> Result<Option<PersistentRepr>> {
        let (metadata, payload) = match self.decode(record, JournalKind::Event)? {
            Some(decoded) => decoded,
            None => return Ok(None),
        };
        let sender = metadata
            .sender
            .as_deref()
            .and_then(|path| self.senders.resolve(path));

        Ok(Some(PersistentRepr {
            payload,
            persistence_id: metadata.persistence_id,
            sequence_nr: metadata.sequence_nr,
            manifest: metadata.manifest,
            writer_id: metadata.writer_id,
            sender,
            timestamp: Timestamp(metadata.timestamp),
            tags: metadata.tags.into_iter().collect(),
        }))
    }

    fn to_snapshot_data(
        &self,
        metadata: &SnapshotMetadata,
        snapshot: &Payload,
    ) -> Result<EventData> {
        self.encode(snapshot, |manifest, serializer| EventMetadata {
            persistence_id: metadata.persistence_id.clone(),
            manifest,
            sequence_nr: metadata.sequence_nr,
            writer_id: self.writer_id.clone(),
            sender: None,
            timestamp: metadata.timestamp.0,
            journal: JournalKind::Snapshot,
            tags: Vec::new(),
            serializer,
        })
    }

    fn from_snapshot_record(&self, record: &StoredRecord) -> Result<Option<SelectedSnapshot>> {
        Ok(self
            .decode(record, JournalKind::Snapshot)?
            .map(|(metadata, snapshot)| SelectedSnapshot {
                metadata: SnapshotMetadata {
                    persistence_id: metadata.persistence_id,
                    sequence_nr: metadata.sequence_nr,
                    timestamp: Timestamp(metadata.timestamp),
                },
                snapshot,
            }))
    }

    fn read_metadata(&self, record: &StoredRecord) -> Option<EventMetadata> {
        match EventMetadata::from_bytes(&record.metadata, self.metadata_serializer.as_ref()) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                debug!(
                    stream = %record.stream,
                    position = record.position.0,
                    error = %e,
                    "skipping record without journal metadata"
                );
                None
            }
        }
    }
}

/// Named record adapters with an explicit default.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn RecordAdapter>>,
    default: Arc<dyn RecordAdapter>,
}

impl AdapterRegistry {
    /// Registry holding `default` under [`DEFAULT_ADAPTER`].
    pub fn new(default: Arc<dyn RecordAdapter>) -> Self {
        let mut adapters = HashMap::new();
        adapters.insert(DEFAULT_ADAPTER.to_string(), Arc::clone(&default));
        Self { adapters, default }
    }

    /// Register `adapter` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, adapter: Arc<dyn RecordAdapter>) {
        self.adapters.insert(name.into(), adapter);
    }

    /// Adapter configured under `name`, or the default.
    pub fn resolve(&self, name: &str) -> Arc<dyn RecordAdapter> {
        match self.adapters.get(name) {
            Some(adapter) => Arc::clone(adapter),
            None => {
                warn!(adapter = name, "record adapter not found, using default");
                Arc::clone(&self.default)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::payload::{ActorRegistry, SenderRef};
    use crate::types::StreamPosition;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Line {
        sku: String,
        qty: u32,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
        lines: Vec<Line>,
    }

    fn codec() -> EnvelopeCodec {
        let mut types = TypeRegistry::new();
        types.register::<String>();
        types.register_as::<OrderPlaced>("shop.OrderPlaced");
        EnvelopeCodec::new(Arc::new(types), &Settings::default())
    }

    fn stored(data: EventData) -> StoredRecord {
        StoredRecord {
            stream: "order-1".into(),
            position: StreamPosition(0),
            event_type: data.event_type,
            data: data.data,
            metadata: data.metadata,
            created: Timestamp::now(),
            link: None,
        }
    }

    fn order() -> OrderPlaced {
        OrderPlaced {
            order_id: "o-1".into(),
            lines: vec![
                Line {
                    sku: "a".into(),
                    qty: 1,
                },
                Line {
                    sku: "b".into(),
                    qty: 3,
                },
            ],
        }
    }

    #[test]
    fn test_string_payload_roundtrip() {
        let codec = codec();
        let repr = PersistentRepr::new(Payload::new("hello".to_string()), "order-1", 1);
        let data = codec.to_event_data(&repr).unwrap();
        assert_eq!(data.event_type, "string");

        let back = codec.from_record(&stored(data)).unwrap().unwrap();
        assert_eq!(back.payload.downcast_ref::<String>().unwrap(), "hello");
        assert_eq!(back.persistence_id, "order-1");
        assert_eq!(back.sequence_nr, 1);
        assert!(back.tags.is_empty());
        assert!(back.sender.is_none());
    }

    #[test]
    fn test_nested_payload_with_tags_roundtrip() {
        let codec = codec();
        let payload = Payload::tagged(Payload::new(order()), ["blue", "green"]);
        let repr = PersistentRepr::new(payload, "order-1", 7);
        let data = codec.to_event_data(&repr).unwrap();
        assert_eq!(data.event_type, "orderPlaced");

        let back = codec.from_record(&stored(data)).unwrap().unwrap();
        assert_eq!(back.payload.downcast_ref::<OrderPlaced>(), Some(&order()));
        assert_eq!(back.manifest, "shop.OrderPlaced");
        assert_eq!(back.sequence_nr, 7);
        let expected: BTreeSet<String> = ["blue", "green"].iter().map(|s| s.to_string()).collect();
        assert_eq!(back.tags, expected);
    }

    #[test]
    fn test_sender_roundtrip_through_registry() {
        let actors = Arc::new(ActorRegistry::new());
        let sender = actors.register("/user/checkout");
        let codec = codec().with_sender_resolver(actors.clone());

        let repr = PersistentRepr::new(Payload::new("x".to_string()), "order-1", 2)
            .with_sender(sender.clone());
        let record = stored(codec.to_event_data(&repr).unwrap());

        let back = codec.from_record(&record).unwrap().unwrap();
        assert_eq!(back.sender, Some(sender));

        actors.unregister("/user/checkout");
        let back = codec.from_record(&record).unwrap().unwrap();
        assert_eq!(back.sender, None::<SenderRef>);
    }

    #[test]
    fn test_unknown_manifest_is_skipped() {
        let codec = codec();
        let repr = PersistentRepr::new(Payload::new(order()), "order-1", 1);
        let record = stored(codec.to_event_data(&repr).unwrap());

        let empty = EnvelopeCodec::new(Arc::new(TypeRegistry::new()), &Settings::default());
        assert!(empty.from_record(&record).unwrap().is_none());
    }

    #[test]
    fn test_cross_kind_isolation() {
        let codec = codec();
        let metadata = SnapshotMetadata {
            persistence_id: "order-1".into(),
            sequence_nr: 4,
            timestamp: Timestamp::now(),
        };
        let snapshot = stored(
            codec
                .to_snapshot_data(&metadata, &Payload::new(order()))
                .unwrap(),
        );
        assert!(codec.from_record(&snapshot).unwrap().is_none());
        assert!(codec.from_snapshot_record(&snapshot).unwrap().is_some());

        let event = stored(
            codec
                .to_event_data(&PersistentRepr::new(Payload::new(order()), "order-1", 1))
                .unwrap(),
        );
        assert!(codec.from_snapshot_record(&event).unwrap().is_none());
    }

    #[test]
    fn test_bound_serializer_is_recorded() {
        let mut types = TypeRegistry::new();
        types.register_with_serializer::<OrderPlaced>("shop.OrderPlaced", "msgpack");
        let codec = EnvelopeCodec::new(Arc::new(types), &Settings::default());

        let data = codec
            .to_event_data(&PersistentRepr::new(Payload::new(order()), "order-1", 1))
            .unwrap();
        let metadata = codec.read_metadata(&stored(data.clone())).unwrap();
        assert_eq!(metadata.serializer, "msgpack");
        assert!(serde_json::from_slice::<serde_json::Value>(&data.data).is_err());

        let back = codec.from_record(&stored(data)).unwrap().unwrap();
        assert_eq!(back.payload.downcast_ref::<OrderPlaced>(), Some(&order()));
    }

    #[test]
    fn test_unregistered_payload_fails_write() {
        let codec = codec();
        let repr = PersistentRepr::new(Payload::new(5u64), "order-1", 1);
        assert!(codec.to_event_data(&repr).is_err());
    }

    #[test]
    fn test_unknown_adapter_falls_back() {
        let default: Arc<dyn RecordAdapter> = Arc::new(codec());
        let registry = AdapterRegistry::new(Arc::clone(&default));
        let resolved = registry.resolve("com.example.MissingAdapter");
        assert!(Arc::ptr_eq(&resolved, &default));
    }
}
