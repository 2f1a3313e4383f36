//! Read-journal facade.
//!
//! Every query is a lazy stream of [`EventEnvelope`]s. `current_*` queries
//! complete once the head of the stream is reached; their live counterparts
//! keep polling at `refresh_interval`. The `subscribe_*` queries are backed
//! by store-native catch-up subscriptions instead of polling.
//!
//! Tag, all-events and persistence-id queries read the link streams the
//! store's projections maintain, with links resolved; their offsets are
//! positions in the link stream.

use crate::client::EventStoreClient;
use crate::codec::{AdapterRegistry, EventAdapters, JournalKind, PersistentRepr, RecordAdapter};
use crate::config::Settings;
use crate::error::Result;
use crate::query::filter::{self, QueryFilter};
use crate::query::source::{self, SourceOptions};
use crate::query::EventEnvelope;
use crate::subscriptions::{
    catch_up, CatchUpMode, CatchUpOptions, PersistentSubscription, PersistentSubscriptionSettings,
    RestartSettings, SubscriptionManager,
};
use crate::types::{Offset, ReadFrom, StoredRecord};
use async_stream::try_stream;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;

/// Stream of envelopes returned by every event query.
pub type EnvelopeStream = BoxStream<'static, Result<EventEnvelope>>;

/// Stream of persistence ids.
pub type PersistenceIdStream = BoxStream<'static, Result<String>>;

/// Decodes records and runs them through the event adapters.
#[derive(Clone)]
struct Decoder {
    adapter: Arc<dyn RecordAdapter>,
    event_adapters: EventAdapters,
}

impl Decoder {
    fn decode(&self, record: &StoredRecord) -> Result<Option<PersistentRepr>> {
        self.adapter.from_record(record)
    }

    /// One envelope per adapted event, all carrying the record's offset.
    fn expand(&self, record: &StoredRecord, repr: PersistentRepr) -> Vec<EventEnvelope> {
        let offset = Offset::Sequence(record.resume_position().0);
        let PersistentRepr {
            payload,
            persistence_id,
            sequence_nr,
            manifest,
            timestamp,
            tags,
            ..
        } = repr;
        self.event_adapters
            .adapt(payload, &manifest)
            .into_iter()
            .map(|event| EventEnvelope {
                offset,
                persistence_id: persistence_id.clone(),
                sequence_nr,
                event,
                timestamp,
                tags: tags.clone(),
            })
            .collect()
    }
}

/// Query side of the journal.
#[derive(Clone)]
pub struct ReadJournal {
    client: Arc<dyn EventStoreClient>,
    settings: Settings,
    decoder: Decoder,
    subscriptions: SubscriptionManager,
}

impl ReadJournal {
    pub fn new(
        client: Arc<dyn EventStoreClient>,
        adapter: Arc<dyn RecordAdapter>,
        settings: Settings,
    ) -> Self {
        let subscriptions = SubscriptionManager::new(Arc::clone(&client), settings.max_in_flight);
        Self {
            client,
            settings,
            decoder: Decoder {
                adapter,
                event_adapters: EventAdapters::new(),
            },
            subscriptions,
        }
    }

    /// Read journal using the adapter named in `settings`.
    pub fn with_adapters(
        client: Arc<dyn EventStoreClient>,
        adapters: &AdapterRegistry,
        settings: Settings,
    ) -> Self {
        let adapter = adapters.resolve(&settings.adapter);
        Self::new(client, adapter, settings)
    }

    /// Run decoded payloads through `event_adapters` before handing them out.
    pub fn with_event_adapters(mut self, event_adapters: EventAdapters) -> Self {
        self.decoder.event_adapters = event_adapters;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Manager behind the `subscribe_*` queries.
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Events `[from_seq, to_seq]` of one entity, then live ones up to `to_seq`.
    pub fn events_by_persistence_id(
        &self,
        persistence_id: &str,
        from_seq: u64,
        to_seq: u64,
    ) -> EnvelopeStream {
        let refresh_interval = Some(self.settings.refresh_interval);
        self.by_persistence_id(persistence_id, from_seq, to_seq, refresh_interval)
    }

    /// Events `[from_seq, to_seq]` of one entity that exist now.
    pub fn current_events_by_persistence_id(
        &self,
        persistence_id: &str,
        from_seq: u64,
        to_seq: u64,
    ) -> EnvelopeStream {
        self.by_persistence_id(persistence_id, from_seq, to_seq, None)
    }

    /// Events carrying `tag`, after `offset`, then live ones.
    pub fn events_by_tag(&self, tag: &str, offset: Offset) -> EnvelopeStream {
        let refresh_interval = Some(self.settings.refresh_interval);
        self.by_link_stream(self.settings.tag_stream(tag), offset, refresh_interval)
    }

    /// Events carrying `tag` after `offset` that exist now.
    pub fn current_events_by_tag(&self, tag: &str, offset: Offset) -> EnvelopeStream {
        self.by_link_stream(self.settings.tag_stream(tag), offset, None)
    }

    /// Every journal event after `offset`, then live ones.
    pub fn all_events(&self, offset: Offset) -> EnvelopeStream {
        self.by_link_stream(
            self.settings.all_events_stream.clone(),
            offset,
            Some(self.settings.refresh_interval),
        )
    }

    /// Every journal event after `offset` that exists now.
    pub fn current_all_events(&self, offset: Offset) -> EnvelopeStream {
        self.by_link_stream(self.settings.all_events_stream.clone(), offset, None)
    }

    /// Ids of every entity that has written an event, then new ones.
    pub fn persistence_ids(&self) -> PersistenceIdStream {
        self.ids(Some(self.settings.refresh_interval))
    }

    /// Ids of every entity that has written an event so far.
    pub fn current_persistence_ids(&self) -> PersistenceIdStream {
        self.ids(None)
    }

    /// Join a consumer group on `stream`.
    pub fn persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        max_buffer_size: usize,
        restart: Option<RestartSettings>,
    ) -> PersistentSubscription {
        let mut settings =
            PersistentSubscriptionSettings::new(stream, group).max_buffer_size(max_buffer_size);
        settings.restart = restart;
        PersistentSubscription::start(Arc::clone(&self.client), settings)
    }

    /// Subscription-backed variant of [`events_by_persistence_id`](Self::events_by_persistence_id).
    pub fn subscribe_events_by_persistence_id(
        &self,
        persistence_id: &str,
        from_seq: u64,
        to_seq: u64,
        mode: CatchUpMode,
    ) -> EnvelopeStream {
        let filter = QueryFilter::forwards(from_seq, to_seq);
        if filter.is_empty() {
            return Box::pin(stream::empty());
        }
        // Resume strictly after the record preceding `from_seq`.
        let from = match filter.from {
            ReadFrom::Position(position) => position.prev(),
            ReadFrom::Start | ReadFrom::End => None,
        };
        let options = CatchUpOptions {
            stream: self.settings.stream_for(persistence_id),
            from,
            resolve_links: false,
            mode,
        };
        let decoder = self.decoder.clone();
        let batches = catch_up(self.subscriptions.clone(), options, move |record| {
            let repr = match decoder.decode(&record)? {
                Some(repr) => repr,
                None => return Ok(None),
            };
            let decision = filter.decide(repr.sequence_nr);
            let envelopes = if decision.includes() {
                decoder.expand(&record, repr)
            } else {
                Vec::new()
            };
            Ok(Some((envelopes, decision.stops())))
        });
        flatten(batches)
    }

    /// Subscription-backed variant of [`events_by_tag`](Self::events_by_tag).
    pub fn subscribe_events_by_tag(
        &self,
        tag: &str,
        offset: Offset,
        mode: CatchUpMode,
    ) -> EnvelopeStream {
        self.subscribe_link_stream(self.settings.tag_stream(tag), offset, mode)
    }

    /// Subscription-backed variant of [`all_events`](Self::all_events).
    pub fn subscribe_all_events(&self, offset: Offset, mode: CatchUpMode) -> EnvelopeStream {
        self.subscribe_link_stream(self.settings.all_events_stream.clone(), offset, mode)
    }

    fn source_options(
        &self,
        stream: String,
        from: ReadFrom,
        refresh_interval: Option<Duration>,
        resolve_links: bool,
    ) -> SourceOptions {
        SourceOptions::new(stream, from)
            .refresh_interval(refresh_interval)
            .first_run_grace(self.settings.first_run_grace)
            .resolve_links(resolve_links)
            .page_size(self.settings.page_size)
    }

    fn by_persistence_id(
        &self,
        persistence_id: &str,
        from_seq: u64,
        to_seq: u64,
        refresh_interval: Option<Duration>,
    ) -> EnvelopeStream {
        let filter = QueryFilter::forwards(from_seq, to_seq);
        if filter.is_empty() {
            return Box::pin(stream::empty());
        }
        let options = self.source_options(
            self.settings.stream_for(persistence_id),
            filter.from,
            refresh_interval,
            false,
        );
        let mut records = source::open(Arc::clone(&self.client), options);
        let decoder = self.decoder.clone();

        Box::pin(try_stream! {
            while let Some(record) = records.next().await {
                let record = record?;
                let repr = match decoder.decode(&record)? {
                    Some(repr) => repr,
                    None => continue,
                };
                let decision = filter.decide(repr.sequence_nr);
                if decision.includes() {
                    for envelope in decoder.expand(&record, repr) {
                        yield envelope;
                    }
                }
                if decision.stops() {
                    break;
                }
            }
        })
    }

    fn by_link_stream(
        &self,
        stream: String,
        offset: Offset,
        refresh_interval: Option<Duration>,
    ) -> EnvelopeStream {
        let filter = QueryFilter::after_offset(offset);
        let options = self.source_options(stream, filter.from, refresh_interval, true);
        let mut records = source::open(Arc::clone(&self.client), options);
        let decoder = self.decoder.clone();

        Box::pin(try_stream! {
            while let Some(record) = records.next().await {
                let record = record?;
                if let Some(repr) = decoder.decode(&record)? {
                    for envelope in decoder.expand(&record, repr) {
                        yield envelope;
                    }
                }
            }
        })
    }

    fn ids(&self, refresh_interval: Option<Duration>) -> PersistenceIdStream {
        let options = self.source_options(
            self.settings.persistence_ids_stream.clone(),
            ReadFrom::Start,
            refresh_interval,
            true,
        );
        let mut records = source::open(Arc::clone(&self.client), options);
        let adapter = Arc::clone(&self.decoder.adapter);

        Box::pin(try_stream! {
            while let Some(record) = records.next().await {
                let record = record?;
                match adapter.read_metadata(&record) {
                    Some(metadata) if metadata.journal == JournalKind::Event => {
                        yield metadata.persistence_id;
                    }
                    _ => continue,
                }
            }
        })
    }

    fn subscribe_link_stream(
        &self,
        stream: String,
        offset: Offset,
        mode: CatchUpMode,
    ) -> EnvelopeStream {
        let options = CatchUpOptions {
            stream,
            from: filter::subscription_start(offset),
            resolve_links: true,
            mode,
        };
        let decoder = self.decoder.clone();
        let batches = catch_up(self.subscriptions.clone(), options, move |record| {
            Ok(decoder
                .decode(&record)?
                .map(|repr| (decoder.expand(&record, repr), false)))
        });
        flatten(batches)
    }
}

/// Flatten per-record envelope batches, ending after a batch flagged as last.
fn flatten(
    mut batches: BoxStream<'static, Result<(Vec<EventEnvelope>, bool)>>,
) -> EnvelopeStream {
    Box::pin(try_stream! {
        while let Some(batch) = batches.next().await {
            let (envelopes, last) = batch?;
            for envelope in envelopes {
                yield envelope;
            }
            if last {
                break;
            }
        }
    })
}
