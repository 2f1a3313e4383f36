//! Stream source: a lazy, paged view over one physical stream.
//!
//! Finite when no refresh interval is given; otherwise it keeps polling the
//! head of the stream. Dropping the stream cancels the in-flight read or the
//! poll sleep.

use crate::client::{EventStoreClient, ReadRequest};
use crate::error::Result;
use crate::types::{Direction, ReadFrom, ReadResult, StoredRecord, StreamPosition};
use async_stream::try_stream;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Stream of raw records.
pub type RecordStream = BoxStream<'static, Result<StoredRecord>>;

/// Options of one open call.
#[derive(Clone, Debug)]
pub struct SourceOptions {
    pub stream: String,
    pub from: ReadFrom,
    pub direction: Direction,
    /// Poll interval once the head is reached; `None` completes instead.
    pub refresh_interval: Option<Duration>,
    /// One retry after this delay if the very first page is empty.
    pub first_run_grace: Option<Duration>,
    pub resolve_links: bool,
    pub page_size: usize,
}

impl SourceOptions {
    /// Finite forward read of `stream` starting at `from`.
    pub fn new(stream: impl Into<String>, from: ReadFrom) -> Self {
        Self {
            stream: stream.into(),
            from,
            direction: Direction::Forwards,
            refresh_interval: None,
            first_run_grace: None,
            resolve_links: false,
            page_size: 500,
        }
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Keep polling the head at `interval` instead of completing.
    pub fn refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn first_run_grace(mut self, grace: Option<Duration>) -> Self {
        self.first_run_grace = grace;
        self
    }

    pub fn resolve_links(mut self, resolve: bool) -> Self {
        self.resolve_links = resolve;
        self
    }

    /// Records per read; at least one.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

/// Whether `position` lies strictly beyond `last` in the direction of travel.
fn advances(direction: Direction, last: Option<StreamPosition>, position: StreamPosition) -> bool {
    match (direction, last) {
        (_, None) => true,
        (Direction::Forwards, Some(last)) => position > last,
        (Direction::Backwards, Some(last)) => position < last,
    }
}

/// Open a stream source.
pub fn open(client: Arc<dyn EventStoreClient>, options: SourceOptions) -> RecordStream {
    Box::pin(try_stream! {
        let page_size = options.page_size.max(1);
        let mut cursor = options.from;
        let mut last: Option<StreamPosition> = None;
        let mut first_run = true;
        let mut reached_start = false;

        loop {
            let request = ReadRequest {
                stream: options.stream.clone(),
                from: cursor,
                direction: options.direction,
                max_count: page_size,
                resolve_links: options.resolve_links,
            };
            let records = match client.read_stream(request).await? {
                ReadResult::Ok(records) => records,
                ReadResult::StreamNotFound => {
                    trace!(stream = %options.stream, "stream not found, treating as empty");
                    Vec::new()
                }
            };
            let fetched = records.len();

            for record in records {
                let position = record.resume_position();
                if !advances(options.direction, last, position) {
                    continue;
                }
                last = Some(position);
                cursor = match options.direction {
                    Direction::Forwards => ReadFrom::Position(position.next()),
                    Direction::Backwards => match position.prev() {
                        Some(prev) => ReadFrom::Position(prev),
                        None => {
                            reached_start = true;
                            cursor
                        }
                    },
                };
                yield record;
            }

            if reached_start {
                break;
            }

            if fetched == 0
                && first_run
                && options.refresh_interval.is_none()
                && options.first_run_grace.is_some()
            {
                first_run = false;
                if let Some(grace) = options.first_run_grace {
                    debug!(stream = %options.stream, ?grace, "first page empty, retrying once");
                    tokio::time::sleep(grace).await;
                }
                continue;
            }
            first_run = false;

            if fetched >= page_size {
                continue;
            }

            match options.refresh_interval {
                Some(interval) => {
                    trace!(stream = %options.stream, ?interval, "reached head, polling");
                    tokio::time::sleep(interval).await;
                }
                None => break,
            }
        }
    })
}
