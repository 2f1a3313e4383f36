//! Property tests for the offset/filter engine and query offsets.

use eventstore_journal::query::{decide, Decision};
use eventstore_journal::*;
use futures::TryStreamExt;
use proptest::prelude::*;
use std::sync::Arc;

/// Scan `sequence_nrs` in order the way a query does, stopping when told to.
fn scan(direction: Direction, min: u64, max: u64, sequence_nrs: &[u64]) -> Vec<u64> {
    let mut included = Vec::new();
    for &seq in sequence_nrs {
        let decision = decide(direction, min, max, seq);
        if decision.includes() {
            included.push(seq);
        }
        if decision.stops() {
            break;
        }
    }
    included
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

// --- Window filtering ---

proptest! {
    #[test]
    fn forward_scan_yields_exactly_the_window(len in 0u64..60, min in 0u64..70, span in 0u64..70) {
        let max = min.saturating_add(span);
        let stream: Vec<u64> = (1..=len).collect();
        let included = scan(Direction::Forwards, min, max, &stream);

        let expected: Vec<u64> =
            stream.iter().copied().filter(|s| *s >= min && *s <= max).collect();
        prop_assert_eq!(&included, &expected);
        prop_assert!(included.iter().all(|s| *s >= min && *s <= max));
    }

    #[test]
    fn backward_scan_yields_exactly_the_window(len in 0u64..60, min in 0u64..70, span in 0u64..70) {
        let max = min.saturating_add(span);
        let stream: Vec<u64> = (1..=len).rev().collect();
        let included = scan(Direction::Backwards, min, max, &stream);

        let expected: Vec<u64> =
            stream.iter().copied().filter(|s| *s >= min && *s <= max).collect();
        prop_assert_eq!(&included, &expected);
        prop_assert!(included.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn scan_never_continues_past_the_far_bound(min in 1u64..50, span in 0u64..20) {
        let max = min + span;
        prop_assert_eq!(decide(Direction::Forwards, min, max, max), Decision::IncludeThenStop);
        prop_assert_eq!(decide(Direction::Forwards, min, max, max + 1), Decision::Stop);
        prop_assert_eq!(decide(Direction::Backwards, min, max, min), Decision::IncludeThenStop);
        prop_assert_eq!(decide(Direction::Backwards, min, max, min - 1), Decision::Stop);
    }
}

// --- Query offsets ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn tag_offsets_increase_and_resume_as_suffix(
        writes in prop::collection::vec((0usize..3, any::<bool>()), 1..25),
        resume_at in 0usize..25,
    ) {
        let (offsets, resumed) = runtime().block_on(async {
            let settings = Settings {
                first_run_grace: None,
                ..Settings::default()
            };
            let store = Arc::new(InMemoryEventStore::with_projection(&settings));
            let mut types = TypeRegistry::new();
            types.register_as::<u64>("n");
            let codec: Arc<dyn RecordAdapter> =
                Arc::new(EnvelopeCodec::new(Arc::new(types), &settings));
            let journal = Journal::new(store.clone(), codec.clone(), settings.clone());
            let read_journal = ReadJournal::new(store, codec, settings);

            let mut next_seq = [1u64; 3];
            for (entity, tagged) in &writes {
                let seq = next_seq[*entity];
                next_seq[*entity] += 1;
                let event = Payload::new(seq);
                let payload = if *tagged { Payload::tagged(event, ["t"]) } else { event };
                let id = format!("e-{}", entity);
                let repr = PersistentRepr::new(payload, id.clone(), seq);
                let write = AtomicWrite::new(id, vec![repr]);
                journal.write_messages(vec![write]).await.unwrap();
            }

            let all: Vec<EventEnvelope> = read_journal
                .current_events_by_tag("t", Offset::NoOffset)
                .try_collect()
                .await
                .unwrap();
            let offsets: Vec<Offset> = all.iter().map(|e| e.offset).collect();

            let resumed = match offsets.get(resume_at) {
                Some(offset) => {
                    let tail: Vec<EventEnvelope> = read_journal
                        .current_events_by_tag("t", *offset)
                        .try_collect()
                        .await
                        .unwrap();
                    Some(tail.iter().map(|e| e.offset).collect::<Vec<_>>())
                }
                None => None,
            };
            (offsets, resumed)
        });

        let tagged = writes.iter().filter(|(_, tagged)| *tagged).count();
        prop_assert_eq!(offsets.len(), tagged);
        prop_assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        if let Some(tail) = resumed {
            prop_assert_eq!(&tail[..], &offsets[resume_at + 1..]);
        }
    }
}
