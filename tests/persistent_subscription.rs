//! Integration tests for consumer-group subscriptions.

use eventstore_journal::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Deposit {
    account: String,
    cents: u64,
}

struct Fixture {
    store: Arc<InMemoryEventStore>,
    codec: Arc<dyn RecordAdapter>,
    journal: Journal,
    read_journal: ReadJournal,
}

fn fixture() -> Fixture {
    let settings = Settings::default().with_refresh_interval(Duration::from_millis(20));
    let store = Arc::new(InMemoryEventStore::with_projection(&settings));
    let mut types = TypeRegistry::new();
    types.register_as::<Deposit>("bank.Deposit");
    let codec: Arc<dyn RecordAdapter> = Arc::new(EnvelopeCodec::new(Arc::new(types), &settings));
    Fixture {
        journal: Journal::new(store.clone(), codec.clone(), settings.clone()),
        read_journal: ReadJournal::new(store.clone(), codec.clone(), settings),
        store,
        codec,
    }
}

fn fast_restart() -> RestartSettings {
    RestartSettings::new(Duration::from_millis(1), Duration::from_millis(10), 0.0)
}

async fn deposit(journal: &Journal, account: &str, seqs: std::ops::RangeInclusive<u64>) {
    let payload = seqs
        .map(|seq| {
            PersistentRepr::new(
                Payload::new(Deposit {
                    account: account.to_string(),
                    cents: seq * 100,
                }),
                account,
                seq,
            )
        })
        .collect();
    let results = journal
        .write_messages(vec![AtomicWrite::new(account, payload)])
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.is_ok()));
}

async fn next(subscription: &mut PersistentSubscription) -> Result<PersistentMessage> {
    timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("subscription stalled")
        .expect("subscription ended")
}

fn sequence_nr(codec: &Arc<dyn RecordAdapter>, message: &PersistentMessage) -> u64 {
    codec
        .from_record(&message.record)
        .unwrap()
        .expect("journal event")
        .sequence_nr
}

async fn wait_for_consumers(store: &InMemoryEventStore, stream: &str, group: &str, count: usize) {
    timeout(Duration::from_secs(5), async {
        while store.persistent_consumer_count(stream, group) != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("consumer count never reached");
}

// --- Delivery ---

#[tokio::test]
async fn test_delivers_every_record_then_waits() {
    let f = fixture();
    for batch in 0..15u64 {
        deposit(&f.journal, "acct-1", batch * 10 + 1..=batch * 10 + 10).await;
    }

    let mut subscription = f.read_journal.persistent_subscription("acct-1", "billing", 500, None);
    for expected in 1..=150u64 {
        let message = next(&mut subscription).await.unwrap();
        assert_eq!(sequence_nr(&f.codec, &message), expected);
        assert_eq!(message.retry_count, 0);
        message.ack();
    }

    // Demand for a 151st record stays unanswered.
    assert!(timeout(Duration::from_millis(150), subscription.next()).await.is_err());
    assert_eq!(f.store.in_flight_count("acct-1", "billing"), 0);

    deposit(&f.journal, "acct-1", 151..=151).await;
    let message = next(&mut subscription).await.unwrap();
    assert_eq!(sequence_nr(&f.codec, &message), 151);
    message.ack();
}

#[tokio::test]
async fn test_nack_retry_and_park() {
    let f = fixture();
    deposit(&f.journal, "acct-1", 1..=2).await;

    let mut subscription = f.read_journal.persistent_subscription("acct-1", "billing", 16, None);
    let first = next(&mut subscription).await.unwrap();
    assert_eq!(sequence_nr(&f.codec, &first), 1);
    first.nack(NackAction::Park, "poison");

    let second = next(&mut subscription).await.unwrap();
    assert_eq!(sequence_nr(&f.codec, &second), 2);
    second.nack(NackAction::Retry, "busy");

    let again = next(&mut subscription).await.unwrap();
    assert_eq!(sequence_nr(&f.codec, &again), 2);
    assert_eq!(again.retry_count, 1);
    again.ack();

    assert_eq!(f.store.parked("acct-1", "billing"), vec![StreamPosition(0)]);
}

#[tokio::test]
async fn test_groups_are_independent() {
    let f = fixture();
    deposit(&f.journal, "acct-1", 1..=3).await;

    let mut billing = f.read_journal.persistent_subscription("acct-1", "billing", 16, None);
    let mut audit = f.read_journal.persistent_subscription("acct-1", "audit", 16, None);
    for expected in 1..=3u64 {
        let a = next(&mut billing).await.unwrap();
        let b = next(&mut audit).await.unwrap();
        assert_eq!(sequence_nr(&f.codec, &a), expected);
        assert_eq!(sequence_nr(&f.codec, &b), expected);
        a.ack();
        b.ack();
    }
}

// --- Drops and restarts ---

#[tokio::test]
async fn test_drop_without_restart_fails() {
    let f = fixture();
    deposit(&f.journal, "acct-1", 1..=2).await;

    let mut subscription = f.read_journal.persistent_subscription("acct-1", "billing", 16, None);
    next(&mut subscription).await.unwrap().ack();
    f.store
        .drop_persistent_subscriptions("acct-1", "billing", DropReason::ServerRestart);

    let error = loop {
        match next(&mut subscription).await {
            Ok(message) => message.ack(),
            Err(error) => break error,
        }
    };
    match error {
        JournalError::PersistentSubscriptionDropped { stream, group, reason } => {
            assert_eq!(stream, "acct-1");
            assert_eq!(group, "billing");
            assert_eq!(reason, DropReason::ServerRestart);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(subscription.next().await.is_none());
}

#[tokio::test]
async fn test_restart_resumes_delivery() {
    let f = fixture();
    deposit(&f.journal, "acct-1", 1..=10).await;

    let mut subscription =
        f.read_journal
            .persistent_subscription("acct-1", "billing", 4, Some(fast_restart()));
    let mut seen = BTreeSet::new();
    for _ in 0..5 {
        let message = next(&mut subscription).await.unwrap();
        seen.insert(sequence_nr(&f.codec, &message));
        message.ack();
    }

    f.store
        .drop_persistent_subscriptions("acct-1", "billing", DropReason::ConnectionClosed);
    deposit(&f.journal, "acct-1", 11..=15).await;

    while seen.len() < 15 {
        let message = next(&mut subscription).await.unwrap();
        seen.insert(sequence_nr(&f.codec, &message));
        message.ack();
    }
    assert_eq!(seen, (1..=15).collect::<BTreeSet<u64>>());
    assert_eq!(f.store.persistent_consumer_count("acct-1", "billing"), 1);
}

#[tokio::test]
async fn test_restart_budget_exhausted() {
    let f = fixture();
    deposit(&f.journal, "acct-1", 1..=1).await;

    let restart = fast_restart().with_max_restarts(1, Duration::from_secs(60));
    let mut subscription =
        f.read_journal
            .persistent_subscription("acct-1", "billing", 16, Some(restart));
    next(&mut subscription).await.unwrap().ack();

    f.store
        .drop_persistent_subscriptions("acct-1", "billing", DropReason::ConnectionClosed);
    deposit(&f.journal, "acct-1", 2..=2).await;
    let after_restart = next(&mut subscription).await.unwrap();
    assert_eq!(sequence_nr(&f.codec, &after_restart), 2);
    after_restart.ack();
    wait_for_consumers(&f.store, "acct-1", "billing", 1).await;

    f.store
        .drop_persistent_subscriptions("acct-1", "billing", DropReason::ConnectionClosed);
    let error = loop {
        match next(&mut subscription).await {
            Ok(message) => message.ack(),
            Err(error) => break error,
        }
    };
    assert!(error.is_dropped());
    assert!(subscription.next().await.is_none());
}

#[tokio::test]
async fn test_cancel_leaves_the_group() {
    let f = fixture();
    deposit(&f.journal, "acct-1", 1..=3).await;

    let mut subscription =
        f.read_journal
            .persistent_subscription("acct-1", "billing", 16, Some(fast_restart()));
    next(&mut subscription).await.unwrap().ack();
    assert_eq!(f.store.persistent_consumer_count("acct-1", "billing"), 1);

    subscription.cancel();
    assert!(subscription.is_cancelled());
    // The group slot is released without polling again.
    assert_eq!(f.store.persistent_consumer_count("acct-1", "billing"), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.store.persistent_consumer_count("acct-1", "billing"), 0);
    assert_eq!(f.store.in_flight_count("acct-1", "billing"), 0);

    let rest = timeout(Duration::from_secs(5), subscription.by_ref().count())
        .await
        .expect("cancelled subscription kept running");
    assert_eq!(rest, 0);

    // Records the cancelled consumer held go to the next member.
    let mut other = f
        .read_journal
        .persistent_subscription("acct-1", "billing", 16, None);
    let message = next(&mut other).await.unwrap();
    assert_eq!(sequence_nr(&f.codec, &message), 2);
    message.ack();
}
