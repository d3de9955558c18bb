use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use sqs_pump::{
    client::{DeleteEntry, InMemoryClient, SendEntry},
    BatchEntryFailure, BodyFormat, Consumer, Event, EventStream, Message, OutgoingMessage,
    QueueClient, QueueError, QueueTarget, ReceiveRequest, ReceivedMessage, SendBatchResult,
    SendResult,
};
use tokio::time::{sleep, timeout, Instant};

const QUEUE: &str = "jobs";

/// Wraps an [`InMemoryClient`], failing a set number of receives before passing them
/// through.
#[derive(Clone)]
struct FlakyClient {
    inner: InMemoryClient,
    failing_receives: Arc<AtomicUsize>,
}

impl FlakyClient {
    fn new(inner: InMemoryClient, failing_receives: usize) -> Self {
        Self {
            inner,
            failing_receives: Arc::new(AtomicUsize::new(failing_receives)),
        }
    }
}

impl QueueClient for FlakyClient {
    async fn receive(
        &self,
        target: &QueueTarget,
        request: ReceiveRequest,
    ) -> sqs_pump::Result<Vec<ReceivedMessage>> {
        let failing = self
            .failing_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QueueError::generic(std::io::Error::other("connection reset")));
        }
        self.inner.receive(target, request).await
    }

    async fn delete_batch(
        &self,
        target: &QueueTarget,
        entries: Vec<DeleteEntry>,
    ) -> sqs_pump::Result<Vec<BatchEntryFailure>> {
        self.inner.delete_batch(target, entries).await
    }

    async fn change_visibility(
        &self,
        target: &QueueTarget,
        receipt_token: &str,
        timeout: Duration,
    ) -> sqs_pump::Result<()> {
        self.inner
            .change_visibility(target, receipt_token, timeout)
            .await
    }

    async fn send(
        &self,
        target: &QueueTarget,
        message: OutgoingMessage,
    ) -> sqs_pump::Result<SendResult> {
        self.inner.send(target, message).await
    }

    async fn send_batch(
        &self,
        target: &QueueTarget,
        entries: Vec<SendEntry>,
    ) -> sqs_pump::Result<SendBatchResult> {
        self.inner.send_batch(target, entries).await
    }

    async fn resolve_target(
        &self,
        name: &str,
        owner_account: Option<&str>,
    ) -> sqs_pump::Result<QueueTarget> {
        self.inner.resolve_target(name, owner_account).await
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> sqs_pump::Result<QueueTarget> {
        self.inner.create_queue(name, attributes).await
    }

    async fn delete_queue(&self, target: &QueueTarget) -> sqs_pump::Result<()> {
        self.inner.delete_queue(target).await
    }
}

fn client_with_queue() -> InMemoryClient {
    let client = InMemoryClient::new();
    client.create_queue_named(QUEUE);
    client
}

async fn fill<C: QueueClient>(consumer: &Consumer<C>, count: usize) {
    let messages = (0..count)
        .map(|i| OutgoingMessage::new(format!("job {i}")))
        .collect();
    let result = consumer.send_messages(messages, None).await.unwrap();
    assert_eq!(result.successful.len(), count);
}

/// Collects events up to and including the first one matching `done`.
async fn events_until(
    events: &mut EventStream,
    mut done: impl FnMut(&Event) -> bool,
) -> Vec<Event> {
    let mut seen = Vec::new();
    timeout(Duration::from_secs(600), async {
        while let Some(event) = events.recv().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                return;
            }
        }
    })
    .await
    .expect("expected event never arrived");
    seen
}

fn delivered(events: &[Event]) -> Vec<Message> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Message(message) => Some(message.clone()),
            _ => None,
        })
        .collect()
}

fn count(events: &[Event], matches: impl Fn(&Event) -> bool) -> usize {
    events.iter().filter(|event| matches(*event)).count()
}

/// Delivers every message once, then reports a single drain once they are all deleted
/// and removes them from the queue after the delete wait.
#[tokio::test(start_paused = true)]
async fn delivers_and_drains() {
    let client = client_with_queue();
    let consumer = Consumer::builder(client.clone())
        .queue_name(QUEUE)
        .build()
        .unwrap();
    let mut events = consumer.subscribe();
    fill(&consumer, 3).await;

    consumer.start();
    let seen = events_until(&mut events, |e| matches!(e, Event::QueueEmpty)).await;
    let messages = delivered(&seen);
    assert_eq!(messages.len(), 3);
    assert_eq!(consumer.in_flight(), 3);
    assert!(matches!(seen[0], Event::GotMessages(3)));

    for message in &messages {
        assert!(message.delete());
    }
    assert_eq!(consumer.in_flight(), 0);

    let last = messages[2].id().to_owned();
    let seen = events_until(
        &mut events,
        |e| matches!(e, Event::Deleted(m) if m.id() == last),
    )
    .await;
    assert_eq!(count(&seen, |e| matches!(e, Event::Drained)), 1);
    assert_eq!(count(&seen, |e| matches!(e, Event::DeleteQueued(_))), 3);
    assert_eq!(count(&seen, |e| matches!(e, Event::Deleted(_))), 3);
    assert!(client.is_empty(QUEUE));
}

#[tokio::test(start_paused = true)]
async fn fifteen_messages_arrive_in_two_batches() {
    let consumer = Consumer::builder(client_with_queue())
        .queue_name(QUEUE)
        .max_in_flight(0)
        .build()
        .unwrap();
    let mut events = consumer.subscribe();
    fill(&consumer, 15).await;

    consumer.start();
    let seen = events_until(&mut events, |e| matches!(e, Event::QueueEmpty)).await;

    let batches: Vec<_> = seen
        .iter()
        .filter_map(|event| match event {
            Event::GotMessages(n) => Some(*n),
            _ => None,
        })
        .collect();
    assert_eq!(batches, [10, 5]);
    assert_eq!(delivered(&seen).len(), 15);
    assert_eq!(consumer.in_flight(), 15);
}

/// With the cap reached polling stops; disposing of K messages lets exactly K more in.
#[tokio::test(start_paused = true)]
async fn cap_pauses_and_disposal_resumes() {
    let consumer = Consumer::builder(client_with_queue())
        .queue_name(QUEUE)
        .max_in_flight(5)
        .build()
        .unwrap();
    let mut events = consumer.subscribe();
    fill(&consumer, 12).await;

    consumer.start();
    let seen = events_until(&mut events, |e| matches!(e, Event::MaxInFlight)).await;
    let first = delivered(&seen);
    assert_eq!(first.len(), 5);

    // Nothing more arrives while paused.
    sleep(Duration::from_secs(60)).await;
    assert!(events.try_recv().is_none());

    first[0].delete();
    first[1].keep();
    let seen = events_until(&mut events, |e| matches!(e, Event::MaxInFlight)).await;
    assert_eq!(delivered(&seen).len(), 2);
    assert_eq!(consumer.in_flight(), 5);
}

/// A cap that is not a multiple of the batch size shrinks the last receive to fit.
#[tokio::test(start_paused = true)]
async fn batches_shrink_to_the_remaining_capacity() {
    let consumer = Consumer::builder(client_with_queue())
        .queue_name(QUEUE)
        .max_in_flight(15)
        .build()
        .unwrap();
    let mut events = consumer.subscribe();
    fill(&consumer, 20).await;

    consumer.start();
    let seen = events_until(&mut events, |e| matches!(e, Event::MaxInFlight)).await;
    let batches: Vec<_> = seen
        .iter()
        .filter_map(|event| match event {
            Event::GotMessages(n) => Some(*n),
            _ => None,
        })
        .collect();
    assert_eq!(batches, [10, 5]);
    let first = delivered(&seen);
    assert_eq!(first.len(), 15);

    for message in &first[..3] {
        assert!(message.delete());
    }
    let seen = events_until(&mut events, |e| matches!(e, Event::MaxInFlight)).await;
    assert_eq!(delivered(&seen).len(), 3);
    assert_eq!(consumer.in_flight(), 15);

    sleep(Duration::from_secs(5)).await;
    let later: Vec<_> = std::iter::from_fn(|| events.try_recv()).collect();
    assert!(delivered(&later).is_empty());
}

#[tokio::test(start_paused = true)]
async fn uncapped_consumer_never_pauses() {
    let consumer = Consumer::builder(client_with_queue())
        .queue_name(QUEUE)
        .max_in_flight(0)
        .build()
        .unwrap();
    let mut events = consumer.subscribe();
    fill(&consumer, 250).await;

    consumer.start();
    let seen = events_until(&mut events, |e| matches!(e, Event::QueueEmpty)).await;

    assert_eq!(delivered(&seen).len(), 250);
    assert_eq!(count(&seen, |e| matches!(e, Event::MaxInFlight)), 0);
}

/// A failed receive is reported once and retried after the poll retry delay.
#[tokio::test(start_paused = true)]
async fn recovers_from_a_failed_receive() {
    let client = FlakyClient::new(client_with_queue(), 1);
    let consumer = Consumer::builder(client)
        .queue_name(QUEUE)
        .poll_retry(Duration::from_secs(3))
        .build()
        .unwrap();
    let mut events = consumer.subscribe();
    fill(&consumer, 4).await;

    let started = Instant::now();
    consumer.start();
    let seen = events_until(&mut events, |e| matches!(e, Event::QueueEmpty)).await;

    assert_eq!(count(&seen, |e| matches!(e, Event::Error(_))), 1);
    assert!(matches!(seen[0], Event::Error(_)));
    assert_eq!(delivered(&seen).len(), 4);
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn hard_stop_aborts_the_long_poll() {
    let consumer = Consumer::builder(client_with_queue())
        .queue_name(QUEUE)
        .build()
        .unwrap();
    let mut events = consumer.subscribe();

    consumer.start();
    sleep(Duration::from_secs(5)).await;
    consumer.stop(true);
    assert!(!consumer.is_running());

    let seen = events_until(&mut events, |e| matches!(e, Event::Aborted)).await;
    assert_eq!(seen.len(), 1);

    fill(&consumer, 1).await;
    sleep(Duration::from_secs(60)).await;
    assert!(events.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn soft_stop_still_delivers_the_outstanding_receive() {
    let consumer = Consumer::builder(client_with_queue())
        .queue_name(QUEUE)
        .build()
        .unwrap();
    let mut events = consumer.subscribe();

    consumer.start();
    sleep(Duration::from_secs(5)).await;
    consumer.stop(false);
    fill(&consumer, 1).await;

    let seen = events_until(&mut events, |e| matches!(e, Event::Message(_))).await;
    assert_eq!(delivered(&seen).len(), 1);

    // No further receive is issued.
    fill(&consumer, 1).await;
    sleep(Duration::from_secs(60)).await;
    assert!(events.try_recv().is_none());
    assert_eq!(consumer.in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn disposal_is_idempotent() {
    let consumer = Consumer::builder(client_with_queue())
        .queue_name(QUEUE)
        .build()
        .unwrap();
    let mut events = consumer.subscribe();
    fill(&consumer, 2).await;

    consumer.start();
    let seen = events_until(&mut events, |e| matches!(e, Event::QueueEmpty)).await;
    let messages = delivered(&seen);

    assert!(consumer.delete_message(&messages[0]));
    assert!(!consumer.delete_message(&messages[0]));
    assert!(!messages[0].clone().keep());
    assert!(!consumer.release_message(&messages[0]));
    assert_eq!(consumer.in_flight(), 1);

    let seen = events_until(&mut events, |e| matches!(e, Event::Deleted(_))).await;
    assert_eq!(count(&seen, |e| matches!(e, Event::DeleteQueued(_))), 1);
    assert_eq!(count(&seen, |e| matches!(e, Event::Handled(_))), 1);
    assert_eq!(count(&seen, |e| matches!(e, Event::Drained)), 0);
}

#[tokio::test(start_paused = true)]
async fn released_message_is_redelivered() {
    let consumer = Consumer::builder(client_with_queue())
        .queue_name(QUEUE)
        .build()
        .unwrap();
    let mut events = consumer.subscribe();
    fill(&consumer, 1).await;

    consumer.start();
    let seen = events_until(&mut events, |e| matches!(e, Event::Message(_))).await;
    let first = delivered(&seen).remove(0);
    assert_eq!(first.receive_count(), Some(1));

    assert!(first.release());
    let seen = events_until(&mut events, |e| matches!(e, Event::Message(_))).await;
    assert_eq!(count(&seen, |e| matches!(e, Event::Released(_))), 1);

    let second = delivered(&seen).remove(0);
    assert_eq!(second.id(), first.id());
    assert_ne!(second.receipt_token(), first.receipt_token());
    assert_eq!(second.receive_count(), Some(2));
}

/// Without renewals a held message comes back after its visibility timeout; with them it
/// stays leased to the consumer.
#[tokio::test(start_paused = true)]
async fn lease_extension_prevents_redelivery() {
    let consumer = Consumer::builder(client_with_queue())
        .queue_name(QUEUE)
        .visibility_timeout(Duration::from_secs(10))
        .lease_lead(Duration::from_secs(2))
        .auto_extend_lease(true)
        .build()
        .unwrap();
    let mut events = consumer.subscribe();
    fill(&consumer, 1).await;

    consumer.start();
    let seen = events_until(&mut events, |e| matches!(e, Event::Message(_))).await;
    let message = delivered(&seen).remove(0);

    sleep(Duration::from_secs(60)).await;
    let held: Vec<_> = std::iter::from_fn(|| events.try_recv()).collect();
    assert_eq!(delivered(&held).len(), 0);
    assert!(count(&held, |e| matches!(e, Event::LeaseExtended(_))) >= 6);

    message.delete();
    let seen = events_until(&mut events, |e| matches!(e, Event::Deleted(_))).await;
    assert_eq!(count(&seen, |e| matches!(e, Event::DeleteFailed(_))), 0);

    sleep(Duration::from_secs(60)).await;
    let after: Vec<_> = std::iter::from_fn(|| events.try_recv()).collect();
    assert_eq!(count(&after, |e| matches!(e, Event::LeaseExtended(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn held_message_without_extension_is_redelivered() {
    let consumer = Consumer::builder(client_with_queue())
        .queue_name(QUEUE)
        .visibility_timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    let mut events = consumer.subscribe();
    fill(&consumer, 1).await;

    consumer.start();
    let started = Instant::now();
    let seen = events_until(&mut events, |e| matches!(e, Event::Message(_))).await;
    let first = delivered(&seen).remove(0);

    let seen = events_until(&mut events, |e| matches!(e, Event::Message(_))).await;
    let second = delivered(&seen).remove(0);
    assert_eq!(second.id(), first.id());
    assert!(started.elapsed() >= Duration::from_secs(10));

    // The first delivery's receipt is stale now.
    first.delete();
    let seen = events_until(&mut events, |e| matches!(e, Event::DeleteFailed(_))).await;
    let failure = seen
        .into_iter()
        .find_map(|e| match e {
            Event::DeleteFailed(failure) => Some(failure),
            _ => None,
        })
        .unwrap();
    assert_eq!(failure.code, "ReceiptHandleIsInvalid");
    assert_eq!(failure.message.id(), first.id());
}

#[tokio::test(start_paused = true)]
async fn send_messages_splits_large_batches() {
    let client = client_with_queue();
    let consumer = Consumer::builder(client.clone())
        .queue_name(QUEUE)
        .build()
        .unwrap();

    let messages = (0..25)
        .map(|i| OutgoingMessage::new(format!("job {i}")))
        .collect();
    let result = consumer
        .send_messages(messages, Some(Duration::from_secs(1)))
        .await
        .unwrap();

    assert!(result.failed.is_empty());
    let ids: Vec<_> = result.successful.iter().map(|s| s.id.as_str()).collect();
    let expected: Vec<_> = (0..25).map(|i| i.to_string()).collect();
    assert_eq!(ids, expected);
    assert_eq!(client.len(QUEUE), 25);
}

#[tokio::test(start_paused = true)]
async fn json_bodies_and_sns_envelopes() {
    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct Job {
        id: u32,
    }

    let consumer = Consumer::builder(client_with_queue())
        .queue_name(QUEUE)
        .body_format(BodyFormat::Json)
        .unwrap_sns(true)
        .build()
        .unwrap();
    let mut events = consumer.subscribe();

    let envelope = serde_json::json!({
        "Type": "Notification",
        "TopicArn": "arn:aws:sns:eu-west-1:123456789012:jobs-topic",
        "Subject": "job",
        "Message": serde_json::to_string(&Job { id: 7 }).unwrap(),
    });
    consumer.send_serde_json(&envelope).await.unwrap();

    consumer.start();
    let seen = events_until(&mut events, |e| matches!(e, Event::Message(_))).await;
    let message = delivered(&seen).remove(0);

    assert_eq!(message.body_json::<Job>().unwrap(), Job { id: 7 });
    assert_eq!(message.json().unwrap()["id"], 7);
    assert_eq!(message.subject(), Some("job"));
    assert_eq!(message.topic_name(), Some("jobs-topic"));
}

#[tokio::test(start_paused = true)]
async fn undecodable_body_is_reported_and_still_delivered() {
    let consumer = Consumer::builder(client_with_queue())
        .queue_name(QUEUE)
        .body_format(BodyFormat::Json)
        .build()
        .unwrap();
    let mut events = consumer.subscribe();
    consumer
        .send_message(OutgoingMessage::new("not json"))
        .await
        .unwrap();

    consumer.start();
    let seen = events_until(&mut events, |e| matches!(e, Event::Message(_))).await;

    assert!(seen
        .iter()
        .any(|e| matches!(e, Event::Error(e) if matches!(**e, QueueError::Serde(_)))));
    assert_eq!(delivered(&seen)[0].body(), "not json");
}

#[tokio::test(start_paused = true)]
async fn queue_lifecycle() {
    let client = InMemoryClient::new();
    let consumer = Consumer::builder(client.clone())
        .queue_name("fresh")
        .build()
        .unwrap();

    let err = consumer.queue_target().await.unwrap_err();
    assert!(matches!(err, QueueError::QueueNotFound(_)));

    let created = consumer.create_queue(&HashMap::new()).await.unwrap();
    assert_eq!(consumer.queue_target().await.unwrap(), created);

    consumer
        .send_message(OutgoingMessage::new("hello"))
        .await
        .unwrap();
    assert_eq!(client.len("fresh"), 1);

    consumer.delete_queue().await.unwrap();
    let err = consumer
        .send_message(OutgoingMessage::new("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::QueueNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn missing_queue_is_reported_and_retried() {
    let consumer = Consumer::builder(InMemoryClient::new())
        .queue_name("nowhere")
        .poll_retry(Duration::from_secs(1))
        .build()
        .unwrap();
    let mut events = consumer.subscribe();

    consumer.start();
    sleep(Duration::from_millis(2500)).await;

    let seen: Vec<_> = std::iter::from_fn(|| events.try_recv()).collect();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(
        |e| matches!(e, Event::Error(e) if matches!(**e, QueueError::QueueNotFound(_)))
    ));
}

#[test]
fn queue_identity_is_required() {
    let err = Consumer::builder(InMemoryClient::new())
        .max_in_flight(10)
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, QueueError::MissingQueueIdentity));
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_pending_deletes() {
    let client = client_with_queue();
    let consumer = Consumer::builder(client.clone())
        .queue_name(QUEUE)
        .delete_wait(Duration::from_secs(3600))
        .build()
        .unwrap();
    let mut events = consumer.subscribe();
    fill(&consumer, 3).await;

    consumer.start();
    let seen = events_until(&mut events, |e| matches!(e, Event::QueueEmpty)).await;
    for message in delivered(&seen) {
        message.delete();
    }
    assert_eq!(client.len(QUEUE), 3);

    assert!(consumer.shutdown(true, Duration::from_secs(5)).await);
    assert!(client.is_empty(QUEUE));
}
