use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};

use super::{
    BatchEntryFailure, DeleteEntry, OutgoingMessage, QueueClient, QueueTarget, ReceiveRequest,
    ReceivedMessage, SendBatchResult, SendEntry, SendResult, SendSuccess, MAX_BATCH_SIZE,
};
use crate::{QueueError, Result};

const URL_PREFIX: &str = "memory://";
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// A process-local queue service.
///
/// Messages are leased on receive exactly like SQS does it: each receive hands out a fresh
/// receipt token, and a message becomes receivable again once its lease runs out unless it
/// is deleted first. Clones share the same set of queues.
#[derive(Clone, Default)]
pub struct InMemoryClient {
    inner: Arc<Broker>,
}

#[derive(Default)]
struct Broker {
    queues: Mutex<HashMap<String, StoredQueue>>,
    arrivals: Notify,
    sequence: AtomicU64,
}

struct StoredQueue {
    visibility_timeout: Duration,
    messages: Vec<StoredMessage>,
}

struct StoredMessage {
    id: String,
    body: String,
    message_attributes: HashMap<String, String>,
    visible_at: Instant,
    receipt_token: Option<String>,
    receive_count: u32,
}

impl StoredQueue {
    fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            messages: Vec::new(),
        }
    }

    fn take_visible(
        &mut self,
        now: Instant,
        max_messages: usize,
        visibility_timeout: Duration,
        sequence: &AtomicU64,
    ) -> Vec<ReceivedMessage> {
        self.messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .take(max_messages)
            .map(|m| {
                let token = format!("{}#{}", m.id, sequence.fetch_add(1, Ordering::Relaxed));
                m.visible_at = now + visibility_timeout;
                m.receipt_token = Some(token.clone());
                m.receive_count += 1;

                ReceivedMessage {
                    id: m.id.clone(),
                    receipt_token: token,
                    body: m.body.clone(),
                    attributes: HashMap::from([(
                        "ApproximateReceiveCount".to_owned(),
                        m.receive_count.to_string(),
                    )]),
                    message_attributes: m.message_attributes.clone(),
                }
            })
            .collect()
    }

    fn next_visible_at(&self, now: Instant) -> Option<Instant> {
        self.messages
            .iter()
            .map(|m| m.visible_at)
            .filter(|at| *at > now)
            .min()
    }

    fn leased_mut(&mut self, receipt_token: &str, now: Instant) -> Option<&mut StoredMessage> {
        self.messages.iter_mut().find(|m| {
            m.visible_at > now && m.receipt_token.as_deref() == Some(receipt_token)
        })
    }
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a queue with the default visibility timeout, returning its address.
    pub fn create_queue_named(&self, name: &str) -> QueueTarget {
        self.inner
            .queues
            .lock()
            .entry(name.to_owned())
            .or_insert_with(|| StoredQueue::new(DEFAULT_VISIBILITY_TIMEOUT));
        target_for(name)
    }

    /// Number of messages stored in the queue, leased or not.
    pub fn len(&self, name: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(name)
            .map_or(0, |q| q.messages.len())
    }

    pub fn is_empty(&self, name: &str) -> bool {
        self.len(name) == 0
    }

    /// Number of messages currently leased to a consumer.
    pub fn leased_len(&self, name: &str) -> usize {
        let now = Instant::now();
        self.inner.queues.lock().get(name).map_or(0, |q| {
            q.messages
                .iter()
                .filter(|m| m.visible_at > now && m.receipt_token.is_some())
                .count()
        })
    }

    fn push(&self, target: &QueueTarget, message: OutgoingMessage) -> Result<String> {
        let name = queue_name(target)?;
        let id = format!(
            "msg-{:08}",
            self.inner.sequence.fetch_add(1, Ordering::Relaxed)
        );

        let mut queues = self.inner.queues.lock();
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_owned()))?;
        queue.messages.push(StoredMessage {
            id: id.clone(),
            body: message.body,
            message_attributes: message.attributes,
            visible_at: Instant::now() + message.delay.unwrap_or_default(),
            receipt_token: None,
            receive_count: 0,
        });

        tracing::trace!(queue = name, message_id = %id, "in-memory message stored");
        Ok(id)
    }
}

fn target_for(name: &str) -> QueueTarget {
    QueueTarget::new(format!("{URL_PREFIX}{name}"))
}

fn queue_name(target: &QueueTarget) -> Result<&str> {
    target
        .as_str()
        .strip_prefix(URL_PREFIX)
        .ok_or_else(|| QueueError::QueueNotFound(target.to_string()))
}

impl QueueClient for InMemoryClient {
    async fn receive(
        &self,
        target: &QueueTarget,
        request: ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>> {
        let name = queue_name(target)?;
        let deadline = Instant::now() + request.wait;

        loop {
            let notified = self.inner.arrivals.notified();
            tokio::pin!(notified);
            // Register interest before looking at the queue so a send that lands between
            // the check and the wait still wakes us.
            notified.as_mut().enable();

            let next_visible = {
                let mut queues = self.inner.queues.lock();
                let queue = queues
                    .get_mut(name)
                    .ok_or_else(|| QueueError::QueueNotFound(name.to_owned()))?;

                let now = Instant::now();
                let visibility = request
                    .visibility_timeout
                    .unwrap_or(queue.visibility_timeout);
                let received = queue.take_visible(
                    now,
                    request.max_messages,
                    visibility,
                    &self.inner.sequence,
                );
                if !received.is_empty() || now >= deadline {
                    return Ok(received);
                }
                queue.next_visible_at(now)
            };

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn delete_batch(
        &self,
        target: &QueueTarget,
        entries: Vec<DeleteEntry>,
    ) -> Result<Vec<BatchEntryFailure>> {
        let name = queue_name(target)?;
        let mut queues = self.inner.queues.lock();
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_owned()))?;

        let mut failures = Vec::new();
        for entry in entries {
            let position = queue
                .messages
                .iter()
                .position(|m| m.receipt_token.as_deref() == Some(entry.receipt_token.as_str()));
            match position {
                Some(position) => {
                    queue.messages.remove(position);
                }
                None => failures.push(BatchEntryFailure {
                    id: entry.id,
                    code: "ReceiptHandleIsInvalid".to_owned(),
                    message: Some("the receipt handle is not valid".to_owned()),
                    sender_fault: true,
                }),
            }
        }

        Ok(failures)
    }

    async fn change_visibility(
        &self,
        target: &QueueTarget,
        receipt_token: &str,
        timeout: Duration,
    ) -> Result<()> {
        let name = queue_name(target)?;
        {
            let mut queues = self.inner.queues.lock();
            let queue = queues
                .get_mut(name)
                .ok_or_else(|| QueueError::QueueNotFound(name.to_owned()))?;

            let now = Instant::now();
            let message = queue
                .leased_mut(receipt_token, now)
                .ok_or_else(|| QueueError::MessageGone(receipt_token.to_owned()))?;
            message.visible_at = now + timeout;
        }

        if timeout.is_zero() {
            self.inner.arrivals.notify_waiters();
        }
        Ok(())
    }

    async fn send(&self, target: &QueueTarget, message: OutgoingMessage) -> Result<SendResult> {
        let message_id = self.push(target, message)?;
        self.inner.arrivals.notify_waiters();
        Ok(SendResult { message_id })
    }

    async fn send_batch(
        &self,
        target: &QueueTarget,
        entries: Vec<SendEntry>,
    ) -> Result<SendBatchResult> {
        if entries.len() > MAX_BATCH_SIZE {
            return Err(QueueError::Unsupported(
                "a send batch may hold at most 10 entries",
            ));
        }

        let mut result = SendBatchResult::default();
        for SendEntry { id, message } in entries {
            let message_id = self.push(target, message)?;
            result.successful.push(SendSuccess { id, message_id });
        }

        self.inner.arrivals.notify_waiters();
        Ok(result)
    }

    async fn resolve_target(&self, name: &str, _owner_account: Option<&str>) -> Result<QueueTarget> {
        if self.inner.queues.lock().contains_key(name) {
            Ok(target_for(name))
        } else {
            Err(QueueError::QueueNotFound(name.to_owned()))
        }
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<QueueTarget> {
        let visibility_timeout = match attributes.get("VisibilityTimeout") {
            Some(secs) => Duration::from_secs(secs.parse().map_err(QueueError::generic)?),
            None => DEFAULT_VISIBILITY_TIMEOUT,
        };

        self.inner
            .queues
            .lock()
            .entry(name.to_owned())
            .or_insert_with(|| StoredQueue::new(visibility_timeout));
        Ok(target_for(name))
    }

    async fn delete_queue(&self, target: &QueueTarget) -> Result<()> {
        let name = queue_name(target)?;
        self.inner
            .queues
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| QueueError::QueueNotFound(name.to_owned()))
    }
}
