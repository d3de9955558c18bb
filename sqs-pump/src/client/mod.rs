//! The transport seam between the consumer and a queue service.
//!
//! Every operation is an async method returning a `Send` future. Dropping one of those
//! futures cancels the underlying call; the consumer relies on this to abort outstanding
//! long-poll receives.

use std::{collections::HashMap, fmt, future::Future, time::Duration};

use serde::Serialize;

use crate::Result;

#[cfg(feature = "in_memory")]
pub mod in_memory;
#[cfg(feature = "sqs")]
pub mod sqs;

#[cfg(feature = "in_memory")]
pub use in_memory::InMemoryClient;
#[cfg(feature = "sqs")]
pub use sqs::{SqsClient, SqsConfig};

/// The most entries the service accepts in one receive, delete or send batch.
pub const MAX_BATCH_SIZE: usize = 10;

/// The longest long-poll wait the service supports.
pub const MAX_RECEIVE_WAIT: Duration = Duration::from_secs(20);

/// The longest total time a message's lease can be kept alive by renewals.
pub const MAX_LEASE_LIFETIME: Duration = Duration::from_secs(12 * 60 * 60);

/// A resolved queue address, e.g. an SQS queue URL.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct QueueTarget(String);

impl QueueTarget {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReceiveRequest {
    pub max_messages: usize,
    pub wait: Duration,
    /// Overrides the queue's default visibility timeout for the received messages.
    pub visibility_timeout: Option<Duration>,
}

/// One item as returned by the queue service.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReceivedMessage {
    pub id: String,
    pub receipt_token: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
    pub message_attributes: HashMap<String, String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeleteEntry {
    pub id: String,
    pub receipt_token: String,
}

/// A per-entry failure reported inside an otherwise successful batch call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchEntryFailure {
    pub id: String,
    pub code: String,
    pub message: Option<String>,
    pub sender_fault: bool,
}

/// A message to be sent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutgoingMessage {
    pub body: String,
    pub delay: Option<Duration>,
    pub attributes: HashMap<String, String>,
    /// FIFO queues only.
    pub group_id: Option<String>,
    /// FIFO queues only.
    pub deduplication_id: Option<String>,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn json<P: Serialize + ?Sized>(payload: &P) -> Result<Self> {
        Ok(Self::new(serde_json::to_string(payload)?))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_deduplication_id(mut self, deduplication_id: impl Into<String>) -> Self {
        self.deduplication_id = Some(deduplication_id.into());
        self
    }
}

/// An [`OutgoingMessage`] tagged with its batch entry id.
#[derive(Clone, Debug, PartialEq)]
pub struct SendEntry {
    pub id: String,
    pub message: OutgoingMessage,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendResult {
    pub message_id: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendSuccess {
    pub id: String,
    pub message_id: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SendBatchResult {
    pub successful: Vec<SendSuccess>,
    pub failed: Vec<BatchEntryFailure>,
}

pub trait QueueClient: Send + Sync + 'static {
    /// Receives up to `request.max_messages` messages, waiting at most `request.wait`
    /// for the first one to arrive.
    fn receive(
        &self,
        target: &QueueTarget,
        request: ReceiveRequest,
    ) -> impl Future<Output = Result<Vec<ReceivedMessage>>> + Send;

    /// Deletes a batch of messages, returning the entries the service rejected.
    fn delete_batch(
        &self,
        target: &QueueTarget,
        entries: Vec<DeleteEntry>,
    ) -> impl Future<Output = Result<Vec<BatchEntryFailure>>> + Send;

    /// Sets the remaining lease of a message to `timeout` from now.
    ///
    /// Must fail with [`QueueError::MessageGone`](crate::QueueError::MessageGone) when the
    /// message was already deleted or its lease has expired.
    fn change_visibility(
        &self,
        target: &QueueTarget,
        receipt_token: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    fn send(
        &self,
        target: &QueueTarget,
        message: OutgoingMessage,
    ) -> impl Future<Output = Result<SendResult>> + Send;

    fn send_batch(
        &self,
        target: &QueueTarget,
        entries: Vec<SendEntry>,
    ) -> impl Future<Output = Result<SendBatchResult>> + Send;

    /// Looks up the address of a queue by name. Callers are expected to cache the result.
    fn resolve_target(
        &self,
        name: &str,
        owner_account: Option<&str>,
    ) -> impl Future<Output = Result<QueueTarget>> + Send;

    fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> impl Future<Output = Result<QueueTarget>> + Send;

    fn delete_queue(&self, target: &QueueTarget) -> impl Future<Output = Result<()>> + Send;
}
