//! # sqs-pump
//!
//! sqs-pump is a high-throughput consumer and producer for pull-based message queues with
//! Amazon SQS semantics: batched long-poll receives, at-least-once delivery, per-message
//! visibility-timeout leases and batched deletes and sends.
//!
//! A [`Consumer`] keeps a bounded number of messages in flight through your application:
//!
//!   * It polls for batches of messages until the in-flight cap is reached, then pauses
//!     until messages are disposed of.
//!
//!   * Deleting a message frees its slot immediately; the actual delete is coalesced with
//!     others into a batch call that is issued when the batch is full or after a short
//!     debounce.
//!
//!   * Optionally, every in-flight message has its lease renewed shortly before it would
//!     expire, up to a maximum total lifetime.
//!
//! ## Cargo Features
//!
//! Each transport is enabled with its associated cargo feature. Both are enabled by
//! default:
//!
//! * `sqs`: Amazon SQS (or any compatible endpoint) through `aws-sdk-sqs`
//! * `in_memory`: a process-local queue, useful for tests and local development
//!
//! ## How to Use sqs-pump
//!
//! A consumer is built from a [`QueueClient`] and a [`ConsumerConfig`]. Everything the
//! consumer does is reported as an [`Event`] on the streams returned by
//! [`Consumer::subscribe`]:
//!
//! ```no_run
//! # async {
//! use sqs_pump::{client::InMemoryClient, Consumer, Event};
//!
//! let client = InMemoryClient::new();
//! client.create_queue_named("jobs");
//!
//! let consumer = Consumer::builder(client)
//!     .queue_name("jobs")
//!     .max_in_flight(50)
//!     .auto_extend_lease(true)
//!     .build()?;
//!
//! let mut events = consumer.subscribe();
//! consumer.start();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         Event::Message(message) => {
//!             println!("got {}", message.body());
//!             message.delete();
//!         }
//!         Event::Error(e) => eprintln!("queue error: {e}"),
//!         _ => {}
//!     }
//! }
//! # anyhow::Ok(())
//! # };
//! ```
//!
//! Sending goes through the same consumer, which batches and parallelizes large sends:
//!
//! ```no_run
//! # use sqs_pump::{client::InMemoryClient, Consumer, OutgoingMessage};
//! # async {
//! # let consumer = Consumer::builder(InMemoryClient::new()).queue_name("jobs").build()?;
//! #[derive(serde::Serialize)]
//! struct Job {
//!     id: u32,
//! }
//!
//! consumer.send_serde_json(&Job { id: 1 }).await?;
//!
//! let batch = (0..25)
//!     .map(|id| OutgoingMessage::json(&Job { id }))
//!     .collect::<Result<Vec<_>, _>>()?;
//! let result = consumer.send_messages(batch, None).await?;
//! assert!(result.failed.is_empty());
//! # anyhow::Ok(())
//! # };
//! ```
#![warn(unreachable_pub)]

use bytesize::ByteSize;
use thiserror::Error;

pub mod builder;
pub mod client;
pub mod config;
mod consumer;
mod context;
mod delete_batcher;
pub mod events;
mod lease;
mod message;
mod poller;
mod send_batcher;
mod target;
#[cfg(test)]
mod testing;

pub use self::{
    builder::ConsumerBuilder,
    client::{
        BatchEntryFailure, OutgoingMessage, QueueClient, QueueTarget, ReceiveRequest,
        ReceivedMessage, SendBatchResult, SendResult,
    },
    config::{BodyFormat, ConsumerConfig},
    consumer::Consumer,
    events::{DeleteFailure, Event, EventStream},
    message::Message,
};

/// The largest message body the queue service accepts.
pub const MAX_MESSAGE_SIZE: ByteSize = ByteSize::kib(256);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("either a queue URL or a queue name must be configured")]
    MissingQueueIdentity,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// The message was already deleted, or its lease expired, so it can no longer have
    /// its visibility changed.
    #[error("message is no longer in flight: {0}")]
    MessageGone(String),

    #[error("message body of {size} exceeds the maximum of {max}")]
    MessageTooLarge { size: ByteSize, max: ByteSize },

    /// A batch call reported a result for an entry id that was not in the batch.
    #[error("batch entry {id} is unknown: {code}")]
    UnknownBatchEntry { id: String, code: String },

    #[error("(de)serialization error")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Generic(Box<dyn std::error::Error + Send + Sync>),
    #[error("{0}")]
    Unsupported(&'static str),
}

impl QueueError {
    pub fn generic<E: 'static + std::error::Error + Send + Sync>(e: E) -> Self {
        Self::Generic(Box::new(e))
    }

    /// Whether this error means the message targeted by a lease change no longer exists
    /// in flight at the service.
    pub fn is_message_gone(&self) -> bool {
        matches!(self, Self::MessageGone(_))
    }
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
