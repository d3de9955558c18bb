//! Splits outgoing messages into service-sized batches and sends them concurrently.

use std::{collections::HashMap, time::Duration};

use bytesize::ByteSize;
use futures_util::future::try_join_all;

use crate::{
    client::{SendEntry, MAX_BATCH_SIZE},
    context::Context,
    OutgoingMessage, QueueClient, QueueError, Result, SendBatchResult, SendResult,
    MAX_MESSAGE_SIZE,
};

fn check_size(message: &OutgoingMessage) -> Result<()> {
    let size = ByteSize::b(message.body.len() as u64);
    if size > MAX_MESSAGE_SIZE {
        return Err(QueueError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// Applies batch-wide settings to one message. The message's own delay and attributes win.
fn merge(
    mut message: OutgoingMessage,
    delay: Option<Duration>,
    attributes: &HashMap<String, String>,
) -> OutgoingMessage {
    message.delay = message.delay.or(delay);
    for (name, value) in attributes {
        message
            .attributes
            .entry(name.clone())
            .or_insert_with(|| value.clone());
    }
    message
}

pub(crate) async fn send_message<C: QueueClient>(
    ctx: &Context<C>,
    message: OutgoingMessage,
) -> Result<SendResult> {
    check_size(&message)?;
    let target = ctx.target().await?;
    ctx.client.send(&target, message).await
}

/// Sends `messages` in batches of at most ten.
///
/// Each entry's id is its position in `messages`, so results can be matched back to the
/// input. If any batch call fails the whole send fails, though other batches may already
/// have been delivered.
pub(crate) async fn send_messages<C: QueueClient>(
    ctx: &Context<C>,
    messages: Vec<OutgoingMessage>,
    delay: Option<Duration>,
    attributes: &HashMap<String, String>,
) -> Result<SendBatchResult> {
    messages.iter().try_for_each(check_size)?;
    if messages.is_empty() {
        return Ok(SendBatchResult::default());
    }

    let mut chunks: Vec<Vec<SendEntry>> = Vec::new();
    for (i, message) in messages.into_iter().enumerate() {
        if i % MAX_BATCH_SIZE == 0 {
            chunks.push(Vec::with_capacity(MAX_BATCH_SIZE));
        }
        if let Some(chunk) = chunks.last_mut() {
            chunk.push(SendEntry {
                id: i.to_string(),
                message: merge(message, delay, attributes),
            });
        }
    }

    let target = ctx.target().await?;
    tracing::debug!(batches = chunks.len(), "sending messages");
    let results = try_join_all(
        chunks
            .into_iter()
            .map(|chunk| ctx.client.send_batch(&target, chunk)),
    )
    .await?;

    Ok(results
        .into_iter()
        .fold(SendBatchResult::default(), |mut all, result| {
            all.successful.extend(result.successful);
            all.failed.extend(result.failed);
            all
        }))
}
